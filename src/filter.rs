//! Per-channel IIR filters for biopotential signals.
//!
//! Every mode is a short cascade of second-order sections designed with the
//! RBJ audio-EQ cookbook formulas and run in Direct Form II transposed:
//!
//! | Mode | Sections |
//! |---|---|
//! | `none` | identity |
//! | `emg` | Butterworth HP 20 Hz → Butterworth LP 450 Hz |
//! | `ecg` | Butterworth HP 0.5 Hz → Butterworth LP 150 Hz |
//! | `eog` | Butterworth HP 0.1 Hz → Butterworth LP 35 Hz |
//! | `eeg` | Butterworth HP 0.5 Hz → Butterworth LP 100 Hz |
//! | `notch50` | notch at 50 Hz, Q = 30 |
//! | `notch60` | notch at 60 Hz, Q = 30 |
//!
//! Butterworth sections use Q = 1/√2. A low-pass corner above
//! `0.45 × sample_rate` is clamped there, so `emg` at 500 Hz becomes a
//! 20–225 Hz band.

use std::f64::consts::{FRAC_1_SQRT_2, PI};
use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::BioAmpError;

/// Q of a notch section.
pub const NOTCH_Q: f64 = 30.0;

/// Highest usable corner as a fraction of the sample rate.
const MAX_CORNER_RATIO: f64 = 0.45;

// ── FilterMode ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    None,
    Emg,
    Ecg,
    Eog,
    Eeg,
    Notch50,
    Notch60,
}

impl FilterMode {
    /// Every mode, in the order a UI should cycle through them.
    pub const ALL: [FilterMode; 7] = [
        FilterMode::None,
        FilterMode::Emg,
        FilterMode::Ecg,
        FilterMode::Eog,
        FilterMode::Eeg,
        FilterMode::Notch50,
        FilterMode::Notch60,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterMode::None => "none",
            FilterMode::Emg => "emg",
            FilterMode::Ecg => "ecg",
            FilterMode::Eog => "eog",
            FilterMode::Eeg => "eeg",
            FilterMode::Notch50 => "notch50",
            FilterMode::Notch60 => "notch60",
        }
    }

    /// The mode after this one in [`ALL`](Self::ALL), wrapping around.
    pub fn next(self) -> FilterMode {
        let i = Self::ALL.iter().position(|m| *m == self).unwrap_or(0);
        Self::ALL[(i + 1) % Self::ALL.len()]
    }

    /// `(high-pass, low-pass)` corners in Hz for the band modes.
    pub fn band(self) -> Option<(f64, f64)> {
        match self {
            FilterMode::Emg => Some((20.0, 450.0)),
            FilterMode::Ecg => Some((0.5, 150.0)),
            FilterMode::Eog => Some((0.1, 35.0)),
            FilterMode::Eeg => Some((0.5, 100.0)),
            _ => None,
        }
    }

    /// Centre frequency for the notch modes.
    pub fn notch(self) -> Option<f64> {
        match self {
            FilterMode::Notch50 => Some(50.0),
            FilterMode::Notch60 => Some(60.0),
            _ => None,
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterMode {
    type Err = BioAmpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        FilterMode::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| BioAmpError::UnknownFilterMode(s.to_owned()))
    }
}

// ── Biquad ────────────────────────────────────────────────────────────────────

/// One second-order section, normalised so `a0 == 1`.
///
/// `H(z) = (b0 + b1·z⁻¹ + b2·z⁻²) / (1 + a1·z⁻¹ + a2·z⁻²)`
#[derive(Debug, Clone, PartialEq)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn from_raw(b: [f64; 3], a: [f64; 3]) -> Self {
        let a0 = a[0];
        Self {
            b0: b[0] / a0,
            b1: b[1] / a0,
            b2: b[2] / a0,
            a1: a[1] / a0,
            a2: a[2] / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn omega(freq: f64, sample_rate: f64, q: f64) -> (f64, f64) {
        let w0 = 2.0 * PI * freq / sample_rate;
        (w0.cos(), w0.sin() / (2.0 * q))
    }

    pub fn lowpass(freq: f64, sample_rate: f64, q: f64) -> Self {
        let (cos, alpha) = Self::omega(freq, sample_rate, q);
        Self::from_raw(
            [(1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    pub fn highpass(freq: f64, sample_rate: f64, q: f64) -> Self {
        let (cos, alpha) = Self::omega(freq, sample_rate, q);
        Self::from_raw(
            [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    pub fn notch(freq: f64, sample_rate: f64, q: f64) -> Self {
        let (cos, alpha) = Self::omega(freq, sample_rate, q);
        Self::from_raw([1.0, -2.0 * cos, 1.0], [1.0 + alpha, -2.0 * cos, 1.0 - alpha])
    }

    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Build the section chain for `mode` at `sample_rate`.
fn design(mode: FilterMode, sample_rate: f64) -> Vec<Biquad> {
    let nyquist_cap = MAX_CORNER_RATIO * sample_rate;
    if let Some((low, high)) = mode.band() {
        let high = high.min(nyquist_cap);
        return vec![
            Biquad::highpass(low, sample_rate, FRAC_1_SQRT_2),
            Biquad::lowpass(high, sample_rate, FRAC_1_SQRT_2),
        ];
    }
    if let Some(centre) = mode.notch() {
        if centre < nyquist_cap {
            return vec![Biquad::notch(centre, sample_rate, NOTCH_Q)];
        }
        debug!("{mode} is above the usable band at {sample_rate} Hz; passing through");
    }
    Vec::new()
}

// ── ChannelFilter ─────────────────────────────────────────────────────────────

/// The filter state of one channel.
#[derive(Debug, Clone)]
pub struct ChannelFilter {
    mode: FilterMode,
    sample_rate: f64,
    sections: Vec<Biquad>,
}

impl ChannelFilter {
    pub fn new(mode: FilterMode, sample_rate: f64) -> Self {
        Self {
            mode,
            sample_rate,
            sections: design(mode, sample_rate),
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Switch mode. Any change starts from zeroed history; setting the
    /// current mode again keeps it.
    pub fn set_mode(&mut self, mode: FilterMode) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        self.sections = design(mode, self.sample_rate);
    }

    pub fn process(&mut self, x: f64) -> f64 {
        self.sections.iter_mut().fold(x, |acc, s| s.process(acc))
    }

    /// Zero the history without changing mode.
    pub fn reset(&mut self) {
        self.sections.iter_mut().for_each(Biquad::reset);
    }
}

// ── FilterBank ────────────────────────────────────────────────────────────────

/// One [`ChannelFilter`] per device channel.
#[derive(Debug, Clone)]
pub struct FilterBank {
    filters: Vec<ChannelFilter>,
}

impl FilterBank {
    pub fn new(channels: usize, sample_rate: f64) -> Self {
        Self {
            filters: (0..channels)
                .map(|_| ChannelFilter::new(FilterMode::None, sample_rate))
                .collect(),
        }
    }

    pub fn channels(&self) -> usize {
        self.filters.len()
    }

    /// Set the mode of one channel. Out-of-range channels are ignored.
    pub fn set_mode(&mut self, channel: usize, mode: FilterMode) {
        if let Some(f) = self.filters.get_mut(channel) {
            f.set_mode(mode);
        }
    }

    pub fn set_all(&mut self, mode: FilterMode) {
        self.filters.iter_mut().for_each(|f| f.set_mode(mode));
    }

    pub fn mode(&self, channel: usize) -> Option<FilterMode> {
        self.filters.get(channel).map(ChannelFilter::mode)
    }

    pub fn modes(&self) -> Vec<FilterMode> {
        self.filters.iter().map(ChannelFilter::mode).collect()
    }

    /// Filter one frame of raw readings. Readings beyond the bank's channel
    /// count are ignored.
    pub fn process(&mut self, raw: &[u16]) -> Vec<f64> {
        self.filters
            .iter_mut()
            .zip(raw)
            .map(|(f, &v)| f.process(f64::from(v)))
            .collect()
    }

    pub fn reset(&mut self) {
        self.filters.iter_mut().for_each(ChannelFilter::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 500.0;

    /// RMS of the filtered sine after the start-up transient has died out.
    fn steady_rms(mode: FilterMode, freq: f64) -> f64 {
        let mut f = ChannelFilter::new(mode, FS);
        let out: Vec<f64> = (0..4000)
            .map(|n| f.process((2.0 * PI * freq * n as f64 / FS).sin()))
            .collect();
        let tail = &out[2000..];
        (tail.iter().map(|y| y * y).sum::<f64>() / tail.len() as f64).sqrt()
    }

    fn assert_passes_over(mode: FilterMode, pass: f64, stop: f64) {
        let p = steady_rms(mode, pass);
        let s = steady_rms(mode, stop);
        assert!(p > 0.5, "{mode}: {pass} Hz should pass, rms {p}");
        assert!(p > 5.0 * s, "{mode}: {pass} Hz rms {p} vs {stop} Hz rms {s}");
    }

    #[test]
    fn eog_keeps_slow_and_cuts_fast() {
        assert_passes_over(FilterMode::Eog, 5.0, 150.0);
    }

    #[test]
    fn emg_cuts_baseline_drift() {
        assert_passes_over(FilterMode::Emg, 100.0, 2.0);
    }

    #[test]
    fn ecg_and_eeg_band_limits() {
        assert_passes_over(FilterMode::Ecg, 10.0, 240.0);
        assert_passes_over(FilterMode::Eeg, 10.0, 230.0);
    }

    #[test]
    fn notches_remove_mains() {
        assert_passes_over(FilterMode::Notch50, 10.0, 50.0);
        assert_passes_over(FilterMode::Notch60, 10.0, 60.0);
        assert!(steady_rms(FilterMode::Notch50, 50.0) < 0.01);
    }

    #[test]
    fn none_is_identity() {
        let mut f = ChannelFilter::new(FilterMode::None, FS);
        for x in [0.0, 8192.0, -3.5, 16383.0, 1e-9] {
            assert_eq!(f.process(x), x);
        }
    }

    #[test]
    fn changing_mode_clears_history() {
        let mut a = ChannelFilter::new(FilterMode::Eeg, FS);
        for _ in 0..100 {
            a.process(8192.0);
        }
        a.set_mode(FilterMode::Ecg);
        a.set_mode(FilterMode::Eeg);

        let mut fresh = ChannelFilter::new(FilterMode::Eeg, FS);
        assert_eq!(a.process(1.0), fresh.process(1.0));
    }

    #[test]
    fn setting_same_mode_keeps_history() {
        let mut a = ChannelFilter::new(FilterMode::Eeg, FS);
        let mut b = ChannelFilter::new(FilterMode::Eeg, FS);
        for _ in 0..50 {
            a.process(100.0);
            b.process(100.0);
        }
        a.set_mode(FilterMode::Eeg);
        assert_eq!(a.process(3.0), b.process(3.0));
    }

    #[test]
    fn reset_matches_fresh_filter() {
        let mut a = ChannelFilter::new(FilterMode::Notch50, FS);
        for n in 0..200 {
            a.process(n as f64);
        }
        a.reset();
        let mut fresh = ChannelFilter::new(FilterMode::Notch50, FS);
        for x in [1.0, 2.0, 3.0] {
            assert_eq!(a.process(x), fresh.process(x));
        }
    }

    #[test]
    fn mode_names_parse_case_insensitively() {
        assert_eq!("EEG".parse::<FilterMode>().unwrap(), FilterMode::Eeg);
        assert_eq!(" notch60 ".parse::<FilterMode>().unwrap(), FilterMode::Notch60);
        assert!(matches!(
            "bandpass".parse::<FilterMode>(),
            Err(BioAmpError::UnknownFilterMode(_))
        ));
        for m in FilterMode::ALL {
            assert_eq!(m.to_string().parse::<FilterMode>().unwrap(), m);
        }
    }

    #[test]
    fn next_cycles_through_every_mode() {
        let mut m = FilterMode::None;
        for _ in 0..FilterMode::ALL.len() {
            m = m.next();
        }
        assert_eq!(m, FilterMode::None);
    }

    #[test]
    fn bank_filters_each_channel_independently() {
        let mut bank = FilterBank::new(3, FS);
        bank.set_mode(1, FilterMode::Eeg);
        bank.set_mode(9, FilterMode::Emg);
        assert_eq!(
            bank.modes(),
            vec![FilterMode::None, FilterMode::Eeg, FilterMode::None]
        );

        let out = bank.process(&[8192, 8192, 8192, 1]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], 8192.0);
        assert_eq!(out[2], 8192.0);
        assert_ne!(out[1], 8192.0);

        bank.set_all(FilterMode::Notch60);
        assert!(bank.modes().iter().all(|m| *m == FilterMode::Notch60));
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&FilterMode::Notch50).unwrap();
        assert_eq!(json, "\"notch50\"");
        let back: FilterMode = serde_json::from_str("\"eog\"").unwrap();
        assert_eq!(back, FilterMode::Eog);
    }
}
