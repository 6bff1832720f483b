//! Frame decoder for the BioAmp/Chords serial byte stream.
//!
//! The serial link delivers bytes in arbitrary chunks: a frame can be split
//! across reads, several frames can arrive at once, and a read may start in
//! the middle of a frame. [`Framer`] owns the accumulator that stitches
//! chunks together, locates frames by their sync markers, and resynchronises
//! one byte at a time when a candidate frame fails validation.
//!
//! | Item | Purpose |
//! |---|---|
//! | [`decode_frame`] | validate and decode exactly one frame |
//! | [`encode_frame`] | build a frame (simulator, tests) |
//! | [`SequenceTracker`] | wrap-aware dropped-frame accounting |
//! | [`Framer`] | chunk accumulator and resynchronisation |
//!
//! All functions here are pure apart from [`Framer::push`], which reads the
//! wall clock to stamp samples.

use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::protocol::{frame_len, END_BYTE, HEADER_LEN, SYNC_BYTE_1, SYNC_BYTE_2};
use crate::types::DecodedSample;

// ── Timestamp helper ──────────────────────────────────────────────────────────

/// Milliseconds since Unix epoch as `f64`.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

// ── Single frames ─────────────────────────────────────────────────────────────

/// Counter and channel values carried by one valid frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub counter: u8,
    pub channels: Vec<u16>,
}

/// Decode one frame for a device with `channels` inputs.
///
/// Returns `None` unless `bytes` is exactly [`frame_len`]`(channels)` long,
/// starts with both sync markers, and ends with the end marker.
pub fn decode_frame(bytes: &[u8], channels: usize) -> Option<RawFrame> {
    let len = frame_len(channels);
    if bytes.len() != len
        || bytes[0] != SYNC_BYTE_1
        || bytes[1] != SYNC_BYTE_2
        || bytes[len - 1] != END_BYTE
    {
        return None;
    }
    let values = bytes[HEADER_LEN..len - 1]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    Some(RawFrame {
        counter: bytes[2],
        channels: values,
    })
}

/// Build a frame carrying `counter` and `channels` (big-endian values).
///
/// ```
/// # use bioamp_rs::parse::{decode_frame, encode_frame};
/// let frame = encode_frame(7, &[1, 2, 3, 4, 5, 6]);
/// assert_eq!(frame.len(), 16);
/// assert_eq!(decode_frame(&frame, 6).unwrap().channels, vec![1, 2, 3, 4, 5, 6]);
/// ```
pub fn encode_frame(counter: u8, channels: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame_len(channels.len()));
    out.extend_from_slice(&[SYNC_BYTE_1, SYNC_BYTE_2, counter]);
    for v in channels {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out.push(END_BYTE);
    out
}

// ── Sequence accounting ───────────────────────────────────────────────────────

/// Detects dropped frames from the rolling 8-bit sequence counter.
///
/// The first counter after construction (or [`reset`](Self::reset)) only
/// anchors the tracker. Every later counter is compared with
/// `(previous + 1) mod 256`; the difference is the number of frames lost in
/// between. A repeated counter therefore counts as 255 lost frames, the same
/// as a full wrap.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    last: Option<u8>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `counter` and return how many frames were skipped before it.
    pub fn observe(&mut self, counter: u8) -> u32 {
        let gap = match self.last {
            Some(prev) => counter.wrapping_sub(prev).wrapping_sub(1) as u32,
            None => 0,
        };
        self.last = Some(counter);
        gap
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

// ── Framer ────────────────────────────────────────────────────────────────────

/// Running totals kept by a [`Framer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Valid frames emitted.
    pub frames: u64,
    /// Frames inferred lost from counter gaps.
    pub dropped_frames: u64,
    /// Sync candidates that failed validation.
    pub desync_events: u64,
    /// Bytes thrown away while searching for a sync marker.
    pub discarded_bytes: u64,
}

/// Reassembles frames from an arbitrarily chunked byte stream.
///
/// One `Framer` belongs to one connection; create a new one on reconnect.
/// The accumulator never holds more than one frame length plus the latest
/// chunk: bytes that cannot start a frame are dropped as soon as they are
/// seen, and when no sync marker is present only the last
/// `frame_len − 1` bytes are kept in case they hold the start of one.
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    channels: usize,
    frame_len: usize,
    sequence: SequenceTracker,
    stats: FramerStats,
}

impl Framer {
    /// Create a framer for a device with `channels` ADC inputs.
    pub fn new(channels: usize) -> Self {
        let frame_len = frame_len(channels);
        Self {
            buffer: Vec::with_capacity(frame_len * 64),
            channels,
            frame_len,
            sequence: SequenceTracker::new(),
            stats: FramerStats::default(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Number of bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and return every frame it completes, stamped with the
    /// current wall-clock time.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedSample> {
        self.push_at(chunk, now_ms())
    }

    /// Like [`push`](Self::push) with an explicit capture timestamp.
    pub fn push_at(&mut self, chunk: &[u8], timestamp: f64) -> Vec<DecodedSample> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(sample) = self.next_sample(timestamp) {
            out.push(sample);
        }
        out
    }

    /// Decode the next complete frame from the accumulator, if there is one.
    fn next_sample(&mut self, timestamp: f64) -> Option<DecodedSample> {
        while self.buffer.len() >= self.frame_len {
            let Some(start) = find_sync(&self.buffer) else {
                // Keep a tail that may hold the beginning of a sync marker.
                let excess = self.buffer.len() - (self.frame_len - 1);
                self.discard(excess);
                return None;
            };
            if start > 0 {
                self.discard(start);
            }
            if self.buffer.len() < self.frame_len {
                return None;
            }

            match decode_frame(&self.buffer[..self.frame_len], self.channels) {
                Some(frame) => {
                    self.buffer.drain(..self.frame_len);
                    let gap = self.sequence.observe(frame.counter);
                    if gap > 0 {
                        debug!("counter jumped to {}: {gap} frame(s) lost", frame.counter);
                    }
                    self.stats.frames += 1;
                    self.stats.dropped_frames += gap as u64;
                    return Some(DecodedSample {
                        timestamp,
                        counter: frame.counter,
                        channels: frame.channels,
                    });
                }
                None => {
                    // False sync inside channel data: step past it and rescan.
                    self.stats.desync_events += 1;
                    self.discard(1);
                }
            }
        }
        None
    }

    fn discard(&mut self, n: usize) {
        self.buffer.drain(..n);
        self.stats.discarded_bytes += n as u64;
    }
}

/// Offset of the first `SYNC_BYTE_1, SYNC_BYTE_2` pair in `buf`.
fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w[0] == SYNC_BYTE_1 && w[1] == SYNC_BYTE_2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NUM_CHANNELS;

    fn frames(counters: impl IntoIterator<Item = u8>) -> Vec<u8> {
        counters
            .into_iter()
            .flat_map(|c| encode_frame(c, &[c as u16, 100, 200, 300, 400, 16383]))
            .collect()
    }

    #[test]
    fn decode_frame_rejects_bad_markers() {
        let mut f = encode_frame(1, &[0; NUM_CHANNELS]);
        assert!(decode_frame(&f, NUM_CHANNELS).is_some());
        f[15] = 0x02;
        assert!(decode_frame(&f, NUM_CHANNELS).is_none());
        let mut f = encode_frame(1, &[0; NUM_CHANNELS]);
        f[1] = 0x00;
        assert!(decode_frame(&f, NUM_CHANNELS).is_none());
        assert!(decode_frame(&f[..15], NUM_CHANNELS).is_none());
    }

    #[test]
    fn decode_frame_is_big_endian() {
        let f = encode_frame(9, &[0x1234, 0, 0, 0, 0, 0x3FFF]);
        assert_eq!(&f[3..5], &[0x12, 0x34]);
        let raw = decode_frame(&f, NUM_CHANNELS).unwrap();
        assert_eq!(raw.counter, 9);
        assert_eq!(raw.channels[0], 0x1234);
        assert_eq!(raw.channels[5], 16383);
    }

    #[test]
    fn every_split_point_yields_all_frames() {
        let stream = frames(0..10);
        for split in 1..stream.len() {
            let mut framer = Framer::new(NUM_CHANNELS);
            let mut out = framer.push_at(&stream[..split], 0.0);
            out.extend(framer.push_at(&stream[split..], 0.0));
            assert_eq!(out.len(), 10, "split at {split}");
            for (i, s) in out.iter().enumerate() {
                assert_eq!(s.counter, i as u8);
                assert_eq!(s.channels, vec![i as u16, 100, 200, 300, 400, 16383]);
            }
        }
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let stream = frames(0..5);
        let mut framer = Framer::new(NUM_CHANNELS);
        let n: usize = stream.iter().map(|b| framer.push_at(&[*b], 0.0).len()).sum();
        assert_eq!(n, 5);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn spurious_sync_in_leading_data_is_skipped() {
        // A fake frame start followed too closely by the genuine frame.
        let mut stream = vec![0x00, SYNC_BYTE_1, SYNC_BYTE_2, 0x05, 0x10, 0x20];
        stream.extend(encode_frame(42, &[1, 2, 3, 4, 5, 6]));
        let mut framer = Framer::new(NUM_CHANNELS);
        let out = framer.push_at(&stream, 0.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].counter, 42);
        assert_eq!(out[0].channels, vec![1, 2, 3, 4, 5, 6]);
        assert!(framer.stats().desync_events >= 1);
    }

    #[test]
    fn sync_pattern_inside_channel_data_is_harmless() {
        // Channel values that contain 0xC7 0x7C must not confuse framing.
        let stream: Vec<u8> = (0..3u8)
            .flat_map(|c| encode_frame(c, &[0xC77C, 0x7CC7, 0xC77C, 0, 0, 0]))
            .collect();
        let mut framer = Framer::new(NUM_CHANNELS);
        let out = framer.push_at(&stream, 0.0);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|s| s.channels[0] == 0xC77C));
        assert_eq!(framer.stats().desync_events, 0);
    }

    #[test]
    fn garbage_without_sync_is_trimmed() {
        let mut framer = Framer::new(NUM_CHANNELS);
        assert!(framer.push_at(&[0xAA; 1000], 0.0).is_empty());
        assert_eq!(framer.buffered(), 15);
        // A frame arriving after the noise still decodes.
        let out = framer.push_at(&encode_frame(3, &[7; NUM_CHANNELS]), 0.0);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let f = encode_frame(1, &[5; NUM_CHANNELS]);
        let mut framer = Framer::new(NUM_CHANNELS);
        let mut stream = vec![0x00; 10];
        stream.extend_from_slice(&f[..8]);
        assert!(framer.push_at(&stream, 0.0).is_empty());
        assert_eq!(framer.push_at(&f[8..], 0.0).len(), 1);
    }

    #[test]
    fn counter_gaps_count_missing_frames() {
        let mut framer = Framer::new(NUM_CHANNELS);
        framer.push_at(&frames([5, 6, 9, 10]), 0.0);
        assert_eq!(framer.stats().dropped_frames, 2);
        assert_eq!(framer.stats().frames, 4);
    }

    #[test]
    fn counter_wrap_is_not_a_gap() {
        let mut framer = Framer::new(NUM_CHANNELS);
        framer.push_at(&frames([254, 255, 0, 1]), 0.0);
        assert_eq!(framer.stats().dropped_frames, 0);
    }

    #[test]
    fn gap_across_wrap() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(250), 0);
        assert_eq!(t.observe(2), 7);
        assert_eq!(t.observe(2), 255);
        t.reset();
        assert_eq!(t.observe(100), 0);
    }

    #[test]
    fn samples_carry_push_timestamp() {
        let mut framer = Framer::new(NUM_CHANNELS);
        let out = framer.push_at(&frames([1, 2]), 1234.5);
        assert!(out.iter().all(|s| s.timestamp == 1234.5));
    }
}
