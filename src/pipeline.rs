//! Consumer-side processing of decoded samples.
//!
//! The controller only decodes. A [`SignalPipeline`] owned by the consumer
//! filters each sample, feeds the display buffer and, while recording, the
//! recording store.

use crate::display::{DisplayBuffer, VisualizationSink};
use crate::filter::FilterBank;
use crate::recording::{RecordingStore, SessionStorage};
use crate::types::{DecodedSample, DisplayFrame};

pub struct SignalPipeline<S> {
    pub filters: FilterBank,
    pub display: DisplayBuffer,
    pub recorder: RecordingStore<S>,
}

impl<S: SessionStorage> SignalPipeline<S> {
    /// `display_capacity` samples per channel are kept for drawing.
    pub fn new(channels: usize, sample_rate: f64, display_capacity: usize, storage: S) -> Self {
        Self {
            filters: FilterBank::new(channels, sample_rate),
            display: DisplayBuffer::new(channels, display_capacity),
            recorder: RecordingStore::new(storage),
        }
    }

    /// Filter one sample and route it. Returns the filtered values.
    pub fn ingest(&mut self, sample: &DecodedSample) -> Vec<f64> {
        let filtered = self.filters.process(&sample.channels);
        self.display.push(&filtered);
        self.recorder.append(sample.timestamp, &filtered);
        filtered
    }

    pub fn frame(&self, is_streaming: bool) -> DisplayFrame {
        self.display.snapshot(is_streaming)
    }

    /// Snapshot the display buffer into `sink`.
    pub fn render(&self, sink: &mut dyn VisualizationSink, is_streaming: bool) {
        sink.render(&self.frame(is_streaming));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterMode;
    use crate::recording::MemoryStorage;

    struct Capture(Vec<DisplayFrame>);

    impl VisualizationSink for Capture {
        fn render(&mut self, frame: &DisplayFrame) {
            self.0.push(frame.clone());
        }
    }

    fn sample(ts: f64, v: u16) -> DecodedSample {
        DecodedSample {
            timestamp: ts,
            counter: 0,
            channels: vec![v, v],
        }
    }

    #[test]
    fn unfiltered_samples_reach_display_and_recorder() {
        let mut p = SignalPipeline::new(2, 500.0, 10, MemoryStorage::new());
        p.ingest(&sample(0.0, 100));
        p.recorder.start_recording();
        p.ingest(&sample(2.0, 200));
        p.ingest(&sample(4.0, 300));

        assert_eq!(p.frame(true).per_channel[0], vec![100.0, 200.0, 300.0]);
        let s = p.recorder.stop_recording("r", 2, 500.0).unwrap().unwrap();
        assert_eq!(s.data.len(), 2);
        assert_eq!(s.data[1].channels, vec![300.0, 300.0]);
    }

    #[test]
    fn filter_changes_apply_to_later_samples() {
        let mut p = SignalPipeline::new(2, 500.0, 10, MemoryStorage::new());
        p.filters.set_mode(0, FilterMode::Eeg);
        let out = p.ingest(&sample(0.0, 8192));
        assert_ne!(out[0], 8192.0);
        assert_eq!(out[1], 8192.0);
    }

    #[test]
    fn render_hands_snapshot_to_sink() {
        let mut p = SignalPipeline::new(2, 500.0, 4, MemoryStorage::new());
        p.ingest(&sample(0.0, 1));
        let mut sink = Capture(Vec::new());
        p.render(&mut sink, false);
        assert_eq!(sink.0.len(), 1);
        assert!(!sink.0[0].is_streaming);
    }
}
