//! Live display buffers and the sink interface that renders them.

use std::collections::VecDeque;

use crate::protocol::channel_label;
use crate::types::DisplayFrame;

/// Anything that can draw a [`DisplayFrame`]: a terminal chart, a console
/// line, a test recorder.
pub trait VisualizationSink {
    fn render(&mut self, frame: &DisplayFrame);
}

/// Fixed-capacity ring buffer of filtered samples per channel.
#[derive(Debug, Clone)]
pub struct DisplayBuffer {
    capacity: usize,
    labels: Vec<String>,
    channels: Vec<VecDeque<f64>>,
}

impl DisplayBuffer {
    /// `capacity` samples per channel, labelled `CH1`, `CH2`, ….
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self::with_labels((0..channels).map(channel_label).collect(), capacity)
    }

    pub fn with_labels(labels: Vec<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            channels: labels.iter().map(|_| VecDeque::with_capacity(capacity)).collect(),
            labels,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Samples currently held for `channel`, oldest first.
    pub fn channel(&self, channel: usize) -> Option<&VecDeque<f64>> {
        self.channels.get(channel)
    }

    /// Samples held per channel (all channels fill in lockstep).
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one frame of filtered values, evicting the oldest when full.
    ///
    /// Missing values are padded with `0.0` so channels stay aligned.
    pub fn push(&mut self, values: &[f64]) {
        for (i, buf) in self.channels.iter_mut().enumerate() {
            if buf.len() == self.capacity {
                buf.pop_front();
            }
            buf.push_back(values.get(i).copied().unwrap_or(0.0));
        }
    }

    pub fn clear(&mut self) {
        self.channels.iter_mut().for_each(VecDeque::clear);
    }

    pub fn snapshot(&self, is_streaming: bool) -> DisplayFrame {
        DisplayFrame {
            per_channel: self
                .channels
                .iter()
                .map(|b| b.iter().copied().collect())
                .collect(),
            channel_labels: self.labels.clone(),
            is_streaming,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let mut d = DisplayBuffer::new(2, 3);
        for v in 0..5 {
            d.push(&[v as f64, -(v as f64)]);
        }
        let f = d.snapshot(true);
        assert_eq!(f.per_channel[0], vec![2.0, 3.0, 4.0]);
        assert_eq!(f.per_channel[1], vec![-2.0, -3.0, -4.0]);
        assert_eq!(f.channel_labels, vec!["CH1", "CH2"]);
        assert!(f.is_streaming);
    }

    #[test]
    fn short_frames_are_padded() {
        let mut d = DisplayBuffer::new(3, 4);
        d.push(&[1.0]);
        assert_eq!(d.channel(2).unwrap().back(), Some(&0.0));
        assert_eq!(d.len(), 1);
        d.clear();
        assert!(d.is_empty());
    }
}
