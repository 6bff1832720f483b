/// One decoded frame from the device.
///
/// Created the moment a valid frame is parsed and handed to the consumer
/// through the sample channel returned by
/// [`crate::bioamp_client::BioAmpClient::start_stream`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    /// Wall-clock time in milliseconds since Unix epoch at which the chunk
    /// carrying this frame arrived.
    ///
    /// Frames from the same chunk share a timestamp; the device itself does
    /// not send one.
    pub timestamp: f64,
    /// Rolling sequence counter from the frame header (wraps at 255).
    pub counter: u8,
    /// Raw ADC readings in channel order, 14-bit effective (0–16383).
    pub channels: Vec<u16>,
}

/// Coarse lifecycle of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connected,
    Streaming,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Disconnected => "disconnected",
            StreamState::Connected => "connected",
            StreamState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Live statistics for the current device session.
///
/// Only the controller writes this; everyone else sees clones or a
/// `watch::Receiver`. It goes back to [`StreamStatus::default`] on
/// disconnect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStatus {
    pub connected: bool,
    pub streaming: bool,
    /// Reply to `WHORU`, when the board sent one.
    pub device_id: Option<String>,
    /// Measured frame rate in Hz, refreshed every few hundred packets.
    /// `0.0` until the first report.
    pub sample_rate: f64,
    /// Frames inferred lost from sequence-counter gaps.
    pub dropped_frames: u64,
    /// Valid frames decoded since connecting.
    pub total_packets: u64,
    /// Candidate frames rejected during resynchronisation.
    pub desync_events: u64,
}

impl StreamStatus {
    pub fn state(&self) -> StreamState {
        if self.streaming {
            StreamState::Streaming
        } else if self.connected {
            StreamState::Connected
        } else {
            StreamState::Disconnected
        }
    }
}

/// Snapshot handed to a [`crate::display::VisualizationSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    /// Filtered samples per channel, oldest first.
    pub per_channel: Vec<Vec<f64>>,
    pub channel_labels: Vec<String>,
    pub is_streaming: bool,
}
