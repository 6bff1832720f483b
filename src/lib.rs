//! # bioamp-rs
//!
//! Async Rust library and terminal UI for streaming biosignals from
//! BioAmp/Chords serial devices.
//!
//! ## Supported hardware
//!
//! | Board firmware | Channels | Rate | Baud |
//! |---|---|---|---|
//! | Chords 6-channel (Arduino UNO R4, RP2040, ...) | 6 | 500 Hz | 230400 |
//! | Other channel counts | set [`bioamp_client::BioAmpConfig::channels`] | any | any |
//!
//! The board streams 16-byte frames (`C7 7C counter ch1..ch6 01`) after it
//! receives `START\n`. The decoder resynchronises after corrupted bytes and
//! counts frames lost to sequence gaps; neither stops the stream.
//!
//! ## Quick start
//!
//! ```no_run
//! use bioamp_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut client = BioAmpClient::new(BioAmpConfig::default());
//!     client.connect().await?;
//!     let mut rx = client.start_stream().await?;
//!
//!     let mut filters = FilterBank::new(NUM_CHANNELS, DEFAULT_SAMPLE_RATE);
//!     filters.set_all(FilterMode::Eeg);
//!
//!     while let Some(sample) = rx.recv().await {
//!         let filtered = filters.process(&sample.channels);
//!         println!("#{:3} {:?}", sample.counter, filtered);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! No board at hand? Swap the backend for the built-in simulator:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use bioamp_rs::prelude::*;
//! # async fn demo() -> bioamp_rs::error::Result<()> {
//! let mut client = BioAmpClient::with_backend(
//!     BioAmpConfig::default(),
//!     Arc::new(SimulatedDevice::default()),
//! );
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using as a library dependency
//!
//! ```toml
//! [dependencies]
//! # Full build (serial ports and the ratatui TUI):
//! bioamp-rs = "0.1"
//!
//! # Library with serial support, no ratatui / crossterm:
//! bioamp-rs = { version = "0.1", default-features = false, features = ["serial"] }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`bioamp_client`] | Connect / start / stop / disconnect and the live [`types::StreamStatus`] |
//! | [`transport`] | Serial backends and the port reader/writer |
//! | [`parse`] | Frame decoder with resynchronisation and loss accounting |
//! | [`protocol`] | Wire constants and control commands |
//! | [`filter`] | EMG / ECG / EOG / EEG band filters and mains notches |
//! | [`recording`] | Recording buffer and session storage |
//! | [`export`] | CSV tables and ZIP archives of sessions |
//! | [`display`] | Ring buffers for live charts and the sink trait |
//! | [`pipeline`] | Filter → display → recorder routing for each sample |
//! | [`simulator`] | In-process demo device |
//! | [`types`] | Shared data types |
//! | [`error`] | The crate error type |

pub mod bioamp_client;
pub mod display;
pub mod error;
pub mod export;
pub mod filter;
pub mod parse;
pub mod pipeline;
pub mod protocol;
pub mod recording;
pub mod simulator;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::bioamp_client::{BioAmpClient, BioAmpConfig};
    pub use crate::simulator::SimulatedDevice;
    pub use crate::transport::{SerialBackend, SerialConfig};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::error::BioAmpError;
    pub use crate::types::{DecodedSample, DisplayFrame, StreamState, StreamStatus};

    // ── Processing ────────────────────────────────────────────────────────────
    pub use crate::display::{DisplayBuffer, VisualizationSink};
    pub use crate::filter::{FilterBank, FilterMode};
    pub use crate::pipeline::SignalPipeline;
    pub use crate::recording::{
        JsonDirStorage, MemoryStorage, RecordingSession, RecordingStore, SessionStorage,
    };

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{Command, DEFAULT_BAUD_RATE, DEFAULT_SAMPLE_RATE, NUM_CHANNELS};
}
