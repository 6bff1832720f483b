//! Error type shared by the transport, controller and recording store.
//!
//! Frame desynchronisation and frame loss are deliberately absent: they are
//! counted in [`crate::types::StreamStatus`] and never surface as errors.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = BioAmpError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BioAmpError {
    // ── Connection ───────────────────────────────────────────────
    /// The host has no serial capability (built without the `serial` feature).
    #[error("serial ports are not supported on this platform")]
    UnsupportedPlatform,

    /// No device matched, the port could not be opened, or access was refused.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A streaming operation was attempted before `connect()`.
    #[error("device is not connected")]
    NotConnected,

    /// A command was written while the port was closed.
    #[error("serial port is not writable")]
    NotWritable,

    /// `start_stream()` was called while a stream is already running.
    #[error("stream is already running")]
    AlreadyStreaming,

    /// The byte stream failed mid-operation.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The background read task panicked or was aborted.
    #[error("stream task failed: {0}")]
    Task(String),

    // ── Recording ────────────────────────────────────────────────
    /// The storage backend rejected an operation.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// An exported table could not be read back.
    #[error("malformed table at line {line}: {reason}")]
    InvalidTable { line: usize, reason: String },

    // ── Filters ──────────────────────────────────────────────────
    #[error("unknown filter mode: {0:?}")]
    UnknownFilterMode(String),
}

impl BioAmpError {
    /// A short, actionable message suitable for showing to an operator.
    pub fn hint(&self) -> &'static str {
        match self {
            BioAmpError::UnsupportedPlatform => {
                "This build has no serial support. Rebuild with the `serial` feature or use --simulate."
            }
            BioAmpError::Connection(_) => {
                "Select the correct port and check that you have permission to open it."
            }
            BioAmpError::NotConnected | BioAmpError::NotWritable => "Connect to a device first.",
            BioAmpError::AlreadyStreaming => "Stop the current stream before starting a new one.",
            BioAmpError::Io(_) | BioAmpError::Task(_) => {
                "The device stopped responding. Check the cable and reconnect."
            }
            BioAmpError::Storage(_) | BioAmpError::Serialization(_) => {
                "The recording could not be saved. Check the storage directory."
            }
            BioAmpError::Archive(_) | BioAmpError::InvalidTable { .. } => {
                "The export could not be completed."
            }
            BioAmpError::UnknownFilterMode(_) => {
                "Valid filters: none, emg, ecg, eog, eeg, notch50, notch60."
            }
        }
    }
}

impl From<tokio::task::JoinError> for BioAmpError {
    fn from(e: tokio::task::JoinError) -> Self {
        BioAmpError::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let e = BioAmpError::Connection("no device on /dev/ttyACM0".into());
        assert!(e.to_string().contains("/dev/ttyACM0"));

        let e = BioAmpError::InvalidTable {
            line: 3,
            reason: "expected 7 columns".into(),
        };
        assert!(e.to_string().contains("line 3"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: BioAmpError = io_err.into();
        assert!(matches!(e, BioAmpError::Io(_)));
    }

    #[test]
    fn connection_hint_is_actionable() {
        let hint = BioAmpError::Connection(String::new()).hint();
        assert!(hint.contains("correct port"));
        assert!(hint.contains("permission"));
    }
}
