//! Wire-format constants and control commands for BioAmp/Chords devices.
//!
//! The device streams fixed-length binary frames over a plain serial link:
//!
//! | Offset | Bytes | Field |
//! |---|---|---|
//! | 0 | 1 | Sync marker 1 (`0xC7`) |
//! | 1 | 1 | Sync marker 2 (`0x7C`) |
//! | 2 | 1 | Sequence counter (0–255, wraps) |
//! | 3..14 | 12 | Six channels × 2 bytes, big-endian, 0–16383 |
//! | 15 | 1 | End marker (`0x01`) |
//!
//! Control happens in the other direction with newline-terminated ASCII
//! commands; see [`Command`].

// ── Framing ──────────────────────────────────────────────────────────────────

/// First byte of every frame.
pub const SYNC_BYTE_1: u8 = 0xC7;

/// Second byte of every frame.
pub const SYNC_BYTE_2: u8 = 0x7C;

/// Last byte of every frame.
pub const END_BYTE: u8 = 0x01;

/// Bytes before the first channel value: two sync markers and the counter.
pub const HEADER_LEN: usize = 3;

/// Number of ADC channels on the 6-channel Chords firmware.
pub const NUM_CHANNELS: usize = 6;

/// Total frame length for [`NUM_CHANNELS`] channels (16 bytes).
pub const PACKET_LENGTH: usize = frame_len(NUM_CHANNELS);

/// Frame length for a device with `channels` ADC inputs.
///
/// `header (3) + 2 × channels + end marker (1)`.
pub const fn frame_len(channels: usize) -> usize {
    HEADER_LEN + 2 * channels + 1
}

// ── ADC ──────────────────────────────────────────────────────────────────────

/// Largest value a 14-bit channel reading can take.
pub const ADC_MAX: u16 = 16383;

/// Mid-scale reading; a flat input sits here.
pub const ADC_MIDPOINT: u16 = 8192;

// ── Transport defaults ───────────────────────────────────────────────────────

/// Baud rate used by the Chords firmware.
pub const DEFAULT_BAUD_RATE: u32 = 230_400;

/// Sample rate the firmware is expected to run at, in Hz.
///
/// Boards ship with either 250 Hz or 500 Hz firmware; 500 Hz is the common
/// case for the 6-channel build.
pub const DEFAULT_SAMPLE_RATE: f64 = 500.0;

/// Display labels in channel order.
pub const CHANNEL_LABELS: [&str; NUM_CHANNELS] = ["CH1", "CH2", "CH3", "CH4", "CH5", "CH6"];

/// Label for channel `index`, falling back to `CH<n>` past the built-in table.
pub fn channel_label(index: usize) -> String {
    CHANNEL_LABELS
        .get(index)
        .map(|s| (*s).to_owned())
        .unwrap_or_else(|| format!("CH{}", index + 1))
}

// ── Control commands ─────────────────────────────────────────────────────────

/// ASCII control commands understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask the board to identify itself; it replies with one text line.
    Whoru,
    /// Begin streaming frames.
    Start,
    /// Stop streaming frames.
    Stop,
    /// Query the acquisition state.
    Status,
}

impl Command {
    /// The command keyword as sent on the wire, without the terminator.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Whoru => "WHORU",
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::Status => "STATUS",
        }
    }

    /// Parse a keyword received by a device (used by the simulator).
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word.trim() {
            "WHORU" => Some(Command::Whoru),
            "START" => Some(Command::Start),
            "STOP" => Some(Command::Stop),
            "STATUS" => Some(Command::Status),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode a command for the serial link.
///
/// ```
/// # use bioamp_rs::protocol::{encode_command, Command};
/// assert_eq!(encode_command(Command::Start), b"START\n");
/// ```
pub fn encode_command(cmd: Command) -> Vec<u8> {
    format!("{}\n", cmd.as_str()).into_bytes()
}
