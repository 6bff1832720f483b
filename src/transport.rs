//! Byte-stream transport to the device.
//!
//! A [`SerialBackend`] knows how to obtain a port; [`SerialTransport`] owns
//! the open port, split into a command writer and a [`ChunkReader`]. The
//! reader is handed to the stream task while streaming and handed back on
//! stop, so commands can be written while a read is pending.
//!
//! | Backend | When |
//! |---|---|
//! | [`NativeSerial`] | built with the `serial` feature (tokio-serial) |
//! | [`Unsupported`] | built without it; `connect()` fails immediately |
//! | [`crate::simulator::SimulatedDevice`] | demo mode and tests |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::error::{BioAmpError, Result};
use crate::protocol::{encode_command, Command, DEFAULT_BAUD_RATE};

// ── Port abstraction ──────────────────────────────────────────────────────────

/// Anything that can stand in for an open serial port.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

/// An open, type-erased port.
pub type BoxedPort = Box<dyn SerialIo>;

/// Where and how fast to open the port.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port path (e.g. `/dev/ttyACM0`, `COM3`). `None` picks the first USB
    /// serial port found.
    pub port: Option<String>,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Host capability for obtaining a serial port.
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// `false` when this host cannot open serial ports at all.
    fn is_supported(&self) -> bool;

    /// Obtain exclusive access to a port and open it.
    ///
    /// Fails with [`BioAmpError::Connection`] when no device is available or
    /// access is refused.
    async fn request_port(&self, config: &SerialConfig) -> Result<BoxedPort>;
}

/// Backend for builds without serial support.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

#[async_trait]
impl SerialBackend for Unsupported {
    fn is_supported(&self) -> bool {
        false
    }

    async fn request_port(&self, _config: &SerialConfig) -> Result<BoxedPort> {
        Err(BioAmpError::UnsupportedPlatform)
    }
}

// ── Native serial (tokio-serial) ──────────────────────────────────────────────

/// A serial port as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSummary {
    pub name: String,
    /// `"usb"`, `"bluetooth"`, `"pci"` or `"unknown"`.
    pub kind: &'static str,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Serial ports through tokio-serial.
///
/// On Unix the port is opened in exclusive mode, so a second process
/// cannot steal frames from an active session.
#[cfg(feature = "serial")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSerial;

#[cfg(feature = "serial")]
#[async_trait]
impl SerialBackend for NativeSerial {
    fn is_supported(&self) -> bool {
        true
    }

    async fn request_port(&self, config: &SerialConfig) -> Result<BoxedPort> {
        use tokio_serial::SerialPortBuilderExt;

        let path = match &config.port {
            Some(p) => p.clone(),
            None => first_usb_port()?,
        };
        info!("Opening serial port {path} at {} baud", config.baud_rate);
        let port = tokio_serial::new(&path, config.baud_rate)
            .open_native_async()
            .map_err(|e| BioAmpError::Connection(format!("failed to open {path}: {e}")))?;
        Ok(Box::new(port))
    }
}

/// List the serial ports present on this host.
#[cfg(feature = "serial")]
pub fn available_ports() -> Result<Vec<PortSummary>> {
    use tokio_serial::SerialPortType;

    let ports = tokio_serial::available_ports()
        .map_err(|e| BioAmpError::Connection(format!("could not enumerate ports: {e}")))?;
    Ok(ports
        .into_iter()
        .map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => PortSummary {
                name: p.port_name,
                kind: "usb",
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            SerialPortType::BluetoothPort => PortSummary {
                name: p.port_name,
                kind: "bluetooth",
                manufacturer: None,
                product: None,
            },
            SerialPortType::PciPort => PortSummary {
                name: p.port_name,
                kind: "pci",
                manufacturer: None,
                product: None,
            },
            SerialPortType::Unknown => PortSummary {
                name: p.port_name,
                kind: "unknown",
                manufacturer: None,
                product: None,
            },
        })
        .collect())
}

#[cfg(not(feature = "serial"))]
pub fn available_ports() -> Result<Vec<PortSummary>> {
    Err(BioAmpError::UnsupportedPlatform)
}

#[cfg(feature = "serial")]
fn first_usb_port() -> Result<String> {
    available_ports()?
        .into_iter()
        .find(|p| p.kind == "usb")
        .map(|p| p.name)
        .ok_or_else(|| {
            BioAmpError::Connection("no USB serial device found; select the correct port".into())
        })
}

/// The backend for this build: native serial when available.
pub fn default_backend() -> Arc<dyn SerialBackend> {
    #[cfg(feature = "serial")]
    {
        Arc::new(NativeSerial)
    }
    #[cfg(not(feature = "serial"))]
    {
        Arc::new(Unsupported)
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Outcome of one [`ChunkReader::next_chunk`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadEvent<'a> {
    Data(&'a [u8]),
    /// The cancellation token fired while waiting.
    Cancelled,
    /// The device closed the stream.
    Closed,
}

/// Why [`ChunkReader::read_chunks`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    Cancelled,
    Closed,
}

/// Read half of an open port.
pub struct ChunkReader {
    inner: ReadHalf<BoxedPort>,
    buf: Vec<u8>,
}

impl ChunkReader {
    fn new(inner: ReadHalf<BoxedPort>, chunk_size: usize) -> Self {
        Self {
            inner,
            buf: vec![0; chunk_size.max(1)],
        }
    }

    /// Wait for the next chunk of bytes.
    ///
    /// This is the only place the stream pipeline suspends on the device.
    /// Cancelling `cancel` resolves a pending call immediately with
    /// [`ReadEvent::Cancelled`].
    pub async fn next_chunk(&mut self, cancel: &CancellationToken) -> Result<ReadEvent<'_>> {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ReadEvent::Cancelled),
            r = self.inner.read(&mut self.buf) => r?,
        };
        if n == 0 {
            return Ok(ReadEvent::Closed);
        }
        Ok(ReadEvent::Data(&self.buf[..n]))
    }

    /// Deliver chunks to `on_chunk` until cancelled or the device closes.
    pub async fn read_chunks<F>(&mut self, cancel: &CancellationToken, mut on_chunk: F) -> Result<ReadEnd>
    where
        F: FnMut(&[u8]),
    {
        loop {
            match self.next_chunk(cancel).await? {
                ReadEvent::Data(bytes) => on_chunk(bytes),
                ReadEvent::Cancelled => return Ok(ReadEnd::Cancelled),
                ReadEvent::Closed => return Ok(ReadEnd::Closed),
            }
        }
    }

    /// Read the board's one-line reply to `WHORU`.
    ///
    /// Returns `None` if no printable line arrives within `timeout`. Bytes
    /// read while waiting are discarded; the stream has not started yet.
    pub async fn read_identity(&mut self, timeout: Duration) -> Result<Option<String>> {
        let mut line = Vec::new();
        let cancel = CancellationToken::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let event = tokio::select! {
                _ = &mut deadline => return Ok(None),
                ev = self.next_chunk(&cancel) => ev?,
            };
            match event {
                ReadEvent::Data(bytes) => {
                    if let Some(pos) = bytes.iter().position(|&b| b == b'\n') {
                        line.extend_from_slice(&bytes[..pos]);
                        return Ok(parse_identity(&line));
                    }
                    line.extend_from_slice(bytes);
                    if line.len() > 256 {
                        debug!("identification reply too long, giving up");
                        return Ok(None);
                    }
                }
                ReadEvent::Closed => return Ok(None),
                ReadEvent::Cancelled => return Ok(None),
            }
        }
    }
}

fn parse_identity(line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return None;
    }
    Some(text.to_owned())
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Owns the connection to one device.
pub struct SerialTransport {
    backend: Arc<dyn SerialBackend>,
    config: SerialConfig,
    chunk_size: usize,
    writer: Option<WriteHalf<BoxedPort>>,
    reader: Option<ChunkReader>,
}

impl SerialTransport {
    pub fn new(backend: Arc<dyn SerialBackend>, config: SerialConfig, chunk_size: usize) -> Self {
        Self {
            backend,
            config,
            chunk_size,
            writer: None,
            reader: None,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.backend.is_supported()
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Open the port and send the identification command.
    pub async fn connect(&mut self) -> Result<()> {
        if !self.backend.is_supported() {
            return Err(BioAmpError::UnsupportedPlatform);
        }
        if self.is_open() {
            return Ok(());
        }
        let port = self.backend.request_port(&self.config).await?;
        let (read_half, write_half) = tokio::io::split(port);
        self.reader = Some(ChunkReader::new(read_half, self.chunk_size));
        self.writer = Some(write_half);
        if let Err(e) = self.write(Command::Whoru).await {
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Close the port. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.reader = None;
        if let Some(mut w) = self.writer.take() {
            if let Err(e) = w.shutdown().await {
                debug!("shutdown on close: {e}");
            }
        }
    }

    /// Send one newline-terminated command.
    pub async fn write(&mut self, cmd: Command) -> Result<()> {
        let w = self.writer.as_mut().ok_or(BioAmpError::NotWritable)?;
        w.write_all(&encode_command(cmd)).await?;
        w.flush().await?;
        debug!("sent {cmd}");
        Ok(())
    }

    /// Borrow the reader while it is not lent to a stream task.
    pub fn reader_mut(&mut self) -> Option<&mut ChunkReader> {
        self.reader.as_mut()
    }

    /// Lend the reader out (to the stream task).
    pub fn take_reader(&mut self) -> Option<ChunkReader> {
        self.reader.take()
    }

    /// Give back a reader taken with [`take_reader`](Self::take_reader).
    /// Dropped if the port has been closed in the meantime.
    pub fn restore_reader(&mut self, reader: ChunkReader) {
        if self.is_open() {
            self.reader = Some(reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;

    /// Hands out one end of an in-memory pipe; the test keeps the other end.
    struct PipeBackend {
        port: Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl SerialBackend for PipeBackend {
        fn is_supported(&self) -> bool {
            true
        }

        async fn request_port(&self, _config: &SerialConfig) -> Result<BoxedPort> {
            match self.port.lock().await.take() {
                Some(p) => Ok(Box::new(p)),
                None => Err(BioAmpError::Connection("port already taken".into())),
            }
        }
    }

    fn pipe() -> (Arc<dyn SerialBackend>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let backend = PipeBackend {
            port: Mutex::new(Some(ours)),
        };
        (Arc::new(backend), theirs)
    }

    #[tokio::test]
    async fn connect_sends_whoru() {
        let (backend, mut device) = pipe();
        let mut t = SerialTransport::new(backend, SerialConfig::default(), 64);
        t.connect().await.unwrap();
        assert!(t.is_open());

        let mut buf = [0u8; 6];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"WHORU\n");
    }

    #[tokio::test]
    async fn unsupported_backend_fails_fast() {
        let mut t = SerialTransport::new(Arc::new(Unsupported), SerialConfig::default(), 64);
        assert!(matches!(t.connect().await, Err(BioAmpError::UnsupportedPlatform)));
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn write_before_connect_is_not_writable() {
        let (backend, _device) = pipe();
        let mut t = SerialTransport::new(backend, SerialConfig::default(), 64);
        assert!(matches!(t.write(Command::Start).await, Err(BioAmpError::NotWritable)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (backend, _device) = pipe();
        let mut t = SerialTransport::new(backend, SerialConfig::default(), 64);
        t.connect().await.unwrap();
        t.disconnect().await;
        t.disconnect().await;
        assert!(!t.is_open());
        assert!(t.take_reader().is_none());
    }

    #[tokio::test]
    async fn read_chunks_stops_on_close() {
        let (backend, mut device) = pipe();
        let mut t = SerialTransport::new(backend, SerialConfig::default(), 64);
        t.connect().await.unwrap();
        device.write_all(b"abc").await.unwrap();
        drop(device);

        let mut reader = t.take_reader().unwrap();
        let mut seen = Vec::new();
        let end = reader
            .read_chunks(&CancellationToken::new(), |c| seen.extend_from_slice(c))
            .await
            .unwrap();
        assert_eq!(end, ReadEnd::Closed);
        assert_eq!(seen, b"abc");
    }

    #[tokio::test]
    async fn cancel_unblocks_pending_read() {
        let (backend, _device) = pipe();
        let mut t = SerialTransport::new(backend, SerialConfig::default(), 64);
        t.connect().await.unwrap();
        let mut reader = t.take_reader().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let end = reader.read_chunks(&cancel, |_| {}).await.unwrap();
        assert_eq!(end, ReadEnd::Cancelled);
    }

    #[tokio::test]
    async fn identity_line_is_parsed() {
        let (backend, mut device) = pipe();
        let mut t = SerialTransport::new(backend, SerialConfig::default(), 64);
        t.connect().await.unwrap();
        device.write_all(b"RPI-PICO-RP2040\r\n").await.unwrap();

        let id = t
            .reader_mut()
            .unwrap()
            .read_identity(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("RPI-PICO-RP2040"));
    }

    #[tokio::test]
    async fn silent_device_has_no_identity() {
        let (backend, _device) = pipe();
        let mut t = SerialTransport::new(backend, SerialConfig::default(), 64);
        t.connect().await.unwrap();
        let id = t
            .reader_mut()
            .unwrap()
            .read_identity(Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(id, None);
    }

    #[test]
    fn binary_noise_is_not_an_identity() {
        assert_eq!(parse_identity(&[0xC7, 0x7C, 0x01]), None);
        assert_eq!(parse_identity(b"  "), None);
        assert_eq!(parse_identity(b"UNO-R4 "), Some("UNO-R4".into()));
    }
}
