//! Session controller: connect, stream, stop, disconnect.
//!
//! ```text
//! Disconnected ──connect()──▶ Connected ──start_stream()──▶ Streaming
//!      ▲                         │  ▲                           │
//!      └──────disconnect()───────┘  └────────stop_stream()──────┘
//! ```
//!
//! While streaming, a spawned task owns the port's [`ChunkReader`] and the
//! connection's [`Framer`]; decoded samples reach the caller through the
//! bounded channel returned by [`BioAmpClient::start_stream`]. Stopping
//! cancels the task and takes both back.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BioAmpError, Result};
use crate::parse::{Framer, FramerStats};
use crate::protocol::{Command, DEFAULT_SAMPLE_RATE, NUM_CHANNELS};
use crate::transport::{default_backend, ChunkReader, ReadEvent, SerialBackend, SerialConfig, SerialTransport};
use crate::types::{DecodedSample, StreamState, StreamStatus};

// ── BioAmpConfig ──────────────────────────────────────────────────────────────

/// Configuration for [`BioAmpClient`].
#[derive(Debug, Clone)]
pub struct BioAmpConfig {
    /// Port selection and baud rate.
    pub serial: SerialConfig,
    /// ADC channels per frame. Default: `6`.
    pub channels: usize,
    /// Rate the firmware is expected to stream at, in Hz. Used by filters and
    /// recordings; the measured rate is reported separately in
    /// [`StreamStatus::sample_rate`]. Default: `500.0`.
    pub expected_sample_rate: f64,
    /// How long to wait for the reply to `WHORU`. `None` skips the read and
    /// leaves `device_id` empty. Default: 1 s.
    pub identify_timeout: Option<Duration>,
    /// Recompute the measured sample rate every this many packets.
    /// Default: `500`.
    pub rate_report_interval: u64,
    /// Size of a single read from the port. Default: `1024`.
    pub read_chunk_size: usize,
    /// Capacity of the sample channel. When it is full the read task waits,
    /// so a slow consumer throttles the port instead of growing memory.
    /// Default: `4096`.
    pub sample_channel_capacity: usize,
}

impl Default for BioAmpConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            channels: NUM_CHANNELS,
            expected_sample_rate: DEFAULT_SAMPLE_RATE,
            identify_timeout: Some(Duration::from_secs(1)),
            rate_report_interval: 500,
            read_chunk_size: 1024,
            sample_channel_capacity: 4096,
        }
    }
}

// ── Stream task plumbing ──────────────────────────────────────────────────────

/// What the read task hands back when it ends.
struct StreamOutcome {
    reader: ChunkReader,
    framer: Framer,
    end: StreamEnd,
}

#[derive(Debug)]
enum StreamEnd {
    /// `stop_stream()` or `disconnect()` cancelled the task.
    Cancelled,
    /// The consumer dropped its receiver.
    ReceiverDropped,
    /// The device closed the stream.
    Closed,
    Failed(BioAmpError),
}

struct ActiveStream {
    cancel: CancellationToken,
    task: JoinHandle<StreamOutcome>,
}

/// Packets-per-second estimate over a sliding block of packets.
struct RateMeter {
    interval: u64,
    count: u64,
    since: Instant,
}

impl RateMeter {
    fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            count: 0,
            since: Instant::now(),
        }
    }

    /// Count `n` packets; returns a fresh rate once per interval.
    fn tick(&mut self, n: u64) -> Option<f64> {
        self.count += n;
        if self.count < self.interval {
            return None;
        }
        let elapsed = self.since.elapsed().as_secs_f64();
        let rate = (elapsed > 0.0).then(|| self.count as f64 / elapsed);
        self.count = 0;
        self.since = Instant::now();
        rate
    }
}

// ── BioAmpClient ──────────────────────────────────────────────────────────────

/// Controller for one BioAmp/Chords device.
///
/// All methods take `&mut self`: one owner drives the lifecycle, and other
/// tasks observe it through [`subscribe_status`](Self::subscribe_status).
pub struct BioAmpClient {
    config: BioAmpConfig,
    transport: SerialTransport,
    framer: Option<Framer>,
    stream: Option<ActiveStream>,
    status_tx: Arc<watch::Sender<StreamStatus>>,
}

impl BioAmpClient {
    /// Controller using the platform's serial backend.
    pub fn new(config: BioAmpConfig) -> Self {
        Self::with_backend(config, default_backend())
    }

    /// Controller using a specific backend (simulator, test pipe, ...).
    pub fn with_backend(config: BioAmpConfig, backend: Arc<dyn SerialBackend>) -> Self {
        let transport = SerialTransport::new(backend, config.serial.clone(), config.read_chunk_size);
        let (status_tx, _) = watch::channel(StreamStatus::default());
        Self {
            config,
            transport,
            framer: None,
            stream: None,
            status_tx: Arc::new(status_tx),
        }
    }

    pub fn config(&self) -> &BioAmpConfig {
        &self.config
    }

    // ── Status ───────────────────────────────────────────────────────────────

    /// A snapshot of the current status.
    pub fn status(&self) -> StreamStatus {
        self.status_tx.borrow().clone()
    }

    /// Receive every status change, including those made by the read task.
    pub fn subscribe_status(&self) -> watch::Receiver<StreamStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> StreamState {
        self.status_tx.borrow().state()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Open the port, identify the device and get ready to stream.
    ///
    /// A no-op when already connected.
    pub async fn connect(&mut self) -> Result<()> {
        self.reap_finished().await;
        if self.transport.is_open() {
            debug!("connect: already connected");
            return Ok(());
        }

        self.transport.connect().await?;

        let mut device_id = None;
        if let (Some(timeout), Some(reader)) = (self.config.identify_timeout, self.transport.reader_mut()) {
            match reader.read_identity(timeout).await {
                Ok(id) => device_id = id,
                Err(e) => {
                    self.transport.disconnect().await;
                    return Err(e);
                }
            }
        }
        match &device_id {
            Some(id) => info!("Connected to {id}"),
            None => info!("Connected (device did not identify itself)"),
        }

        self.framer = Some(Framer::new(self.config.channels));
        self.status_tx.send_replace(StreamStatus {
            connected: true,
            device_id,
            ..StreamStatus::default()
        });
        Ok(())
    }

    /// Send `START` and begin decoding in a background task.
    ///
    /// Samples arrive on the returned receiver in the order their frames
    /// arrived on the wire. The channel closes when the stream stops.
    pub async fn start_stream(&mut self) -> Result<mpsc::Receiver<DecodedSample>> {
        self.reap_finished().await;
        if !self.transport.is_open() {
            return Err(BioAmpError::NotConnected);
        }
        if self.stream.is_some() {
            return Err(BioAmpError::AlreadyStreaming);
        }

        self.transport.write(Command::Start).await?;

        let (Some(reader), Some(framer)) = (self.transport.take_reader(), self.framer.take()) else {
            return Err(BioAmpError::NotConnected);
        };

        let (tx, rx) = mpsc::channel(self.config.sample_channel_capacity.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_stream(
            reader,
            framer,
            tx,
            Arc::clone(&self.status_tx),
            cancel.clone(),
            self.config.rate_report_interval,
        ));
        self.stream = Some(ActiveStream { cancel, task });
        self.status_tx.send_modify(|s| s.streaming = true);
        info!("Streaming started");
        Ok(rx)
    }

    /// Send `STOP` and end the background task.
    ///
    /// Once this returns no further sample is delivered. A no-op when not
    /// streaming.
    pub async fn stop_stream(&mut self) -> Result<()> {
        let Some(active) = self.stream.take() else {
            return Ok(());
        };

        let write_result = if self.transport.is_open() {
            self.transport.write(Command::Stop).await
        } else {
            Ok(())
        };

        active.cancel.cancel();
        let joined = active.task.await;
        self.status_tx.send_modify(|s| s.streaming = false);
        match joined {
            Ok(outcome) => self.absorb(outcome).await,
            Err(e) => {
                self.close_after_loss().await;
                return Err(e.into());
            }
        }
        info!("Streaming stopped");
        write_result
    }

    /// Stop any stream, close the port and reset the status.
    ///
    /// Safe to call in any state, any number of times.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(active) = self.stream.take() {
            if self.transport.is_open() {
                if let Err(e) = self.transport.write(Command::Stop).await {
                    debug!("disconnect: STOP not delivered: {e}");
                }
            }
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                warn!("disconnect: stream task ended abnormally: {e}");
            }
        }
        self.transport.disconnect().await;
        self.framer = None;
        self.status_tx.send_replace(StreamStatus::default());
        info!("Disconnected");
        Ok(())
    }

    /// Write a raw control command, e.g. [`Command::Status`].
    pub async fn send_command(&mut self, cmd: Command) -> Result<()> {
        if !self.transport.is_open() {
            return Err(BioAmpError::NotConnected);
        }
        self.transport.write(cmd).await
    }

    // ── Private ──────────────────────────────────────────────────────────────

    /// Take back the reader and framer from a finished task. Tears the
    /// connection down if the device went away.
    async fn absorb(&mut self, outcome: StreamOutcome) {
        let StreamOutcome { reader, framer, end } = outcome;
        match end {
            StreamEnd::Cancelled | StreamEnd::ReceiverDropped => {
                self.transport.restore_reader(reader);
                self.framer = Some(framer);
            }
            StreamEnd::Closed => {
                warn!("Device closed the connection");
                self.close_after_loss().await;
            }
            StreamEnd::Failed(e) => {
                warn!("Stream failed: {e}");
                self.close_after_loss().await;
            }
        }
    }

    async fn close_after_loss(&mut self) {
        self.transport.disconnect().await;
        self.framer = None;
        self.status_tx.send_replace(StreamStatus::default());
    }

    /// Collect a task that ended on its own (device lost or receiver
    /// dropped) so the next call sees a consistent state.
    async fn reap_finished(&mut self) {
        let finished = self.stream.as_ref().is_some_and(|s| s.task.is_finished());
        if !finished {
            return;
        }
        if let Some(active) = self.stream.take() {
            self.status_tx.send_modify(|s| s.streaming = false);
            match active.task.await {
                Ok(outcome) => self.absorb(outcome).await,
                Err(e) => {
                    warn!("stream task ended abnormally: {e}");
                    self.close_after_loss().await;
                }
            }
        }
    }
}

// ── Read task ─────────────────────────────────────────────────────────────────

async fn run_stream(
    mut reader: ChunkReader,
    mut framer: Framer,
    tx: mpsc::Sender<DecodedSample>,
    status_tx: Arc<watch::Sender<StreamStatus>>,
    cancel: CancellationToken,
    rate_report_interval: u64,
) -> StreamOutcome {
    let mut meter = RateMeter::new(rate_report_interval);

    let end = 'stream: loop {
        let samples = match reader.next_chunk(&cancel).await {
            Ok(ReadEvent::Data(bytes)) => framer.push(bytes),
            Ok(ReadEvent::Cancelled) => break StreamEnd::Cancelled,
            Ok(ReadEvent::Closed) => break StreamEnd::Closed,
            Err(e) => break StreamEnd::Failed(e),
        };
        if samples.is_empty() {
            continue;
        }

        let n = samples.len() as u64;
        let stats = framer.stats();
        let rate = meter.tick(n);
        status_tx.send_modify(|s| apply_stats(s, stats, rate));

        for sample in samples {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'stream StreamEnd::Cancelled,
                sent = tx.send(sample) => {
                    if sent.is_err() {
                        break 'stream StreamEnd::ReceiverDropped;
                    }
                }
            }
        }
    };

    if matches!(end, StreamEnd::Closed | StreamEnd::Failed(_)) {
        status_tx.send_modify(|s| {
            s.connected = false;
            s.streaming = false;
        });
    }
    debug!("stream task finished: {end:?}");
    StreamOutcome { reader, framer, end }
}

fn apply_stats(status: &mut StreamStatus, stats: FramerStats, rate: Option<f64>) {
    status.total_packets = stats.frames;
    status.dropped_frames = stats.dropped_frames;
    status.desync_events = stats.desync_events;
    if let Some(rate) = rate {
        status.sample_rate = rate;
    }
}
