//! In-process stand-in for a BioAmp board.
//!
//! [`SimulatedDevice`] is a [`SerialBackend`] whose "port" is one end of a
//! `tokio::io::duplex` pipe. A spawned task on the other end speaks the
//! firmware's control protocol and, between `START` and `STOP`, writes
//! frames of synthetic EEG-like data at the configured rate.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::error::Result;
use crate::parse::encode_frame;
use crate::protocol::{Command, ADC_MAX, ADC_MIDPOINT, DEFAULT_SAMPLE_RATE, NUM_CHANNELS};
use crate::transport::{BoxedPort, SerialBackend, SerialConfig};

/// Identification line returned for `WHORU`.
pub const SIMULATOR_ID: &str = "BIOAMP-SIM";

/// Frames are written in batches on this period rather than one by one.
const TICK: Duration = Duration::from_millis(20);

/// Demo device backend.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub sample_rate: f64,
    pub channels: usize,
    /// Skip every n-th frame (counter still advances) to exercise the
    /// dropped-frame accounting.
    pub drop_every: Option<u32>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: NUM_CHANNELS,
            drop_every: None,
        }
    }
}

impl SimulatedDevice {
    pub fn new(sample_rate: f64, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            drop_every: None,
        }
    }

    pub fn with_drops(mut self, every: u32) -> Self {
        self.drop_every = (every > 0).then_some(every);
        self
    }
}

#[async_trait]
impl SerialBackend for SimulatedDevice {
    fn is_supported(&self) -> bool {
        true
    }

    async fn request_port(&self, _config: &SerialConfig) -> Result<BoxedPort> {
        let (host, device) = tokio::io::duplex(8 * 1024);
        info!(
            "Simulated device: {} channels at {} Hz",
            self.channels, self.sample_rate
        );
        tokio::spawn(run_device(device, self.clone()));
        Ok(Box::new(host))
    }
}

/// Synthetic reading for channel `ch` at time `t` seconds.
///
/// Alpha-band sinusoid plus a slower drift, distinct per channel, centred on
/// the ADC midpoint.
pub fn sim_sample(t: f64, ch: usize) -> u16 {
    use std::f64::consts::PI;

    let phase = ch as f64 * PI / 3.0;
    let alpha = 1500.0 * (2.0 * PI * 10.0 * t + phase).sin();
    let drift = 600.0 * (2.0 * PI * 1.2 * t + 2.0 * phase).sin();
    let beta = 250.0 * (2.0 * PI * 22.0 * t + phase).sin();
    let v = ADC_MIDPOINT as f64 + alpha + drift + beta;
    v.round().clamp(0.0, ADC_MAX as f64) as u16
}

async fn run_device(port: DuplexStream, cfg: SimulatedDevice) {
    let (read_half, mut write_half) = tokio::io::split(port);
    let mut lines = BufReader::new(read_half).lines();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let per_tick = cfg.sample_rate * TICK.as_secs_f64();
    let mut streaming = false;
    let mut counter: u8 = 0;
    let mut sample_index: u64 = 0;
    let mut owed = 0.0f64;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    debug!("simulated device: host closed the port");
                    return;
                };
                let reply = match Command::from_keyword(&line) {
                    Some(Command::Whoru) => Some(format!("{SIMULATOR_ID}\n")),
                    Some(Command::Start) => {
                        streaming = true;
                        owed = 0.0;
                        None
                    }
                    Some(Command::Stop) => {
                        streaming = false;
                        None
                    }
                    // Text replies would corrupt the binary stream while running.
                    Some(Command::Status) if !streaming => Some("STOPPED\n".to_owned()),
                    Some(Command::Status) => None,
                    None => {
                        debug!("simulated device: ignoring {line:?}");
                        None
                    }
                };
                if let Some(reply) = reply {
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            _ = ticker.tick(), if streaming => {
                owed += per_tick;
                let due = owed.floor() as u64;
                owed -= due as f64;

                let mut batch = Vec::new();
                for _ in 0..due {
                    let t = sample_index as f64 / cfg.sample_rate;
                    sample_index += 1;
                    let skip = cfg
                        .drop_every
                        .is_some_and(|n| sample_index % u64::from(n) == 0);
                    if !skip {
                        let values: Vec<u16> = (0..cfg.channels).map(|ch| sim_sample(t, ch)).collect();
                        batch.extend_from_slice(&encode_frame(counter, &values));
                    }
                    counter = counter.wrapping_add(1);
                }
                if !batch.is_empty() && write_half.write_all(&batch).await.is_err() {
                    return;
                }
            }
        }
    }
}
