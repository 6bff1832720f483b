use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;

use bioamp_rs::bioamp_client::{BioAmpClient, BioAmpConfig};
use bioamp_rs::display::VisualizationSink;
use bioamp_rs::error::BioAmpError;
use bioamp_rs::export::{default_archive_name, export_all_as_archive};
use bioamp_rs::filter::FilterMode;
use bioamp_rs::pipeline::SignalPipeline;
use bioamp_rs::protocol::{Command, DEFAULT_BAUD_RATE, DEFAULT_SAMPLE_RATE, NUM_CHANNELS};
use bioamp_rs::recording::JsonDirStorage;
use bioamp_rs::simulator::SimulatedDevice;
use bioamp_rs::transport::{available_ports, default_backend, SerialBackend, SerialConfig};
use bioamp_rs::types::{DecodedSample, DisplayFrame, StreamStatus};

/// Stream, filter and record biosignals from a BioAmp/Chords board.
#[derive(Parser, Debug)]
#[command(name = "bioamp", version, about)]
struct Cli {
    /// Serial port (e.g. /dev/ttyACM0, COM3). Defaults to the first USB serial port.
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// ADC channels per frame.
    #[arg(long, default_value_t = NUM_CHANNELS)]
    channels: usize,

    /// Expected sample rate in Hz.
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    rate: f64,

    /// Filter applied to every channel at start-up.
    #[arg(short, long, default_value = "none")]
    filter: FilterMode,

    /// Directory where recordings are saved.
    #[arg(long, default_value = "recordings")]
    recordings: PathBuf,

    /// Use the built-in simulated device instead of a serial port.
    #[arg(long)]
    simulate: bool,

    /// With --simulate: skip every n-th frame.
    #[arg(long, requires = "simulate")]
    drop_every: Option<u32>,

    /// List serial ports and exit.
    #[arg(long)]
    list_ports: bool,
}

// ── Console sink ──────────────────────────────────────────────────────────────

/// Prints one line per refresh: the newest filtered value of every channel.
struct ConsoleSink {
    status: StreamStatus,
}

impl VisualizationSink for ConsoleSink {
    fn render(&mut self, frame: &DisplayFrame) {
        if !frame.is_streaming {
            return;
        }
        let values: Vec<String> = frame
            .channel_labels
            .iter()
            .zip(&frame.per_channel)
            .map(|(label, samples)| match samples.last() {
                Some(v) => format!("{label}={v:+9.1}"),
                None => format!("{label}=      ---"),
            })
            .collect();
        let s = &self.status;
        println!(
            "{}  | {:5.1} Hz  pkts={} dropped={} desync={}",
            values.join(" "),
            s.sample_rate,
            s.total_packets,
            s.dropped_frames,
            s.desync_events
        );
    }
}

async fn next_sample(rx: &mut Option<mpsc::Receiver<DecodedSample>>) -> Option<DecodedSample> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn report(e: &BioAmpError) {
    error!("{e}");
    error!("{}", e.hint());
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=bioamp_rs=debug cargo run -- --simulate
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if cli.list_ports {
        for p in available_ports()? {
            let detail = [p.manufacturer.as_deref(), p.product.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            println!("{:20} {:9} {detail}", p.name, p.kind);
        }
        return Ok(());
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = BioAmpConfig {
        serial: SerialConfig {
            port: cli.port.clone(),
            baud_rate: cli.baud,
        },
        channels: cli.channels,
        expected_sample_rate: cli.rate,
        ..BioAmpConfig::default()
    };

    let backend: Arc<dyn SerialBackend> = if cli.simulate {
        let mut sim = SimulatedDevice::new(cli.rate, cli.channels);
        if let Some(n) = cli.drop_every {
            sim = sim.with_drops(n);
        }
        Arc::new(sim)
    } else {
        default_backend()
    };

    // ── Connect ───────────────────────────────────────────────────────────────
    let mut client = BioAmpClient::with_backend(config, backend);
    info!("Connecting …");
    if let Err(e) = client.connect().await {
        report(&e);
        return Err(e.into());
    }
    let mut status_rx = client.subscribe_status();

    let storage = JsonDirStorage::open(&cli.recordings)
        .with_context(|| format!("opening {}", cli.recordings.display()))?;
    let mut pipeline = SignalPipeline::new(cli.channels, cli.rate, (cli.rate * 2.0) as usize, storage);
    pipeline.filters.set_all(cli.filter);

    let mut rx = Some(client.start_stream().await?);
    info!("Streaming started. Type a command + Enter:");
    info!("  q               – quit");
    info!("  p / r           – pause / resume streaming");
    info!("  rec [name]      – start recording, or stop and save");
    info!("  f <mode> [ch]   – filter (none emg ecg eog eeg notch50 notch60)");
    info!("  ls              – list recordings");
    info!("  rm <id> | rm *  – delete one / all recordings");
    info!("  export [file]   – write all recordings to a ZIP archive");
    info!("  s               – send STATUS to the device\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread and relayed to the main loop.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut sink = ConsoleSink {
        status: client.status(),
    };
    let mut refresh = tokio::time::interval(Duration::from_secs(1));

    // ── Main event loop ───────────────────────────────────────────────────────
    loop {
        tokio::select! {
            sample = next_sample(&mut rx) => match sample {
                Some(sample) => {
                    pipeline.ingest(&sample);
                }
                None => {
                    rx = None;
                    if !client.status().connected {
                        warn!("❌  Device disconnected.");
                        break;
                    }
                }
            },
            _ = status_rx.changed() => {
                sink.status = status_rx.borrow_and_update().clone();
            }
            _ = refresh.tick() => {
                pipeline.render(&mut sink, rx.is_some());
            }
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                let mut words = line.split_whitespace();
                match (words.next(), words.next(), words.next()) {
                    (None, ..) => {}
                    (Some("q"), ..) => {
                        info!("Quit requested.");
                        break;
                    }
                    (Some("p"), ..) => match client.stop_stream().await {
                        Ok(()) => {
                            rx = None;
                            info!("Paused.");
                        }
                        Err(e) => report(&e),
                    },
                    (Some("r"), ..) => match client.start_stream().await {
                        Ok(new_rx) => {
                            rx = Some(new_rx);
                            info!("Resumed.");
                        }
                        Err(e) => report(&e),
                    },
                    (Some("rec"), name, _) => {
                        // A failed save leaves samples buffered; `rec` retries it.
                        if pipeline.recorder.is_recording() || pipeline.recorder.buffered() > 0 {
                            let count = pipeline.recorder.list_recordings().map(|l| l.len()).unwrap_or(0);
                            let name = name.map(str::to_owned).unwrap_or_else(|| format!("Recording {}", count + 1));
                            match pipeline.recorder.stop_recording(&name, cli.channels, cli.rate) {
                                Ok(Some(s)) => info!("Saved {} ({:.1} s) as {}", s.name, s.duration_seconds, s.id),
                                Ok(None) => info!("Nothing recorded."),
                                Err(e) => {
                                    report(&e);
                                    info!("Samples kept; type `rec` again to retry.");
                                }
                            }
                        } else {
                            pipeline.recorder.start_recording();
                            info!("Recording … type `rec` again to stop.");
                        }
                    }
                    (Some("f"), Some(mode), channel) => match mode.parse::<FilterMode>() {
                        Ok(mode) => match channel.and_then(|c| c.parse::<usize>().ok()) {
                            Some(ch) if ch >= 1 => {
                                pipeline.filters.set_mode(ch - 1, mode);
                                info!("CH{ch} filter: {mode}");
                            }
                            _ => {
                                pipeline.filters.set_all(mode);
                                info!("All channels filter: {mode}");
                            }
                        },
                        Err(e) => report(&e),
                    },
                    (Some("ls"), ..) => match pipeline.recorder.list_recordings() {
                        Ok(list) if list.is_empty() => println!("No recordings."),
                        Ok(list) => {
                            for s in list {
                                println!(
                                    "{}  {:24} {:6.1} s  {} ch  {} samples",
                                    s.id, s.name, s.duration_seconds, s.channels, s.data.len()
                                );
                            }
                        }
                        Err(e) => report(&e),
                    },
                    (Some("rm"), Some("*"), _) => match pipeline.recorder.delete_all_recordings() {
                        Ok(()) => info!("All recordings deleted."),
                        Err(e) => report(&e),
                    },
                    (Some("rm"), Some(id), _) => match pipeline.recorder.delete_recording(id) {
                        Ok(()) => info!("Deleted {id}."),
                        Err(e) => report(&e),
                    },
                    (Some("export"), path, _) => {
                        let path = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default_archive_name()));
                        let written = pipeline
                            .recorder
                            .list_recordings()
                            .and_then(|list| export_all_as_archive(&list).map(|bytes| (list.len(), bytes)));
                        match written {
                            Ok((n, bytes)) => match std::fs::write(&path, bytes) {
                                Ok(()) => info!("Exported {n} recording(s) to {}", path.display()),
                                Err(e) => error!("Could not write {}: {e}", path.display()),
                            },
                            Err(e) => report(&e),
                        }
                    }
                    (Some("s"), ..) => {
                        if let Err(e) = client.send_command(Command::Status).await {
                            report(&e);
                        }
                    }
                    (Some(other), ..) => warn!("Unknown command {other:?}"),
                }
            }
        }
    }

    client.disconnect().await?;
    info!("Event loop finished – exiting.");
    Ok(())
}
