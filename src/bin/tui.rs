//! Real-time chart viewer for BioAmp/Chords boards.
//!
//! Usage:
//!   cargo run --bin tui                          # first USB serial port
//!   cargo run --bin tui -- --port /dev/ttyACM0   # a specific port
//!   cargo run --bin tui -- --simulate            # built-in simulated board
//!
//! Keys (streaming view)
//! ---------------------
//!   Tab      open serial port picker
//!   n        connect now (after a manual disconnect)
//!   f        cycle filter on all channels
//!   Space    start recording / stop and save
//!   x        export all recordings to a ZIP archive
//!   +  / =   zoom out
//!   -        zoom in
//!   a        auto-scale: fit Y axis to current peak amplitude
//!   v        toggle smooth overlay (dim raw + bright 9-pt moving-average)
//!   p        pause streaming   (sends STOP)
//!   r        resume streaming  (sends START)
//!   c        clear waveform buffers
//!   d        disconnect
//!   q / Esc  quit
//!
//! Keys (port picker overlay)
//! --------------------------
//!   ↑ / ↓   navigate list
//!   Enter    connect to highlighted port
//!   s        refresh the port list
//!   Esc      close picker

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout, Margin, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{
        Axis, Block, Borders, Chart, Clear, Dataset, GraphType, List, ListItem, ListState,
        Paragraph,
    },
    Frame, Terminal,
};
use tokio::sync::{mpsc, oneshot, watch};

use bioamp_rs::bioamp_client::{BioAmpClient, BioAmpConfig};
use bioamp_rs::error::BioAmpError;
use bioamp_rs::export::{default_archive_name, export_all_as_archive};
use bioamp_rs::filter::FilterMode;
use bioamp_rs::pipeline::SignalPipeline;
use bioamp_rs::protocol::{DEFAULT_BAUD_RATE, DEFAULT_SAMPLE_RATE, NUM_CHANNELS};
use bioamp_rs::recording::JsonDirStorage;
use bioamp_rs::simulator::SimulatedDevice;
use bioamp_rs::transport::{available_ports, default_backend, PortSummary, SerialConfig};
use bioamp_rs::types::{DecodedSample, StreamStatus};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Width of the scrolling waveform window in seconds.
const WINDOW_SECS: f64 = 2.0;

/// Discrete Y-axis half-ranges in ADC counts. `+` / `-` step through them;
/// `a` picks the best fit automatically.
const Y_SCALES: &[f64] = &[25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 8192.0];

/// ±2500 counts fits a typical electrode signal with headroom for artefacts.
const DEFAULT_SCALE: usize = 6;

const COLORS: [Color; 6] = [
    Color::Cyan,
    Color::Yellow,
    Color::Green,
    Color::Magenta,
    Color::LightRed,
    Color::LightBlue,
];

/// Dimmed versions of COLORS for the raw trace under the smooth overlay.
const DIM_COLORS: [Color; 6] = [
    Color::Rgb(0, 90, 110),
    Color::Rgb(110, 90, 0),
    Color::Rgb(0, 110, 0),
    Color::Rgb(110, 0, 110),
    Color::Rgb(120, 40, 40),
    Color::Rgb(40, 60, 120),
];

/// Moving-average window in samples (18 ms at 500 Hz).
const SMOOTH_WINDOW: usize = 9;

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Seconds between retries when connecting fails.
const RETRY_SECS: u64 = 5;

/// Seconds to wait before reconnecting after the board drops off.
const RECONNECT_DELAY_SECS: u64 = 2;

// ── Command line ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug, Clone)]
#[command(name = "tui", about = "Live chart viewer for BioAmp/Chords boards")]
struct Cli {
    /// Serial port. Defaults to the first USB serial port.
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    #[arg(long, default_value_t = NUM_CHANNELS)]
    channels: usize,

    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    rate: f64,

    /// Directory where recordings are saved.
    #[arg(long, default_value = "recordings")]
    recordings: PathBuf,

    /// Use the built-in simulated board.
    #[arg(long)]
    simulate: bool,

    /// With --simulate: skip every n-th frame.
    #[arg(long, requires = "simulate")]
    drop_every: Option<u32>,
}

// ── App mode ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum AppMode {
    /// Opening the port and waiting for the board to identify itself.
    Connecting(String),
    /// Streaming from a board. Carries its identification line.
    Connected { device: String },
    /// `--simulate`: streaming from the built-in board.
    Simulated,
    /// Not connected. Retries automatically unless the user disconnected.
    Disconnected,
}

// ── App state (shared with the sample task via Arc<Mutex<_>>) ─────────────────

pub struct App {
    pipeline: SignalPipeline<JsonDirStorage>,
    sample_rate: f64,
    channels: usize,

    // ── Status
    pub mode: AppMode,
    pub status: StreamStatus,
    pub filter: FilterMode,

    // ── UI controls
    scale_idx: usize,
    pub paused: bool,
    pub smooth: bool,

    // ── Port picker
    pub show_picker: bool,
    pub picker_cursor: usize,
    pub picker_entries: Vec<PortSummary>,

    /// Last connection error, shown in the header while disconnected.
    pub last_error: Option<String>,
    /// Result of the last user action, shown in the footer.
    pub notice: Option<String>,
}

impl App {
    fn new(pipeline: SignalPipeline<JsonDirStorage>, channels: usize, sample_rate: f64) -> Self {
        Self {
            pipeline,
            sample_rate,
            channels,
            mode: AppMode::Disconnected,
            status: StreamStatus::default(),
            filter: FilterMode::None,
            scale_idx: DEFAULT_SCALE,
            paused: false,
            smooth: true,
            show_picker: false,
            picker_cursor: 0,
            picker_entries: vec![],
            last_error: None,
            notice: None,
        }
    }

    /// Wipe the waveform buffers.
    pub fn clear(&mut self) {
        self.pipeline.display.clear();
    }

    fn y_range(&self) -> f64 {
        Y_SCALES[self.scale_idx]
    }

    fn scale_up(&mut self) {
        if self.scale_idx + 1 < Y_SCALES.len() {
            self.scale_idx += 1;
        }
    }

    fn scale_down(&mut self) {
        if self.scale_idx > 0 {
            self.scale_idx -= 1;
        }
    }

    /// Smallest scale step that fits the current peak with 10 % headroom.
    fn auto_scale(&mut self) {
        let peak = (0..self.channels)
            .map(|ch| {
                let (min, max, _) = self.channel_stats(ch);
                min.abs().max(max.abs())
            })
            .fold(0.0_f64, f64::max);
        let needed = peak * 1.1;
        self.scale_idx = Y_SCALES
            .iter()
            .position(|&s| s >= needed)
            .unwrap_or(Y_SCALES.len() - 1);
    }

    /// Mean of the buffered samples; charts are drawn around it.
    fn channel_mean(&self, ch: usize) -> f64 {
        match self.pipeline.display.channel(ch) {
            Some(buf) if !buf.is_empty() => buf.iter().sum::<f64>() / buf.len() as f64,
            _ => 0.0,
        }
    }

    /// `(min, max, rms)` of the mean-centred buffer.
    fn channel_stats(&self, ch: usize) -> (f64, f64, f64) {
        let Some(buf) = self.pipeline.display.channel(ch).filter(|b| !b.is_empty()) else {
            return (0.0, 0.0, 0.0);
        };
        let mean = self.channel_mean(ch);
        let min = buf.iter().map(|v| v - mean).fold(f64::INFINITY, f64::min);
        let max = buf.iter().map(|v| v - mean).fold(f64::NEG_INFINITY, f64::max);
        let rms = (buf.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / buf.len() as f64).sqrt();
        (min, max, rms)
    }

    fn cycle_filter(&mut self) {
        self.filter = self.filter.next();
        self.pipeline.filters.set_all(self.filter);
        self.notice = Some(format!("Filter: {}", self.filter));
    }

    fn toggle_recording(&mut self) {
        let rec = &mut self.pipeline.recorder;
        // A failed save leaves samples buffered; toggling again retries it.
        if !rec.is_recording() && rec.buffered() == 0 {
            rec.start_recording();
            self.notice = Some("Recording…".into());
            return;
        }
        let n = rec.list_recordings().map(|l| l.len()).unwrap_or(0) + 1;
        let name = format!("Recording {n}");
        self.notice = Some(match rec.stop_recording(&name, self.channels, self.sample_rate) {
            Ok(Some(s)) => format!("Saved \"{}\" ({:.1} s)", s.name, s.duration_seconds),
            Ok(None) => "Nothing recorded".into(),
            Err(e) => format!("{e}. {} Press [Space] to retry.", e.hint()),
        });
    }

    fn export_all(&mut self) {
        let path = default_archive_name();
        let result = self
            .pipeline
            .recorder
            .list_recordings()
            .and_then(|list| export_all_as_archive(&list).map(|bytes| (list.len(), bytes)));
        self.notice = Some(match result {
            Ok((n, bytes)) => match std::fs::write(&path, bytes) {
                Ok(()) => format!("Exported {n} recording(s) to {path}"),
                Err(e) => format!("Could not write {path}: {e}"),
            },
            Err(e) => format!("{e}. {}", e.hint()),
        });
    }
}

/// Lock the shared state, recovering it if a holder panicked.
fn lock(app: &Mutex<App>) -> MutexGuard<'_, App> {
    app.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Symmetric moving-average (boxcar) smoother; preserves length.
fn smooth_signal(data: &[(f64, f64)], window: usize) -> Vec<(f64, f64)> {
    if data.len() < 3 || window < 2 {
        return data.to_vec();
    }
    let half = window / 2;
    data.iter()
        .enumerate()
        .map(|(i, &(x, _))| {
            let start = i.saturating_sub(half);
            let end = (i + half + 1).min(data.len());
            let sum: f64 = data[start..end].iter().map(|&(_, y)| y).sum();
            (x, sum / (end - start) as f64)
        })
        .collect()
}

fn port_entry(p: &PortSummary) -> String {
    let detail = [p.manufacturer.as_deref(), p.product.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    if detail.is_empty() {
        format!("{}  [{}]", p.name, p.kind)
    } else {
        format!("{}  [{}]  {detail}", p.name, p.kind)
    }
}

fn describe(e: &BioAmpError) -> String {
    format!("{e}. {}", e.hint())
}

// ── Device session ────────────────────────────────────────────────────────────

fn make_client(cli: &Cli, port: Option<String>) -> BioAmpClient {
    let config = BioAmpConfig {
        serial: SerialConfig {
            port,
            baud_rate: cli.baud,
        },
        channels: cli.channels,
        expected_sample_rate: cli.rate,
        ..BioAmpConfig::default()
    };
    if cli.simulate {
        let mut sim = SimulatedDevice::new(cli.rate, cli.channels);
        if let Some(n) = cli.drop_every {
            sim = sim.with_drops(n);
        }
        BioAmpClient::with_backend(config, Arc::new(sim))
    } else {
        BioAmpClient::with_backend(config, default_backend())
    }
}

/// Delivered once a background connection attempt finishes.
struct ConnectOutcome {
    client: BioAmpClient,
    result: Result<mpsc::Receiver<DecodedSample>, BioAmpError>,
}

/// Connect and start streaming in a background task so the UI stays live.
fn start_connect(
    mut client: BioAmpClient,
    label: String,
    app: &Arc<Mutex<App>>,
) -> oneshot::Receiver<ConnectOutcome> {
    {
        let mut s = lock(app);
        s.clear();
        s.mode = AppMode::Connecting(label);
        s.paused = false;
        s.show_picker = false;
    }

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = match client.connect().await {
            Ok(()) => client.start_stream().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log::warn!("connect failed: {e}");
            let _ = client.disconnect().await;
        }
        let _ = tx.send(ConnectOutcome { client, result });
    });
    rx
}

/// Feed decoded samples through the pipeline until the stream closes.
fn spawn_sample_task(mut rx: mpsc::Receiver<DecodedSample>, app: Arc<Mutex<App>>) {
    tokio::spawn(async move {
        while let Some(sample) = rx.recv().await {
            let mut s = lock(&app);
            s.pipeline.ingest(&sample);
            // Drain whatever else is ready under the same lock.
            while let Ok(more) = rx.try_recv() {
                s.pipeline.ingest(&more);
            }
        }
    });
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn draw(frame: &mut Frame, app: &App) {
    let area = frame.area();
    let root = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(0),
        Constraint::Length(4),
    ])
    .split(area);

    draw_header(frame, root[0], app);
    draw_charts(frame, root[1], app);
    draw_footer(frame, root[2], app);

    if app.show_picker {
        draw_port_picker(frame, area, app);
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

fn spinner_str() -> &'static str {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    SPINNER[(ms / 100) as usize % SPINNER.len()]
}

/// Status bar: connection, measured rate, loss counters, filter, scale and
/// the recording badge.
fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let (label, color) = match &app.mode {
        AppMode::Connecting(port) => (
            format!("{} Connecting to {port}…", spinner_str()),
            Color::Yellow,
        ),
        AppMode::Connected { device } => (format!("● {device}"), Color::Green),
        AppMode::Simulated => ("◆ Simulated".to_owned(), Color::Cyan),
        AppMode::Disconnected => {
            let reason = app
                .last_error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default();
            (format!("○ Disconnected{reason}"), Color::Red)
        }
    };

    let s = &app.status;
    let rate = format!("{:.1} Hz", s.sample_rate);
    let loss = format!("drop {}  desync {}", s.dropped_frames, s.desync_events);
    let filter = format!("filter {}", app.filter);
    let scale = format!("±{:.0}", app.y_range());
    let total = format!("{}K pkt", s.total_packets / 1_000);

    let mut spans = vec![
        Span::styled(
            " BioAmp Monitor ",
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        sep(),
        Span::styled(rate, Style::default().fg(Color::White)),
        sep(),
        Span::styled(
            loss,
            Style::default().fg(if s.dropped_frames > 0 { Color::Yellow } else { Color::White }),
        ),
        sep(),
        Span::styled(filter, Style::default().fg(Color::LightGreen)),
        sep(),
        Span::styled(
            scale,
            Style::default()
                .fg(Color::LightBlue)
                .add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(total, Style::default().fg(Color::DarkGray)),
    ];
    let rec = &app.pipeline.recorder;
    if rec.is_recording() {
        spans.push(sep());
        spans.push(Span::styled(
            format!("● REC {}", rec.buffered()),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ));
    }
    spans.push(Span::raw(" "));

    frame.render_widget(
        Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

#[inline]
fn sep<'a>() -> Span<'a> {
    Span::styled(" │ ", Style::default().fg(Color::DarkGray))
}

// ── Charts ────────────────────────────────────────────────────────────────────

/// One chart row per channel. Each trace is drawn around its own mean so
/// unfiltered readings near mid-scale stay visible.
fn draw_charts(frame: &mut Frame, area: Rect, app: &App) {
    let n = app.channels.max(1) as u32;
    let rows = Layout::vertical((0..n).map(|_| Constraint::Ratio(1, n))).split(area);

    let y_range = app.y_range();
    for ch in 0..app.channels {
        let mean = app.channel_mean(ch);
        let data: Vec<(f64, f64)> = app
            .pipeline
            .display
            .channel(ch)
            .map(|buf| {
                buf.iter()
                    .enumerate()
                    // Clamp so ratatui does not drop out-of-range points.
                    .map(|(i, &v)| (i as f64 / app.sample_rate, (v - mean).clamp(-y_range, y_range)))
                    .collect()
            })
            .unwrap_or_default();
        draw_channel(frame, rows[ch], ch, &data, app);
    }
}

fn draw_channel(frame: &mut Frame, area: Rect, ch: usize, data: &[(f64, f64)], app: &App) {
    let color = COLORS[ch % COLORS.len()];
    let y_range = app.y_range();
    let name = app
        .pipeline
        .display
        .labels()
        .get(ch)
        .cloned()
        .unwrap_or_default();
    let mode = app.pipeline.filters.mode(ch).unwrap_or_default();

    let (min_v, max_v, rms_v) = app.channel_stats(ch);
    let clipping = max_v > y_range || min_v < -y_range;
    let border_color = if clipping { Color::Red } else { color };

    let clip_tag = if clipping { " [CLIP +]" } else { "" };
    let smooth_tag = if app.smooth { " [SMOOTH]" } else { "" };
    let title = format!(
        " {name} [{mode}]  min:{min_v:+7.1}  max:{max_v:+7.1}  rms:{rms_v:6.1}{clip_tag}{smooth_tag} "
    );

    let y_labels: Vec<String> = [-1.0, 0.0, 1.0]
        .iter()
        .map(|&f| format!("{:+.0}", f * y_range))
        .collect();
    let x_labels = vec![
        "0s".to_string(),
        format!("{:.1}s", WINDOW_SECS / 2.0),
        format!("{:.0}s", WINDOW_SECS),
    ];

    let smoothed: Vec<(f64, f64)> = if app.smooth {
        smooth_signal(data, SMOOTH_WINDOW)
    } else {
        vec![]
    };

    let datasets: Vec<Dataset> = if app.smooth {
        vec![
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(DIM_COLORS[ch % DIM_COLORS.len()]))
                .data(data),
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(color))
                .data(&smoothed),
        ]
    } else {
        vec![Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(color))
            .data(data)]
    };

    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .title(Span::styled(
                    title,
                    Style::default().fg(color).add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(border_color)),
        )
        .x_axis(
            Axis::default()
                .bounds([0.0, WINDOW_SECS])
                .labels(x_labels)
                .style(Style::default().fg(Color::DarkGray)),
        )
        .y_axis(
            Axis::default()
                .bounds([-y_range, y_range])
                .labels(y_labels)
                .style(Style::default().fg(Color::DarkGray)),
        );

    frame.render_widget(chart, area);
}

// ── Footer ────────────────────────────────────────────────────────────────────

/// Key reference on the first line; the last action's result (or a hint for
/// the current mode) on the second.
fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    let pause_span = if app.paused {
        Span::styled(
            "  ⏸ PAUSED",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )
    } else {
        Span::raw("")
    };

    let keys = Line::from(vec![
        Span::raw(" "),
        key("[Tab]"),
        Span::raw("Ports  "),
        key("[n]"),
        Span::raw("Connect  "),
        key("[d]"),
        Span::raw("Disconnect  "),
        key("[f]"),
        Span::raw("Filter  "),
        key("[Space]"),
        Span::raw(if app.pipeline.recorder.is_recording() { "Save  " } else { "Record  " }),
        key("[x]"),
        Span::raw("Export  "),
        key("[p]"),
        Span::raw("Pause  "),
        key("[r]"),
        Span::raw("Resume  "),
        pause_span,
    ]);
    let view_keys = Line::from(vec![
        Span::raw(" "),
        key("[+]"),
        Span::raw("Scale↑  "),
        key("[-]"),
        Span::raw("Scale↓  "),
        key("[a]"),
        Span::raw("Auto-scale  "),
        key("[v]"),
        Span::raw(if app.smooth { "Raw  " } else { "Smooth  " }),
        key("[c]"),
        Span::raw("Clear  "),
        key("[q]"),
        Span::raw("Quit"),
    ]);

    let message = match (&app.notice, &app.mode) {
        (Some(n), _) => Line::from(Span::styled(format!(" {n}"), Style::default().fg(Color::Cyan))),
        (None, AppMode::Disconnected) => Line::from(Span::styled(
            " Not connected. Plug in the board and press [Tab] to pick its port, or [n] to retry.",
            Style::default().fg(Color::Yellow),
        )),
        (None, _) => Line::from(""),
    };

    frame.render_widget(
        Paragraph::new(vec![keys, view_keys, message]).block(Block::default().borders(Borders::TOP)),
        area,
    );
}

#[inline]
fn key(s: &str) -> Span<'_> {
    Span::styled(
        s,
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    )
}

// ── Port picker overlay ───────────────────────────────────────────────────────

fn draw_port_picker(frame: &mut Frame, area: Rect, app: &App) {
    let n = app.picker_entries.len().max(1);
    let inner_h = n as u16 + 4;
    let box_h = inner_h + 2;
    let box_w = (area.width * 60 / 100).max(52).min(area.width);
    let x = area.x + (area.width.saturating_sub(box_w)) / 2;
    let y = area.y + (area.height.saturating_sub(box_h)) / 2;
    let popup = Rect::new(x, y, box_w, box_h.min(area.height));

    frame.render_widget(Clear, popup);
    frame.render_widget(
        Block::default()
            .title(Span::styled(
                format!(" Select Port  ({} found) ", app.picker_entries.len()),
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            ))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
        popup,
    );

    let inner = popup.inner(Margin {
        horizontal: 1,
        vertical: 1,
    });
    let hint_h = 1u16;
    let [list_area, _, hint_area] = Layout::vertical([
        Constraint::Length(inner.height.saturating_sub(hint_h + 1)),
        Constraint::Length(1),
        Constraint::Length(hint_h),
    ])
    .areas(inner);

    let items: Vec<ListItem> = if app.picker_entries.is_empty() {
        vec![ListItem::new(Span::styled(
            "  No serial ports found. Press [s] to refresh",
            Style::default().fg(Color::DarkGray),
        ))]
    } else {
        app.picker_entries
            .iter()
            .map(|p| ListItem::new(Span::styled(format!("  {}", port_entry(p)), Style::default().fg(Color::White))))
            .collect()
    };

    let mut list_state = ListState::default();
    if !app.picker_entries.is_empty() {
        list_state.select(Some(app.picker_cursor));
    }

    frame.render_stateful_widget(
        List::new(items)
            .highlight_style(
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::White)
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ "),
        list_area,
        &mut list_state,
    );

    frame.render_widget(
        Paragraph::new(Line::from(vec![
            key(" [↑↓]"),
            Span::raw(" Navigate  "),
            key("[↵]"),
            Span::raw(" Connect  "),
            key("[s]"),
            Span::raw(" Refresh  "),
            key("[Esc]"),
            Span::raw(" Close"),
        ])),
        hint_area,
    );
}

fn refresh_ports(app: &Arc<Mutex<App>>) {
    let mut s = lock(app);
    match available_ports() {
        Ok(ports) => {
            s.picker_entries = ports;
            s.picker_cursor = s.picker_cursor.min(s.picker_entries.len().saturating_sub(1));
        }
        Err(e) => {
            s.picker_entries.clear();
            s.notice = Some(describe(&e));
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    use std::io::IsTerminal as _;
    if !io::stdout().is_terminal() {
        eprintln!("Error: the bioamp tui requires a real terminal (TTY).");
        eprintln!("Run it directly in a terminal emulator, not piped or redirected.");
        std::process::exit(1);
    }

    // ── Logging ─────────────────────────────────────────────────────────────
    // Logs go to bioamp-tui.log so they never interfere with the display.
    //   RUST_LOG=debug cargo run --bin tui
    {
        use std::fs::File;
        if let Ok(file) = File::create("bioamp-tui.log") {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
    }

    let cli = Cli::parse();

    // ── Shared UI state ───────────────────────────────────────────────────────
    let storage = JsonDirStorage::open(&cli.recordings)
        .with_context(|| format!("opening {}", cli.recordings.display()))?;
    let capacity = (WINDOW_SECS * cli.rate) as usize;
    let pipeline = SignalPipeline::new(cli.channels, cli.rate, capacity, storage);
    let app = Arc::new(Mutex::new(App::new(pipeline, cli.channels, cli.rate)));

    // ── Session state (owned by main task only) ───────────────────────────────
    let mut client: Option<BioAmpClient> = None;
    let mut status_rx: Option<watch::Receiver<StreamStatus>> = None;
    let mut port = cli.port.clone();
    let mut retry_at: Option<tokio::time::Instant> = None;

    let port_label = |port: &Option<String>| -> String {
        if cli.simulate {
            "simulator".into()
        } else {
            port.clone().unwrap_or_else(|| "first USB port".into())
        }
    };

    let mut pending_connect: Option<oneshot::Receiver<ConnectOutcome>> =
        Some(start_connect(make_client(&cli, port.clone()), port_label(&port), &app));

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let tick = Duration::from_millis(33); // ~30 FPS

    // ── Main loop ─────────────────────────────────────────────────────────────
    'main: loop {
        // ── 1. Collect finished connection attempt ───────────────────────────
        if let Some(ref mut rx) = pending_connect {
            if let Ok(outcome) = rx.try_recv() {
                pending_connect = None;
                let ConnectOutcome { client: c, result } = outcome;
                match result {
                    Ok(samples) => {
                        let status = c.status();
                        {
                            let mut s = lock(&app);
                            s.mode = if cli.simulate {
                                AppMode::Simulated
                            } else {
                                AppMode::Connected {
                                    device: status.device_id.clone().unwrap_or_else(|| port_label(&port)),
                                }
                            };
                            s.status = status;
                            s.last_error = None;
                        }
                        status_rx = Some(c.subscribe_status());
                        client = Some(c);
                        spawn_sample_task(samples, Arc::clone(&app));
                    }
                    Err(e) => {
                        {
                            let mut s = lock(&app);
                            s.mode = AppMode::Disconnected;
                            s.last_error = Some(describe(&e));
                        }
                        retry_at = Some(tokio::time::Instant::now() + Duration::from_secs(RETRY_SECS));
                    }
                }
            }
        }

        // ── 2. Refresh status; detect the board dropping off ─────────────────
        if let Some(rx) = &status_rx {
            let status = rx.borrow().clone();
            let lost = !status.connected;
            lock(&app).status = status;
            if lost {
                if let Some(mut c) = client.take() {
                    let _ = c.disconnect().await;
                }
                status_rx = None;
                {
                    let mut s = lock(&app);
                    s.mode = AppMode::Disconnected;
                    s.last_error = Some("device closed the connection".into());
                }
                retry_at = Some(tokio::time::Instant::now() + Duration::from_secs(RECONNECT_DELAY_SECS));
            }
        }

        // ── 3. Fire pending retry ─────────────────────────────────────────────
        if let Some(t) = retry_at {
            if tokio::time::Instant::now() >= t && pending_connect.is_none() && client.is_none() {
                retry_at = None;
                pending_connect = Some(start_connect(make_client(&cli, port.clone()), port_label(&port), &app));
            }
        }

        // ── 4. Render ─────────────────────────────────────────────────────────
        {
            let s = lock(&app);
            terminal.draw(|f| draw(f, &s))?;
        }

        // ── 5. Handle keyboard ────────────────────────────────────────────────
        if !event::poll(tick)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        // In raw mode Ctrl+C arrives as a key event.
        let ctrl_c = key.modifiers.contains(KeyModifiers::CONTROL)
            && key.code == KeyCode::Char('c');
        if key.code == KeyCode::Char('q') || ctrl_c {
            break 'main;
        }

        // ── Picker overlay keys ───────────────────────────────────────────────
        if lock(&app).show_picker {
            match key.code {
                KeyCode::Esc => lock(&app).show_picker = false,
                KeyCode::Char('s') => refresh_ports(&app),
                KeyCode::Up => {
                    let mut s = lock(&app);
                    s.picker_cursor = s.picker_cursor.saturating_sub(1);
                }
                KeyCode::Down => {
                    let mut s = lock(&app);
                    let max = s.picker_entries.len().saturating_sub(1);
                    if s.picker_cursor < max {
                        s.picker_cursor += 1;
                    }
                }
                KeyCode::Enter => {
                    let chosen = {
                        let s = lock(&app);
                        s.picker_entries.get(s.picker_cursor).map(|p| p.name.clone())
                    };
                    if let Some(name) = chosen {
                        if pending_connect.is_none() {
                            if let Some(mut c) = client.take() {
                                let _ = c.disconnect().await;
                            }
                            status_rx = None;
                            retry_at = None;
                            port = Some(name);
                            pending_connect = Some(start_connect(
                                make_client(&cli, port.clone()),
                                port_label(&port),
                                &app,
                            ));
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        // ── Normal-view keys ──────────────────────────────────────────────────
        match key.code {
            KeyCode::Esc => break 'main,

            KeyCode::Tab if !cli.simulate => {
                refresh_ports(&app);
                lock(&app).show_picker = true;
            }

            KeyCode::Char('n') => {
                if client.is_none() && pending_connect.is_none() {
                    retry_at = None;
                    pending_connect = Some(start_connect(make_client(&cli, port.clone()), port_label(&port), &app));
                }
            }

            // Manual disconnect: stay disconnected until the user reconnects.
            KeyCode::Char('d') => {
                if let Some(mut c) = client.take() {
                    if let Err(e) = c.disconnect().await {
                        lock(&app).notice = Some(describe(&e));
                    }
                }
                status_rx = None;
                retry_at = None;
                let mut s = lock(&app);
                s.mode = AppMode::Disconnected;
                s.last_error = None;
                s.status = StreamStatus::default();
            }

            KeyCode::Char('p') => {
                if let Some(c) = client.as_mut() {
                    match c.stop_stream().await {
                        Ok(()) => lock(&app).paused = true,
                        Err(e) => lock(&app).notice = Some(describe(&e)),
                    }
                }
            }
            KeyCode::Char('r') => {
                if let Some(c) = client.as_mut() {
                    match c.start_stream().await {
                        Ok(samples) => {
                            lock(&app).paused = false;
                            spawn_sample_task(samples, Arc::clone(&app));
                        }
                        Err(BioAmpError::AlreadyStreaming) => {}
                        Err(e) => lock(&app).notice = Some(describe(&e)),
                    }
                }
            }

            KeyCode::Char('f') => lock(&app).cycle_filter(),
            KeyCode::Char(' ') => lock(&app).toggle_recording(),
            KeyCode::Char('x') => lock(&app).export_all(),

            KeyCode::Char('+') | KeyCode::Char('=') => lock(&app).scale_up(),
            KeyCode::Char('-') => lock(&app).scale_down(),
            KeyCode::Char('a') => lock(&app).auto_scale(),

            KeyCode::Char('v') => {
                let mut s = lock(&app);
                s.smooth = !s.smooth;
            }

            // Ctrl+C is already handled above as quit.
            KeyCode::Char('c') => lock(&app).clear(),

            _ => {}
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    if let Some(mut c) = client {
        let _ = c.disconnect().await;
    }
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
