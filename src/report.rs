//! Reporting sinks for run progress and final results.
//!
//! Provides two formats:
//! - Text: human-readable summary block
//! - Json: NDJSON, one event per line

use crate::stats::{LatencyPercentiles, Snapshot};
use crate::strategy::TransmitMode;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Which side of the benchmark produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Session parameters announced before any transfer.
#[derive(Debug, Clone, Serialize)]
pub struct Start {
    pub role: Role,
    pub address: SocketAddr,
    pub message_size: usize,
    pub connections: usize,
    /// Transmit path, known only on the sending side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<TransmitMode>,
}

/// Throughput of one connection so far.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub connection: usize,
    pub messages: u64,
    pub bytes: u64,
    pub elapsed_secs: f64,
    pub gbps: f64,
}

impl Progress {
    pub fn new(connection: usize, messages: u64, bytes: u64, elapsed: Duration) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        Self {
            connection,
            messages,
            bytes,
            elapsed_secs,
            gbps: gbps(bytes, elapsed_secs),
        }
    }
}

/// Aggregate results of a session.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub role: Role,
    pub message_size: usize,
    pub connections: usize,
    pub bytes: u64,
    pub messages: u64,
    pub elapsed_secs: f64,
    pub gbps: f64,
    pub mb_per_sec: f64,
    pub latency_samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_latency_us: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyPercentiles>,
}

impl Report {
    pub fn new(
        role: Role,
        message_size: usize,
        connections: usize,
        snapshot: &Snapshot,
        elapsed: Duration,
    ) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let mb_per_sec = if elapsed_secs > 0.0 {
            snapshot.bytes as f64 / BYTES_PER_MB / elapsed_secs
        } else {
            0.0
        };

        Self {
            role,
            message_size,
            connections,
            bytes: snapshot.bytes,
            messages: snapshot.messages,
            elapsed_secs,
            gbps: gbps(snapshot.bytes, elapsed_secs),
            mb_per_sec,
            latency_samples: snapshot.latency_samples,
            mean_latency_us: snapshot.mean_latency_us(),
            latency: snapshot.percentiles.filter(|_| snapshot.latency_samples > 0),
        }
    }
}

fn gbps(bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        bytes as f64 * 8.0 / (elapsed_secs * 1e9)
    } else {
        0.0
    }
}

/// Output format selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            _ => Err(format!("invalid format '{s}', expected: text, json")),
        }
    }
}

/// Destination for session start, progress and results.
pub trait ReportSink: Send + Sync {
    fn print_start(&self, start: &Start);

    fn print_progress(&self, progress: &Progress);

    fn print_results(&self, report: &Report);
}

pub fn create_sink(format: ReportFormat) -> Box<dyn ReportSink> {
    match format {
        ReportFormat::Text => Box::new(TextSink),
        ReportFormat::Json => Box::new(JsonSink),
    }
}

/// Human-readable output on stdout.
#[derive(Debug, Default)]
pub struct TextSink;

impl TextSink {
    pub fn render_start(start: &Start) -> String {
        let mut out = format!(
            "{} {} message_size={} connections={}",
            start.role,
            start.address,
            format_bytes(start.message_size as u64),
            start.connections
        );
        if let Some(mode) = start.mode {
            out.push_str(&format!(" mode={mode}"));
        }
        out
    }

    pub fn render_progress(progress: &Progress) -> String {
        format!(
            "[conn {}] {} messages {} in {:.1}s ({})",
            progress.connection,
            format_count(progress.messages),
            format_bytes(progress.bytes),
            progress.elapsed_secs,
            format_bandwidth_bps(progress.gbps * 1e9)
        )
    }

    pub fn render_results(report: &Report) -> String {
        let mut lines = vec![
            format!("--- {} results ---", report.role),
            format!("message size:     {}", report.message_size),
            format!("connections:      {}", report.connections),
            format!("total bytes:      {}", report.bytes),
            format!("total messages:   {}", report.messages),
            format!("elapsed:          {:.3}s", report.elapsed_secs),
            format!("throughput:       {:.3} Gbps", report.gbps),
            format!("throughput:       {:.2} MB/s", report.mb_per_sec),
        ];
        if let Some(mean) = report.mean_latency_us {
            lines.push(format!(
                "avg latency:      {} ({} samples)",
                format_latency_us(mean),
                report.latency_samples
            ));
        }
        if let Some(p) = report.latency {
            lines.push(format!(
                "latency:          p50={} p90={} p99={} max={}",
                format_latency_us(p.p50_us as f64),
                format_latency_us(p.p90_us as f64),
                format_latency_us(p.p99_us as f64),
                format_latency_us(p.max_us as f64)
            ));
        }
        lines.join("\n")
    }
}

impl ReportSink for TextSink {
    fn print_start(&self, start: &Start) {
        println!("{}", Self::render_start(start));
    }

    fn print_progress(&self, progress: &Progress) {
        println!("{}", Self::render_progress(progress));
    }

    fn print_results(&self, report: &Report) {
        println!("{}", Self::render_results(report));
    }
}

/// NDJSON output on stdout.
#[derive(Debug, Default)]
pub struct JsonSink;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Event<'a> {
    Start(&'a Start),
    Progress(&'a Progress),
    Results(&'a Report),
}

impl JsonSink {
    fn emit(event: Event<'_>) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!(error = %e, "failed to serialize report event"),
        }
    }
}

impl ReportSink for JsonSink {
    fn print_start(&self, start: &Start) {
        Self::emit(Event::Start(start));
    }

    fn print_progress(&self, progress: &Progress) {
        Self::emit(Event::Progress(progress));
    }

    fn print_results(&self, report: &Report) {
        Self::emit(Event::Results(report));
    }
}

/// Format a latency value in microseconds with autoscaling.
pub fn format_latency_us(us: f64) -> String {
    if us < 1_000.0 {
        format!("{:.0}us", us)
    } else if us < 1_000_000.0 {
        format!("{:.1}ms", us / 1_000.0)
    } else {
        format!("{:.1}s", us / 1_000_000.0)
    }
}

/// Format bandwidth in bits per second with SI suffixes.
pub fn format_bandwidth_bps(bps: f64) -> String {
    if bps < 1_000.0 {
        format!("{:.0} bps", bps)
    } else if bps < 1_000_000.0 {
        format!("{:.1} Kbps", bps / 1_000.0)
    } else if bps < 1_000_000_000.0 {
        format!("{:.1} Mbps", bps / 1_000_000.0)
    } else {
        format!("{:.2} Gbps", bps / 1_000_000_000.0)
    }
}

pub fn format_count(value: u64) -> String {
    let v = value as f64;
    if v < 1_000.0 {
        format!("{}", value)
    } else if v < 1_000_000.0 {
        format!("{:.1}K", v / 1_000.0)
    } else if v < 1_000_000_000.0 {
        format!("{:.1}M", v / 1_000_000.0)
    } else {
        format!("{:.1}B", v / 1_000_000_000.0)
    }
}

/// Format bytes with binary suffixes.
pub fn format_bytes(bytes: u64) -> String {
    let v = bytes as f64;
    if v < 1_024.0 {
        format!("{}B", bytes)
    } else if v < 1_024.0 * 1_024.0 {
        format!("{:.1}KB", v / 1_024.0)
    } else if v < 1_024.0 * 1_024.0 * 1_024.0 {
        format!("{:.1}MB", v / (1_024.0 * 1_024.0))
    } else {
        format!("{:.2}GB", v / (1_024.0 * 1_024.0 * 1_024.0))
    }
}
