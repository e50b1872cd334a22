//! Benchmark client: receives messages and reports throughput and latency.

use clap::Parser;
use iovbench::config::{ClientConfig, humantime_serde};
use iovbench::report::{ReportFormat, create_sink};
use iovbench::{Client, ReportSink, Shutdown, logging, signal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "iovbench-client")]
#[command(about = "Receive fixed-shape messages with scatter reads")]
struct Args {
    /// Config file path (optional, CLI args override config)
    config: Option<PathBuf>,

    /// Server address
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// Message size in bytes, a multiple of 8
    #[arg(short, long)]
    message_size: Option<usize>,

    /// Run length, e.g. "10s" or "2m"
    #[arg(short, long, value_parser = humantime_serde::parse)]
    duration: Option<Duration>,

    /// Concurrent connections
    #[arg(short, long)]
    connections: Option<usize>,

    /// Check received fields against the filler pattern
    #[arg(long)]
    verify: bool,

    /// Report format: text or json
    #[arg(long, default_value = "text")]
    format: ReportFormat,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(server) = self.server {
            config.server = server;
        }
        if let Some(message_size) = self.message_size {
            config.message_size = message_size;
        }
        if let Some(duration) = self.duration {
            config.duration = duration;
        }
        if let Some(connections) = self.connections {
            config.connections = connections;
        }
        if self.verify {
            config.verify = true;
        }
    }
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match ClientConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => ClientConfig::default(),
    };
    args.apply(&mut config);

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    if args.print_config {
        match toml::to_string(&config) {
            Ok(s) => print!("{s}"),
            Err(e) => {
                eprintln!("Failed to render config: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let shutdown = Shutdown::new();
    signal::install_signal_handler(&shutdown).expect("error setting signal handler");

    let sink: Arc<dyn ReportSink> = Arc::from(create_sink(args.format));
    let result = Client::new(config, shutdown).and_then(|client| client.run(sink));
    if let Err(e) = result {
        tracing::error!(error = %e, "client error");
        std::process::exit(1);
    }
}
