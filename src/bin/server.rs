//! Benchmark server: sends messages to every client that connects.

use clap::Parser;
use iovbench::config::ServerConfig;
use iovbench::report::{ReportFormat, create_sink};
use iovbench::{ReportSink, Server, Shutdown, logging, signal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "iovbench-server")]
#[command(about = "Send fixed-shape messages with vectored or zero-copy writes")]
struct Args {
    /// Config file path (optional, CLI args override config)
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Message size in bytes, a multiple of 8
    #[arg(short, long)]
    message_size: Option<usize>,

    /// Connections to accept over the session
    #[arg(long)]
    max_connections: Option<usize>,

    /// Request zero-copy transmission
    #[arg(short, long)]
    zero_copy: bool,

    /// Messages to send per connection
    #[arg(long)]
    messages: Option<u64>,

    /// Report format: text or json
    #[arg(long, default_value = "text")]
    format: ReportFormat,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(message_size) = self.message_size {
            config.message_size = message_size;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        if self.zero_copy {
            config.zero_copy = true;
        }
        if self.messages.is_some() {
            config.messages = self.messages;
        }
    }
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match ServerConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
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
    let result = Server::bind(config, shutdown).and_then(|server| server.run(sink));
    if let Err(e) = result {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
