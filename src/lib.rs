//! Vectored and zero-copy stream transmit benchmark.
//!
//! A server sends fixed-shape eight-field messages over TCP with one gather
//! write per message, either copying through the kernel or transmitting from
//! user pages with completion tracking. A client receives them with scatter
//! reads, and both sides aggregate throughput and latency across many
//! concurrent connections.

pub mod buffer;
pub mod client;
pub mod completion;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod report;
pub mod server;
pub mod signal;
pub mod stats;
pub mod strategy;
pub mod transport;
pub mod worker;

pub use buffer::{BufferSet, FIELD_COUNT};
pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, TransferError};
pub use report::{Report, ReportSink};
pub use server::Server;
pub use signal::Shutdown;
pub use stats::Statistics;
pub use strategy::TransmitMode;
