//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level.

use crate::config::{LogFormat, LoggingConfig};
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Install the global subscriber described by `config`.
///
/// Fails if a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(filter(config))
        .with(layer(config))
        .try_init()
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    }
}

fn layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let base = fmt::layer()
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => base.with_ansi(true).boxed(),
        (LogFormat::Pretty, false) => base.with_ansi(true).without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().with_ansi(true).boxed(),
        (LogFormat::Compact, false) => base.compact().with_ansi(true).without_time().boxed(),
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
    }
}
