//! Cooperative shutdown.
//!
//! A [`Shutdown`] token is a shared flag with one writer (the signal handler
//! or a test) and any number of readers. Workers check it once per loop
//! iteration, never inside a system call, so a worker blocked in a send or
//! receive notices shutdown only after that call returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cancellation token shared by the orchestrator and its workers.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `true` if it had already been requested.
    pub fn trigger(&self) -> bool {
        self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Install handlers for SIGINT and SIGTERM that trigger `shutdown`.
///
/// A second signal forces an immediate exit.
pub fn install_signal_handler(shutdown: &Shutdown) -> Result<(), ctrlc::Error> {
    let shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        if shutdown.trigger() {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, stopping");
    })
}
