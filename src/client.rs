//! Receiving side of the benchmark.
//!
//! Opens `connections` sockets to the server and runs one [`ReceiveWorker`]
//! thread per socket until the run duration elapses, the server closes the
//! stream, or shutdown is requested.

use crate::config::ClientConfig;
use crate::error::Error;
use crate::report::{Report, ReportSink, Role, Start};
use crate::signal::Shutdown;
use crate::stats::Statistics;
use crate::worker::{ReceiveSettings, ReceiveWorker, WorkerSummary};
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub struct Client {
    config: ClientConfig,
    stats: Arc<Statistics>,
    shutdown: Shutdown,
}

impl Client {
    pub fn new(config: ClientConfig, shutdown: Shutdown) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            stats: Arc::new(Statistics::new()),
            shutdown,
        })
    }

    pub fn statistics(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    /// Connect every socket, then receive until the run ends.
    ///
    /// Fails if a connection cannot be established or a worker thread cannot
    /// be started. Faults on an established connection end that connection
    /// alone. Once connected, the sink receives the aggregate even when the
    /// run fails.
    pub fn run(&self, sink: Arc<dyn ReportSink>) -> Result<Report, Error> {
        self.run_with(sink, |id, worker| {
            thread::Builder::new()
                .name(format!("recv-{id}"))
                .spawn(move || worker.run())
        })
    }

    fn run_with<F>(&self, sink: Arc<dyn ReportSink>, mut spawn: F) -> Result<Report, Error>
    where
        F: FnMut(usize, ReceiveWorker<TcpStream>) -> io::Result<JoinHandle<WorkerSummary>>,
    {
        let mut streams = Vec::with_capacity(self.config.connections);
        for _ in 0..self.config.connections {
            let stream = TcpStream::connect(self.config.server)?;
            stream.set_read_timeout(Some(self.config.poll_interval))?;
            streams.push(stream);
        }
        tracing::info!(
            server = %self.config.server,
            connections = streams.len(),
            "connected"
        );

        sink.print_start(&Start {
            role: Role::Client,
            address: self.config.server,
            message_size: self.config.message_size,
            connections: self.config.connections,
            mode: None,
        });

        let started = Instant::now();
        let settings = ReceiveSettings {
            field_size: self.config.field_size(),
            latency_every: self.config.latency_every,
            progress_every: self.config.progress_every,
            verify: self.config.verify,
            deadline: Some(started + self.config.duration),
        };

        let mut handles: Vec<(usize, JoinHandle<WorkerSummary>)> =
            Vec::with_capacity(streams.len());
        let mut spawn_error = None;
        for (id, stream) in streams.into_iter().enumerate() {
            let worker = ReceiveWorker::new(
                id,
                stream,
                settings.clone(),
                self.stats.clone(),
                self.shutdown.clone(),
                sink.clone(),
            );
            match spawn(id, worker) {
                Ok(handle) => handles.push((id, handle)),
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "failed to start worker");
                    // Workers already running stop at the next loop iteration.
                    self.shutdown.trigger();
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let mut faults = 0;
        for (id, handle) in handles {
            match handle.join() {
                Ok(summary) if summary.reason.is_fault() => faults += 1,
                Ok(_) => {}
                Err(_) => {
                    tracing::error!(worker = id, "worker thread panicked");
                    faults += 1;
                }
            }
        }

        let report = Report::new(
            Role::Client,
            self.config.message_size,
            self.config.connections,
            &self.stats.snapshot(),
            started.elapsed(),
        );
        tracing::info!(
            faults,
            bytes = report.bytes,
            messages = report.messages,
            "run finished"
        );
        sink.print_results(&report);

        match spawn_error {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }
}
