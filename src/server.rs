//! Sending side of the benchmark.
//!
//! The server accepts up to `max_connections` connections and runs one
//! [`SendWorker`] thread per connection. A session ends when shutdown is
//! requested, or when every connection it was allowed to accept has
//! terminated. At shutdown workers get `drain_grace` to notice the flag
//! before their sockets are shut down underneath them.

use crate::config::ServerConfig;
use crate::error::Error;
use crate::report::{Report, ReportSink, Role, Start};
use crate::signal::Shutdown;
use crate::stats::Statistics;
use crate::strategy::TransmitMode;
use crate::transport;
use crate::worker::{SendSettings, SendWorker, WorkerSummary};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Shutdown as SocketShutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interval between accept attempts and worker reaping.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    zero_copy: bool,
    stats: Arc<Statistics>,
    shutdown: Shutdown,
}

impl Server {
    /// Validate `config` and bind the listening socket.
    pub fn bind(config: ServerConfig, shutdown: Shutdown) -> Result<Self, Error> {
        config.validate()?;

        let addr = config.listen;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(i32::try_from(config.max_connections).unwrap_or(i32::MAX))?;

        let mut zero_copy = config.zero_copy;
        if zero_copy && let Err(e) = transport::enable_zerocopy(socket.as_raw_fd()) {
            tracing::warn!(error = %e, "zero-copy unavailable, using copy-vectored for this session");
            zero_copy = false;
        }

        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();
        tracing::info!(addr = %listener.local_addr()?, "listening");

        Ok(Self {
            listener,
            config,
            zero_copy,
            stats: Arc::new(Statistics::new()),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn statistics(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    /// Transmit path requested for new connections after session-level
    /// negotiation. Individual connections may still fall back.
    pub fn mode(&self) -> TransmitMode {
        if self.zero_copy {
            TransmitMode::ZeroCopyDeferred
        } else {
            TransmitMode::CopyVectored
        }
    }

    /// Accept and serve connections until the session ends.
    pub fn run(self, sink: Arc<dyn ReportSink>) -> Result<Report, Error> {
        sink.print_start(&Start {
            role: Role::Server,
            address: self.local_addr()?,
            message_size: self.config.message_size,
            connections: self.config.max_connections,
            mode: Some(self.mode()),
        });

        let settings = SendSettings {
            field_size: self.config.field_size(),
            zero_copy: self.zero_copy,
            flush_every: self.config.flush_every,
            backoff: self.config.backoff,
            messages: self.config.messages,
        };

        let started = Instant::now();
        let mut registry = WorkerRegistry::default();
        let mut accepted = 0;

        while accepted < self.config.max_connections && !self.shutdown.is_triggered() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let id = accepted;
                    accepted += 1;
                    tracing::info!(worker = id, %peer, "client connected");
                    if let Err(e) = self.spawn_worker(&mut registry, id, stream, settings.clone()) {
                        tracing::warn!(worker = id, error = %e, "failed to start worker");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    registry.reap();
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }

        if !self.shutdown.is_triggered() {
            tracing::debug!(accepted, "connection limit reached, no longer accepting");
        }
        drop(self.listener);

        // Wait for workers to finish on their own. Shutdown starts the
        // grace period.
        loop {
            registry.reap();
            if registry.active() == 0 || self.shutdown.is_triggered() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        let summaries = registry.drain(self.config.drain_grace);

        let report = Report::new(
            Role::Server,
            self.config.message_size,
            accepted,
            &self.stats.snapshot(),
            started.elapsed(),
        );
        tracing::info!(
            connections = accepted,
            faults = summaries.iter().filter(|s| s.reason.is_fault()).count(),
            bytes = report.bytes,
            messages = report.messages,
            "session finished"
        );
        sink.print_results(&report);
        Ok(report)
    }

    fn spawn_worker(
        &self,
        registry: &mut WorkerRegistry,
        id: usize,
        stream: TcpStream,
        settings: SendSettings,
    ) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        let control = match stream.try_clone() {
            Ok(control) => Some(control),
            Err(e) => {
                tracing::debug!(worker = id, error = %e, "no control handle, worker cannot be cancelled");
                None
            }
        };

        let worker = SendWorker::new(
            id,
            stream,
            settings,
            self.stats.clone(),
            self.shutdown.clone(),
        );
        let handle = thread::Builder::new()
            .name(format!("send-{id}"))
            .spawn(move || worker.run())?;

        registry.workers.push(WorkerHandle {
            id,
            handle,
            control,
        });
        Ok(())
    }
}

/// Handle to a spawned send worker thread.
struct WorkerHandle {
    id: usize,
    handle: JoinHandle<WorkerSummary>,
    /// Second handle to the worker's socket, used to unblock it.
    control: Option<TcpStream>,
}

impl WorkerHandle {
    fn join(self) -> Option<WorkerSummary> {
        match self.handle.join() {
            Ok(summary) => {
                tracing::info!(
                    worker = summary.id,
                    messages = summary.messages,
                    bytes = summary.bytes,
                    "client disconnected"
                );
                Some(summary)
            }
            Err(_) => {
                tracing::error!(worker = self.id, "worker thread panicked");
                None
            }
        }
    }
}

#[derive(Default)]
struct WorkerRegistry {
    workers: Vec<WorkerHandle>,
    finished: Vec<WorkerSummary>,
}

impl WorkerRegistry {
    fn active(&self) -> usize {
        self.workers.len()
    }

    /// Join workers whose threads have exited.
    fn reap(&mut self) {
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].handle.is_finished() {
                let worker = self.workers.swap_remove(i);
                self.finished.extend(worker.join());
            } else {
                i += 1;
            }
        }
    }

    /// Wait up to `grace` for workers to exit, then shut down the sockets of
    /// any that remain and join them.
    fn drain(mut self, grace: Duration) -> Vec<WorkerSummary> {
        let deadline = Instant::now() + grace;
        loop {
            self.reap();
            if self.workers.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        if !self.workers.is_empty() {
            tracing::warn!(
                remaining = self.workers.len(),
                "workers still running after drain grace, closing their sockets"
            );
        }
        for worker in &self.workers {
            if let Some(control) = &worker.control {
                let _ = control.shutdown(SocketShutdown::Both);
            }
        }
        for worker in self.workers.drain(..) {
            self.finished.extend(worker.join());
        }

        self.finished.sort_by_key(|summary| summary.id);
        self.finished
    }
}
