//! Per-connection workers.
//!
//! Each connection is driven by one worker that owns its transport and
//! buffer set for its whole life. A worker moves through
//! `Accepted -> Allocating -> Transmitting -> Closing -> Terminated`, and on
//! every exit path flushes its local counters into the shared
//! [`Statistics`] exactly once before releasing the socket and buffers.

use crate::buffer::BufferSet;
use crate::driver;
use crate::error::TransferError;
use crate::report::{Progress, ReportSink};
use crate::signal::Shutdown;
use crate::stats::{LocalCounters, Statistics};
use crate::strategy::{self, TransmitMode};
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on waiting for zero-copy completions while closing.
const SETTLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Messages a receive worker accumulates between flushes.
const RECEIVE_FLUSH_EVERY: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Accepted,
    Allocating,
    Transmitting,
    Closing,
    Terminated,
}

/// Why a worker left its transfer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed or reset the connection.
    PeerDisconnected,
    Shutdown,
    /// The configured per-connection message count was reached.
    MessageLimit,
    /// The run duration elapsed.
    Deadline,
    AllocationFailed,
    /// A received field did not match the filler pattern.
    CorruptMessage,
    IoError,
}

impl CloseReason {
    /// Whether the worker ended because of a fault rather than a normal
    /// termination.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            CloseReason::AllocationFailed | CloseReason::CorruptMessage | CloseReason::IoError
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::PeerDisconnected => "peer disconnected",
            CloseReason::Shutdown => "shutdown",
            CloseReason::MessageLimit => "message limit reached",
            CloseReason::Deadline => "deadline reached",
            CloseReason::AllocationFailed => "allocation failed",
            CloseReason::CorruptMessage => "corrupt message",
            CloseReason::IoError => "io error",
        };
        f.write_str(s)
    }
}

/// Totals for one connection, returned when its worker terminates.
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub id: usize,
    pub reason: CloseReason,
    pub messages: u64,
    pub bytes: u64,
    /// Transmit path used, for send workers that got that far.
    pub mode: Option<TransmitMode>,
    pub elapsed: Duration,
}

/// Lifecycle bookkeeping shared by both worker kinds.
struct Lifecycle {
    id: usize,
    role: &'static str,
    state: WorkerState,
    started: Instant,
}

impl Lifecycle {
    fn new(id: usize, role: &'static str) -> Self {
        Self {
            id,
            role,
            state: WorkerState::Accepted,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, next: WorkerState) {
        tracing::trace!(worker = self.id, role = self.role, from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    fn finish(
        &mut self,
        reason: CloseReason,
        messages: u64,
        bytes: u64,
        mode: Option<TransmitMode>,
    ) -> WorkerSummary {
        self.enter(WorkerState::Terminated);
        let summary = WorkerSummary {
            id: self.id,
            reason,
            messages,
            bytes,
            mode,
            elapsed: self.started.elapsed(),
        };
        if reason.is_fault() {
            tracing::error!(worker = self.id, role = self.role, %reason, messages, bytes, "worker terminated");
        } else {
            tracing::info!(worker = self.id, role = self.role, %reason, messages, bytes, "worker terminated");
        }
        summary
    }
}

/// Tunables for a [`SendWorker`].
#[derive(Debug, Clone)]
pub struct SendSettings {
    pub field_size: usize,
    pub zero_copy: bool,
    pub flush_every: u64,
    pub backoff: Duration,
    pub messages: Option<u64>,
}

/// Sends the same message over one connection until told to stop.
pub struct SendWorker<T> {
    transport: T,
    settings: SendSettings,
    stats: Arc<Statistics>,
    shutdown: Shutdown,
    lifecycle: Lifecycle,
}

impl<T: Transport> SendWorker<T> {
    pub fn new(
        id: usize,
        transport: T,
        settings: SendSettings,
        stats: Arc<Statistics>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            transport,
            settings,
            stats,
            shutdown,
            lifecycle: Lifecycle::new(id, "send"),
        }
    }

    pub fn run(mut self) -> WorkerSummary {
        self.lifecycle.enter(WorkerState::Allocating);
        let buffers = match BufferSet::create(self.settings.field_size) {
            Ok(buffers) => buffers,
            Err(e) => {
                tracing::error!(worker = self.lifecycle.id, error = %e, "failed to allocate buffers");
                return self
                    .lifecycle
                    .finish(CloseReason::AllocationFailed, 0, 0, None);
            }
        };

        let mut strategy = strategy::negotiate(self.settings.zero_copy, &mut self.transport);
        let mode = strategy.mode();
        tracing::debug!(worker = self.lifecycle.id, %mode, "transmitting");

        self.lifecycle.enter(WorkerState::Transmitting);
        let mut local = LocalCounters::default();
        let mut messages = 0u64;
        let mut bytes = 0u64;

        let reason = loop {
            if self.shutdown.is_triggered() {
                break CloseReason::Shutdown;
            }
            if self.settings.messages.is_some_and(|limit| messages >= limit) {
                break CloseReason::MessageLimit;
            }

            match strategy.transmit(&mut self.transport, &buffers) {
                Ok(n) => {
                    local.record(n);
                    messages += 1;
                    bytes += n as u64;
                    if local.messages() >= self.settings.flush_every {
                        local.flush_into(&self.stats);
                    }
                }
                Err(TransferError::ResourceExhausted) => {
                    // same message is retried after the backoff
                    thread::sleep(self.settings.backoff);
                }
                Err(TransferError::TimedOut) => {}
                Err(e) if e.is_disconnect() => break CloseReason::PeerDisconnected,
                Err(e) => {
                    tracing::warn!(worker = self.lifecycle.id, error = %e, "send failed");
                    break CloseReason::IoError;
                }
            }
        };

        self.lifecycle.enter(WorkerState::Closing);
        local.flush_into(&self.stats);

        if strategy.outstanding() > 0
            && !strategy.settle(&mut self.transport, SETTLE_TIMEOUT)
        {
            tracing::debug!(
                worker = self.lifecycle.id,
                outstanding = strategy.outstanding(),
                "closing with zero-copy sends outstanding"
            );
        }

        let Self {
            transport,
            mut lifecycle,
            ..
        } = self;
        drop(strategy);
        drop(transport);
        drop(buffers);

        lifecycle.finish(reason, messages, bytes, Some(mode))
    }
}

/// Tunables for a [`ReceiveWorker`].
#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    pub field_size: usize,
    pub latency_every: u64,
    pub progress_every: u64,
    pub verify: bool,
    pub deadline: Option<Instant>,
}

/// Receives whole messages from one connection.
pub struct ReceiveWorker<T> {
    transport: T,
    settings: ReceiveSettings,
    stats: Arc<Statistics>,
    shutdown: Shutdown,
    sink: Arc<dyn ReportSink>,
    lifecycle: Lifecycle,
}

impl<T: Transport> ReceiveWorker<T> {
    pub fn new(
        id: usize,
        transport: T,
        settings: ReceiveSettings,
        stats: Arc<Statistics>,
        shutdown: Shutdown,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            transport,
            settings,
            stats,
            shutdown,
            sink,
            lifecycle: Lifecycle::new(id, "receive"),
        }
    }

    pub fn run(mut self) -> WorkerSummary {
        self.lifecycle.enter(WorkerState::Allocating);
        let mut buffers = match BufferSet::create(self.settings.field_size) {
            Ok(buffers) => buffers,
            Err(e) => {
                tracing::error!(worker = self.lifecycle.id, error = %e, "failed to allocate buffers");
                return self
                    .lifecycle
                    .finish(CloseReason::AllocationFailed, 0, 0, None);
            }
        };
        let message_len = buffers.message_len();

        self.lifecycle.enter(WorkerState::Transmitting);
        let mut local = LocalCounters::default();
        let mut messages = 0u64;
        let mut bytes = 0u64;
        let mut timer: Option<Instant> = None;

        let reason = loop {
            if self.shutdown.is_triggered() {
                break CloseReason::Shutdown;
            }
            if self
                .settings
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
            {
                break CloseReason::Deadline;
            }

            if buffers.remaining() == message_len
                && messages.is_multiple_of(self.settings.latency_every)
            {
                timer = Some(Instant::now());
            }

            match driver::read_message(&mut self.transport, &mut buffers) {
                Ok(_) => {}
                // progress stays in the cursor, resume on the next pass
                Err(TransferError::TimedOut) => continue,
                Err(e) if e.is_disconnect() => break CloseReason::PeerDisconnected,
                Err(e) => {
                    tracing::warn!(worker = self.lifecycle.id, error = %e, "receive failed");
                    break CloseReason::IoError;
                }
            }

            if let Some(started) = timer.take() {
                self.stats
                    .sample_latency(started.elapsed().as_micros() as u64);
            }

            if self.settings.verify
                && let Some(field) = buffers.first_mismatch()
            {
                tracing::warn!(
                    worker = self.lifecycle.id,
                    index = messages,
                    field,
                    "received field does not match filler pattern"
                );
                break CloseReason::CorruptMessage;
            }

            buffers.reset();
            local.record(message_len);
            messages += 1;
            bytes += message_len as u64;

            if local.messages() >= RECEIVE_FLUSH_EVERY {
                local.flush_into(&self.stats);
            }
            if messages.is_multiple_of(self.settings.progress_every) {
                self.sink.print_progress(&Progress::new(
                    self.lifecycle.id,
                    messages,
                    bytes,
                    self.lifecycle.started.elapsed(),
                ));
            }
        };

        self.lifecycle.enter(WorkerState::Closing);
        local.flush_into(&self.stats);

        let Self {
            transport,
            mut lifecycle,
            ..
        } = self;
        drop(transport);
        drop(buffers);

        lifecycle.finish(reason, messages, bytes, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{FIELD_COUNT, filler};
    use crate::report::{Report, Start};
    use crate::transport::testing::{RecvStep, ScriptedTransport, SendStep};
    use std::sync::Mutex;

    fn send_settings(messages: Option<u64>) -> SendSettings {
        SendSettings {
            field_size: 8,
            zero_copy: false,
            flush_every: 1000,
            backoff: Duration::from_micros(1),
            messages,
        }
    }

    fn receive_settings() -> ReceiveSettings {
        ReceiveSettings {
            field_size: 8,
            latency_every: 100,
            progress_every: 10_000,
            verify: true,
            deadline: None,
        }
    }

    fn wire(field_size: usize, messages: usize) -> Vec<u8> {
        let message: Vec<u8> = (0..FIELD_COUNT)
            .flat_map(|i| filler(i, field_size))
            .collect();
        message.repeat(messages)
    }

    #[derive(Default)]
    struct RecordingSink {
        progress: Mutex<Vec<Progress>>,
    }

    impl ReportSink for RecordingSink {
        fn print_start(&self, _start: &Start) {}

        fn print_progress(&self, progress: &Progress) {
            self.progress.lock().unwrap().push(progress.clone());
        }

        fn print_results(&self, _report: &Report) {}
    }

    #[test]
    fn send_stops_at_message_limit() {
        let stats = Arc::new(Statistics::new());
        let worker = SendWorker::new(
            0,
            ScriptedTransport::default(),
            send_settings(Some(3)),
            stats.clone(),
            Shutdown::new(),
        );

        let summary = worker.run();
        assert_eq!(summary.reason, CloseReason::MessageLimit);
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.bytes, 192);
        assert_eq!(summary.mode, Some(TransmitMode::CopyVectored));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes, 192);
        assert_eq!(snapshot.messages, 3);
        assert_eq!(snapshot.flushes, 1);
    }

    #[test]
    fn send_flushes_in_batches() {
        let stats = Arc::new(Statistics::new());
        let worker = SendWorker::new(
            0,
            ScriptedTransport::default(),
            send_settings(Some(2500)),
            stats.clone(),
            Shutdown::new(),
        );

        worker.run();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages, 2500);
        assert_eq!(snapshot.bytes, 2500 * 64);
        // two full batches plus the final partial one
        assert_eq!(snapshot.flushes, 3);
    }

    #[test]
    fn send_peer_disconnect_is_normal() {
        let stats = Arc::new(Statistics::new());
        let mut transport = ScriptedTransport::default();
        transport.send_script = vec![
            SendStep::All,
            SendStep::All,
            SendStep::Errno(libc::EPIPE),
        ]
        .into();

        let summary = SendWorker::new(
            1,
            transport,
            send_settings(None),
            stats.clone(),
            Shutdown::new(),
        )
        .run();
        assert_eq!(summary.reason, CloseReason::PeerDisconnected);
        assert!(!summary.reason.is_fault());
        assert_eq!(summary.messages, 2);
        assert_eq!(stats.snapshot().bytes, 128);
    }

    #[test]
    fn send_io_error_terminates_with_partial_totals() {
        let stats = Arc::new(Statistics::new());
        let mut transport = ScriptedTransport::default();
        transport.send_script = vec![SendStep::All, SendStep::Errno(libc::EBADF)].into();

        let summary = SendWorker::new(
            0,
            transport,
            send_settings(None),
            stats.clone(),
            Shutdown::new(),
        )
        .run();
        assert_eq!(summary.reason, CloseReason::IoError);
        assert!(summary.reason.is_fault());
        assert_eq!(stats.snapshot().messages, 1);
    }

    #[test]
    fn send_short_write_counts_bytes_sent() {
        let stats = Arc::new(Statistics::new());
        let mut transport = ScriptedTransport::default();
        transport.send_script = vec![SendStep::Partial(40)].into();

        let summary = SendWorker::new(
            0,
            transport,
            send_settings(Some(2)),
            stats.clone(),
            Shutdown::new(),
        )
        .run();
        assert_eq!(summary.messages, 2);
        assert_eq!(summary.bytes, 104);
    }

    #[test]
    fn resource_exhaustion_retries_same_message() {
        let stats = Arc::new(Statistics::new());
        let mut transport = ScriptedTransport {
            zerocopy_supported: true,
            ..Default::default()
        };
        transport.send_script = vec![
            SendStep::Errno(libc::ENOBUFS),
            SendStep::Errno(libc::ENOBUFS),
            SendStep::Errno(libc::ENOBUFS),
            SendStep::All,
            SendStep::Errno(libc::ENOBUFS),
            SendStep::All,
        ]
        .into();

        let settings = SendSettings {
            zero_copy: true,
            ..send_settings(Some(2))
        };
        let summary = SendWorker::new(0, transport, settings, stats.clone(), Shutdown::new()).run();

        assert_eq!(summary.reason, CloseReason::MessageLimit);
        assert_eq!(summary.mode, Some(TransmitMode::ZeroCopyDeferred));
        assert_eq!(summary.messages, 2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages, 2);
        assert_eq!(snapshot.bytes, 128);
    }

    #[test]
    fn failed_completion_drain_still_backs_off() {
        let stats = Arc::new(Statistics::new());
        let mut transport = ScriptedTransport {
            zerocopy_supported: true,
            drain_errno: Some(libc::ENOMEM),
            ..Default::default()
        };
        transport.send_script = vec![SendStep::Errno(libc::ENOBUFS)].into();

        let settings = SendSettings {
            zero_copy: true,
            ..send_settings(Some(2))
        };
        let summary = SendWorker::new(0, transport, settings, stats.clone(), Shutdown::new()).run();

        assert_eq!(summary.reason, CloseReason::MessageLimit);
        assert_eq!(summary.messages, 2);
        assert_eq!(stats.snapshot().bytes, 128);
    }

    #[test]
    fn enobufs_without_zero_copy_is_fatal() {
        let stats = Arc::new(Statistics::new());
        let mut transport = ScriptedTransport::default();
        transport.send_script = vec![SendStep::Errno(libc::ENOBUFS)].into();

        let summary =
            SendWorker::new(0, transport, send_settings(None), stats, Shutdown::new()).run();
        assert_eq!(summary.reason, CloseReason::IoError);
        assert_eq!(summary.messages, 0);
    }

    #[test]
    fn zero_copy_falls_back_per_connection() {
        let stats = Arc::new(Statistics::new());
        let settings = SendSettings {
            zero_copy: true,
            ..send_settings(Some(1))
        };
        let summary = SendWorker::new(
            0,
            ScriptedTransport::default(),
            settings,
            stats,
            Shutdown::new(),
        )
        .run();
        assert_eq!(summary.mode, Some(TransmitMode::CopyVectored));
        assert_eq!(summary.messages, 1);
    }

    #[test]
    fn send_observes_shutdown() {
        let stats = Arc::new(Statistics::new());
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let summary = SendWorker::new(
            0,
            ScriptedTransport::default(),
            send_settings(None),
            stats.clone(),
            shutdown,
        )
        .run();
        assert_eq!(summary.reason, CloseReason::Shutdown);
        assert_eq!(summary.messages, 0);
        assert_eq!(stats.snapshot().flushes, 0);
    }

    #[test]
    fn allocation_failure_only_ends_this_worker() {
        let stats = Arc::new(Statistics::new());
        let settings = SendSettings {
            field_size: 0,
            ..send_settings(None)
        };
        let summary = SendWorker::new(
            0,
            ScriptedTransport::default(),
            settings,
            stats.clone(),
            Shutdown::new(),
        )
        .run();
        assert_eq!(summary.reason, CloseReason::AllocationFailed);
        assert_eq!(summary.mode, None);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes, 0);
        assert_eq!(snapshot.flushes, 0);
    }

    #[test]
    fn receive_until_peer_closes() {
        let stats = Arc::new(Statistics::new());
        let sink = Arc::new(RecordingSink::default());
        let summary = ReceiveWorker::new(
            0,
            ScriptedTransport::with_stream(&wire(8, 3)),
            receive_settings(),
            stats.clone(),
            Shutdown::new(),
            sink,
        )
        .run();

        assert_eq!(summary.reason, CloseReason::PeerDisconnected);
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.bytes, 192);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes, 192);
        assert_eq!(snapshot.messages, 3);
        // first message is sampled
        assert_eq!(snapshot.latency_samples, 1);
    }

    #[test]
    fn receive_resumes_after_timeout() {
        let stats = Arc::new(Statistics::new());
        let mut transport = ScriptedTransport::with_stream(&wire(8, 2));
        transport.recv_script = vec![
            RecvStep::Chunk(10),
            RecvStep::Kind(std::io::ErrorKind::WouldBlock),
            RecvStep::Chunk(3),
            RecvStep::Errno(libc::EINTR),
            RecvStep::Kind(std::io::ErrorKind::WouldBlock),
        ]
        .into();

        let summary = ReceiveWorker::new(
            0,
            transport,
            receive_settings(),
            stats.clone(),
            Shutdown::new(),
            Arc::new(RecordingSink::default()),
        )
        .run();
        assert_eq!(summary.reason, CloseReason::PeerDisconnected);
        assert_eq!(summary.messages, 2);
        assert_eq!(stats.snapshot().bytes, 128);
    }

    #[test]
    fn receive_samples_latency_and_progress() {
        let stats = Arc::new(Statistics::new());
        let sink = Arc::new(RecordingSink::default());
        let settings = ReceiveSettings {
            latency_every: 1,
            progress_every: 2,
            ..receive_settings()
        };
        ReceiveWorker::new(
            4,
            ScriptedTransport::with_stream(&wire(8, 5)),
            settings,
            stats.clone(),
            Shutdown::new(),
            sink.clone(),
        )
        .run();

        assert_eq!(stats.snapshot().latency_samples, 5);
        let progress = sink.progress.lock().unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].connection, 4);
        assert_eq!(progress[0].messages, 2);
        assert_eq!(progress[1].messages, 4);
        assert_eq!(progress[1].bytes, 256);
    }

    #[test]
    fn receive_detects_corruption() {
        let stats = Arc::new(Statistics::new());
        let mut stream = wire(8, 2);
        stream[64 + 17] ^= 0xff;

        let summary = ReceiveWorker::new(
            0,
            ScriptedTransport::with_stream(&stream),
            receive_settings(),
            stats.clone(),
            Shutdown::new(),
            Arc::new(RecordingSink::default()),
        )
        .run();
        assert_eq!(summary.reason, CloseReason::CorruptMessage);
        assert_eq!(summary.messages, 1);
        assert_eq!(stats.snapshot().messages, 1);
    }

    #[test]
    fn receive_stops_at_deadline() {
        let settings = ReceiveSettings {
            deadline: Some(Instant::now()),
            ..receive_settings()
        };
        let summary = ReceiveWorker::new(
            0,
            ScriptedTransport::with_stream(&wire(8, 1)),
            settings,
            Arc::new(Statistics::new()),
            Shutdown::new(),
            Arc::new(RecordingSink::default()),
        )
        .run();
        assert_eq!(summary.reason, CloseReason::Deadline);
        assert_eq!(summary.messages, 0);
    }

    #[test]
    fn receive_reset_is_peer_disconnect() {
        let mut transport = ScriptedTransport::with_stream(&wire(8, 1));
        transport.recv_script = vec![
            RecvStep::Chunk(64),
            RecvStep::Errno(libc::ECONNRESET),
        ]
        .into();
        let summary = ReceiveWorker::new(
            0,
            transport,
            receive_settings(),
            Arc::new(Statistics::new()),
            Shutdown::new(),
            Arc::new(RecordingSink::default()),
        )
        .run();
        assert_eq!(summary.reason, CloseReason::PeerDisconnected);
        assert_eq!(summary.messages, 1);
    }
}
