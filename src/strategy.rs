//! Transmission strategies.
//!
//! Both strategies issue one gather write of a full message per call. They
//! differ in the send flags they pass and in what they must do afterwards:
//!
//! - [`CopyVectored`] relies on the kernel copying the gathered buffers into
//!   socket memory. The buffers are reusable as soon as the call returns.
//! - [`ZeroCopyDeferred`] asks the kernel to transmit from the user pages.
//!   Buffers stay referenced until the kernel reports completion, so every
//!   accepted send is recorded in a [`CompletionQueue`] and retired by
//!   draining the socket error queue.
//!
//! Zero-copy support is negotiated once per connection by [`negotiate`].
//! Endpoints that refuse it transparently get [`CopyVectored`].

use crate::buffer::BufferSet;
use crate::completion::{CompletionQueue, CompletionRange};
use crate::driver;
use crate::error::TransferError;
use crate::transport::{SendFlags, Transport};
use serde::Serialize;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// Number of outstanding zero-copy sends that triggers an opportunistic
/// drain of the completion queue before the next send.
const RECLAIM_THRESHOLD: usize = 256;

/// Interval between completion drains while settling.
const SETTLE_POLL: Duration = Duration::from_millis(1);

/// Which transmit path a connection is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransmitMode {
    CopyVectored,
    ZeroCopyDeferred,
}

impl fmt::Display for TransmitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitMode::CopyVectored => write!(f, "copy-vectored"),
            TransmitMode::ZeroCopyDeferred => write!(f, "zero-copy-deferred"),
        }
    }
}

/// Policy for issuing one full-message gather write.
pub trait TransmitStrategy: Send {
    fn mode(&self) -> TransmitMode;

    /// Issue one gather write of the whole message in `buffers`.
    ///
    /// Returns the bytes the kernel accepted. A short write is not resumed.
    fn transmit(
        &mut self,
        transport: &mut dyn Transport,
        buffers: &BufferSet,
    ) -> Result<usize, TransferError>;

    /// Retire buffer references the kernel has released. Never blocks.
    ///
    /// Returns the number of sends retired.
    fn reclaim(&mut self, _transport: &mut dyn Transport) -> Result<usize, TransferError> {
        Ok(0)
    }

    /// Sends still referencing user buffers.
    fn outstanding(&self) -> usize {
        0
    }

    /// Whether buffer content of `generation` may be overwritten or freed.
    fn is_released(&self, _generation: u64) -> bool {
        true
    }

    /// Drain completions until nothing is outstanding or `timeout` expires.
    ///
    /// Returns `true` if every send was retired.
    fn settle(&mut self, transport: &mut dyn Transport, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reclaim(transport).is_err() {
                return self.outstanding() == 0;
            }
            if self.outstanding() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(SETTLE_POLL);
        }
    }
}

/// Gather write with no special flags.
#[derive(Debug, Default)]
pub struct CopyVectored;

impl TransmitStrategy for CopyVectored {
    fn mode(&self) -> TransmitMode {
        TransmitMode::CopyVectored
    }

    fn transmit(
        &mut self,
        transport: &mut dyn Transport,
        buffers: &BufferSet,
    ) -> Result<usize, TransferError> {
        driver::gather_write(transport, buffers, SendFlags::NONE)
    }
}

/// Gather write with the zero-copy hint and deferred buffer release.
#[derive(Debug, Default)]
pub struct ZeroCopyDeferred {
    completions: CompletionQueue,
    scratch: Vec<CompletionRange>,
    copied_reported: bool,
}

impl ZeroCopyDeferred {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completions(&self) -> &CompletionQueue {
        &self.completions
    }
}

impl TransmitStrategy for ZeroCopyDeferred {
    fn mode(&self) -> TransmitMode {
        TransmitMode::ZeroCopyDeferred
    }

    fn transmit(
        &mut self,
        transport: &mut dyn Transport,
        buffers: &BufferSet,
    ) -> Result<usize, TransferError> {
        if self.completions.outstanding() >= RECLAIM_THRESHOLD
            && let Err(e) = self.reclaim(transport)
        {
            tracing::debug!(error = %e, "completion drain failed, sending anyway");
        }

        match driver::gather_write(transport, buffers, SendFlags::ZEROCOPY) {
            Ok(n) => {
                self.completions.record(buffers.generation(), n);
                Ok(n)
            }
            Err(TransferError::ResourceExhausted) => {
                // Notification memory is a common cause, release what we can
                // before the caller backs off.
                if let Err(e) = self.reclaim(transport) {
                    tracing::debug!(error = %e, "completion drain failed during backoff");
                }
                Err(TransferError::ResourceExhausted)
            }
            Err(e) => Err(e),
        }
    }

    fn reclaim(&mut self, transport: &mut dyn Transport) -> Result<usize, TransferError> {
        self.scratch.clear();
        transport
            .drain_completions(&mut self.scratch)
            .map_err(|e| TransferError::from_io(e, false))?;

        let mut retired = 0;
        for range in self.scratch.drain(..) {
            retired += self.completions.retire(range);
        }

        if !self.copied_reported && self.completions.copied() > 0 {
            self.copied_reported = true;
            tracing::debug!("kernel fell back to copying for zero-copy sends on this connection");
        }

        Ok(retired)
    }

    fn outstanding(&self) -> usize {
        self.completions.outstanding()
    }

    fn is_released(&self, generation: u64) -> bool {
        self.completions.is_released(generation)
    }
}

/// Pick the transmit strategy for a connection.
///
/// When zero-copy is requested but the endpoint refuses it, the connection
/// falls back to [`CopyVectored`] with a warning instead of failing.
pub fn negotiate(zero_copy: bool, transport: &mut dyn Transport) -> Box<dyn TransmitStrategy> {
    if !zero_copy {
        return Box::new(CopyVectored);
    }

    match transport.enable_zerocopy() {
        Ok(()) => Box::new(ZeroCopyDeferred::new()),
        Err(e) => {
            tracing::warn!(error = %e, "zero-copy unavailable, falling back to copy-vectored");
            Box::new(CopyVectored)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ScriptedTransport, SendStep};

    #[test]
    fn copy_only_when_not_requested() {
        let mut transport = ScriptedTransport {
            zerocopy_supported: true,
            ..Default::default()
        };
        assert_eq!(
            negotiate(false, &mut transport).mode(),
            TransmitMode::CopyVectored
        );
    }

    #[test]
    fn falls_back_when_unsupported() {
        let mut transport = ScriptedTransport::default();
        let mut strategy = negotiate(true, &mut transport);
        assert_eq!(strategy.mode(), TransmitMode::CopyVectored);

        let buffers = BufferSet::create(8).unwrap();
        assert_eq!(strategy.transmit(&mut transport, &buffers).unwrap(), 64);
        assert_eq!(transport.send_flags, vec![SendFlags::NONE]);
    }

    #[test]
    fn zero_copy_when_supported() {
        let mut transport = ScriptedTransport {
            zerocopy_supported: true,
            ..Default::default()
        };
        let mut strategy = negotiate(true, &mut transport);
        assert_eq!(strategy.mode(), TransmitMode::ZeroCopyDeferred);

        let buffers = BufferSet::create(8).unwrap();
        strategy.transmit(&mut transport, &buffers).unwrap();
        strategy.transmit(&mut transport, &buffers).unwrap();
        assert_eq!(transport.send_flags, vec![SendFlags::ZEROCOPY; 2]);
        assert_eq!(strategy.outstanding(), 2);
        assert!(!strategy.is_released(buffers.generation()));

        transport.completions.push_back(CompletionRange {
            lo: 0,
            hi: 1,
            copied: false,
        });
        assert_eq!(strategy.reclaim(&mut transport).unwrap(), 2);
        assert_eq!(strategy.outstanding(), 0);
        assert!(strategy.is_released(buffers.generation()));
    }

    #[test]
    fn exhaustion_is_retryable_and_not_recorded() {
        let mut transport = ScriptedTransport::default();
        transport.send_script = vec![SendStep::Errno(libc::ENOBUFS)].into();
        let mut strategy = ZeroCopyDeferred::new();
        let buffers = BufferSet::create(8).unwrap();

        let err = strategy.transmit(&mut transport, &buffers).unwrap_err();
        assert!(matches!(err, TransferError::ResourceExhausted));
        assert_eq!(strategy.outstanding(), 0);

        assert_eq!(strategy.transmit(&mut transport, &buffers).unwrap(), 64);
        assert_eq!(strategy.completions().outstanding(), 1);
    }

    #[test]
    fn new_generation_waits_for_old_sends() {
        let mut transport = ScriptedTransport::default();
        let mut strategy = ZeroCopyDeferred::new();
        let mut buffers = BufferSet::create(8).unwrap();

        strategy.transmit(&mut transport, &buffers).unwrap();
        let old = buffers.generation();
        assert!(!strategy.is_released(old));

        transport.completions.push_back(CompletionRange {
            lo: 0,
            hi: 0,
            copied: true,
        });
        assert!(strategy.settle(&mut transport, Duration::from_millis(50)));
        assert!(strategy.is_released(old));

        buffers.overwrite_field(0, b"fresh");
        strategy.transmit(&mut transport, &buffers).unwrap();
        assert!(!strategy.is_released(buffers.generation()));
        assert_eq!(strategy.completions().copied(), 1);
    }

    #[test]
    fn settle_times_out_with_outstanding_sends() {
        let mut transport = ScriptedTransport::default();
        let mut strategy = ZeroCopyDeferred::new();
        let buffers = BufferSet::create(8).unwrap();
        strategy.transmit(&mut transport, &buffers).unwrap();

        assert!(!strategy.settle(&mut transport, Duration::from_millis(5)));
        assert_eq!(strategy.outstanding(), 1);
    }
}
