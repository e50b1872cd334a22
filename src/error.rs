//! Error types.

use crate::buffer::AllocationError;
use crate::config::ConfigError;
use std::io;

/// Outcome of a failed transfer on one connection.
///
/// Only [`TransferError::Io`] represents an unexpected fault. Peer
/// disconnects are normal terminations, resource exhaustion is retryable and
/// a timeout leaves accumulated progress intact for the caller to resume.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("zero-copy transmit resources exhausted")]
    ResourceExhausted,
    #[error("no data before read timeout")]
    TimedOut,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Classify a raw socket error.
    ///
    /// `ENOBUFS` is only a retryable condition on the zero-copy path; on a
    /// plain vectored write it is reported as an ordinary I/O error.
    pub fn from_io(err: io::Error, zero_copy: bool) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => return TransferError::PeerDisconnected,
            io::ErrorKind::UnexpectedEof => return TransferError::ConnectionClosed,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                return TransferError::TimedOut;
            }
            _ => {}
        }
        if zero_copy && err.raw_os_error() == Some(libc::ENOBUFS) {
            return TransferError::ResourceExhausted;
        }
        TransferError::Io(err)
    }

    /// Whether this error ends the connection without indicating a fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransferError::PeerDisconnected | TransferError::ConnectionClosed
        )
    }
}

/// Top-level error for the server and client orchestrators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),
}
