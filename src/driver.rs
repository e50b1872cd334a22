//! Partial I/O driver.
//!
//! A stream socket may transfer fewer bytes than requested on any call. The
//! driver owns the loop that turns individual vectored system calls into
//! whole-message transfers:
//!
//! - [`gather_write`] issues exactly one vectored send of the unsent part of
//!   a message and reports how many bytes the kernel accepted.
//! - [`scatter_read`] issues vectored receives until the requested number of
//!   bytes has landed, advancing the buffer set cursor after every short
//!   read so the next call only fills the unfilled suffix.
//!
//! Interrupted calls are retried without touching accumulated progress.

use crate::buffer::BufferSet;
use crate::error::TransferError;
use crate::transport::{SendFlags, Transport};
use std::io;

/// Issue one gather write of the remaining descriptors of `buffers`.
///
/// The buffer set cursor is not advanced; the caller decides whether a short
/// write is resumed or simply counted.
pub fn gather_write<T: Transport + ?Sized>(
    transport: &mut T,
    buffers: &BufferSet,
    flags: SendFlags,
) -> Result<usize, TransferError> {
    let slices = buffers.descriptors();
    loop {
        match transport.send_vectored(&slices, flags) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::from_io(e, flags.is_zerocopy())),
        }
    }
}

/// Read until `total_expected` more bytes have been received into `buffers`.
///
/// `total_expected` is clamped to the bytes remaining in the current
/// transfer. Returns the number of bytes read by this call.
///
/// A receive of zero bytes ends the transfer with
/// [`TransferError::ConnectionClosed`]. On [`TransferError::TimedOut`] the
/// bytes received so far stay recorded in the cursor and a later call
/// resumes where this one stopped.
pub fn scatter_read<T: Transport + ?Sized>(
    transport: &mut T,
    buffers: &mut BufferSet,
    total_expected: usize,
) -> Result<usize, TransferError> {
    let target = total_expected.min(buffers.remaining());
    let mut received = 0;

    while received < target {
        let result = {
            let mut slices = buffers.descriptors_mut(target - received);
            transport.recv_vectored(&mut slices)
        };

        match result {
            Ok(0) => return Err(TransferError::ConnectionClosed),
            Ok(n) => {
                buffers.advance(n);
                received += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::from_io(e, false)),
        }
    }

    Ok(received)
}

/// Receive the rest of the current message.
pub fn read_message<T: Transport + ?Sized>(
    transport: &mut T,
    buffers: &mut BufferSet,
) -> Result<usize, TransferError> {
    let remaining = buffers.remaining();
    scatter_read(transport, buffers, remaining)
}
