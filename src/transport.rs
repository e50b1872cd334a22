//! Socket abstraction used by the transfer driver.
//!
//! The [`Transport`] trait is the seam between the driver and the kernel. It
//! is implemented for [`TcpStream`] using `sendmsg` so that per-call send
//! flags (the zero-copy hint) can be passed, and by scripted in-memory
//! transports in tests to inject short reads and error conditions.

use crate::completion::CompletionRange;
use std::io::{self, IoSlice, IoSliceMut, Read};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

/// Flags for a single gather write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags(libc::c_int);

impl SendFlags {
    /// Plain vectored send.
    pub const NONE: SendFlags = SendFlags(0);

    /// Ask the kernel to transmit directly from the user pages.
    pub const ZEROCOPY: SendFlags = SendFlags(sys::MSG_ZEROCOPY);

    pub fn bits(&self) -> libc::c_int {
        self.0
    }

    pub fn is_zerocopy(&self) -> bool {
        self.0 & sys::MSG_ZEROCOPY != 0
    }
}

/// A connected byte-stream endpoint.
pub trait Transport {
    /// Issue one vectored send of `bufs`.
    ///
    /// Returns the number of bytes accepted by the kernel, which may be less
    /// than the total length of `bufs`.
    fn send_vectored(&mut self, bufs: &[IoSlice<'_>], flags: SendFlags) -> io::Result<usize>;

    /// Issue one vectored receive into `bufs`.
    ///
    /// Returns `Ok(0)` when the peer has closed its side of the stream.
    fn recv_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;

    /// Enable zero-copy transmission on this endpoint.
    ///
    /// Transports without kernel support return `ErrorKind::Unsupported`.
    fn enable_zerocopy(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "zero-copy transmission not supported",
        ))
    }

    /// Collect zero-copy completion notifications without blocking.
    ///
    /// Appends one [`CompletionRange`] per notification and returns how many
    /// were appended.
    fn drain_completions(&mut self, _out: &mut Vec<CompletionRange>) -> io::Result<usize> {
        Ok(0)
    }
}

impl Transport for TcpStream {
    fn send_vectored(&mut self, bufs: &[IoSlice<'_>], flags: SendFlags) -> io::Result<usize> {
        sys::sendmsg(self.as_raw_fd(), bufs, flags.bits() | sys::MSG_NOSIGNAL)
    }

    fn recv_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.read_vectored(bufs)
    }

    fn enable_zerocopy(&mut self) -> io::Result<()> {
        enable_zerocopy(self.as_raw_fd())
    }

    fn drain_completions(&mut self, out: &mut Vec<CompletionRange>) -> io::Result<usize> {
        sys::recv_zerocopy_completions(self.as_raw_fd(), out)
    }
}

/// Set `SO_ZEROCOPY` on a raw socket.
pub fn enable_zerocopy(fd: RawFd) -> io::Result<()> {
    sys::enable_zerocopy(fd)
}

#[cfg(target_os = "linux")]
mod sys {
    use crate::completion::CompletionRange;
    use std::io::{self, IoSlice};
    use std::mem;
    use std::os::fd::RawFd;

    // Not exported by every libc target, values are fixed by the kernel ABI.
    pub const MSG_ZEROCOPY: libc::c_int = 0x400_0000;
    pub const MSG_NOSIGNAL: libc::c_int = libc::MSG_NOSIGNAL;
    const SO_ZEROCOPY: libc::c_int = 60;
    const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
    const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

    /// `struct sock_extended_err` from `linux/errqueue.h`.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct SockExtendedErr {
        ee_errno: u32,
        ee_origin: u8,
        ee_type: u8,
        ee_code: u8,
        ee_pad: u8,
        ee_info: u32,
        ee_data: u32,
    }

    pub fn sendmsg(fd: RawFd, bufs: &[IoSlice<'_>], flags: libc::c_int) -> io::Result<usize> {
        // SAFETY: IoSlice is ABI compatible with iovec on unix and the
        // slices outlive the call.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;

        let result = unsafe { libc::sendmsg(fd, &msg, flags) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(result as usize)
    }

    pub fn enable_zerocopy(fd: RawFd) -> io::Result<()> {
        let one: libc::c_int = 1;
        let result = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                SO_ZEROCOPY,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn recv_zerocopy_completions(
        fd: RawFd,
        out: &mut Vec<CompletionRange>,
    ) -> io::Result<usize> {
        let mut count = 0;

        loop {
            // u64 storage keeps the control buffer aligned for cmsghdr.
            let mut control = [0u64; 16];
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = mem::size_of_val(&control) as _;

            let result =
                unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
            if result < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(count),
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err),
                }
            }

            let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
            while !cmsg.is_null() {
                let header = unsafe { &*cmsg };
                let is_recverr = (header.cmsg_level == libc::SOL_IP
                    && header.cmsg_type == libc::IP_RECVERR)
                    || (header.cmsg_level == libc::SOL_IPV6
                        && header.cmsg_type == libc::IPV6_RECVERR);

                if is_recverr {
                    let err = unsafe {
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const SockExtendedErr)
                    };
                    if err.ee_origin == SO_EE_ORIGIN_ZEROCOPY && err.ee_errno == 0 {
                        out.push(CompletionRange {
                            lo: err.ee_info,
                            hi: err.ee_data,
                            copied: err.ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0,
                        });
                        count += 1;
                    }
                }

                cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use crate::completion::CompletionRange;
    use std::io::{self, IoSlice};
    use std::mem;
    use std::os::fd::RawFd;

    pub const MSG_ZEROCOPY: libc::c_int = 0;
    pub const MSG_NOSIGNAL: libc::c_int = 0;

    pub fn sendmsg(fd: RawFd, bufs: &[IoSlice<'_>], flags: libc::c_int) -> io::Result<usize> {
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;

        let result = unsafe { libc::sendmsg(fd, &msg, flags) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(result as usize)
    }

    pub fn enable_zerocopy(_fd: RawFd) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "zero-copy transmission requires Linux 4.14 or newer",
        ))
    }

    pub fn recv_zerocopy_completions(
        _fd: RawFd,
        _out: &mut Vec<CompletionRange>,
    ) -> io::Result<usize> {
        Ok(0)
    }
}
