//! Zero-copy completion tracking.
//!
//! Every successful `sendmsg` with the zero-copy flag is assigned a sequence
//! number by the kernel, starting at zero and incrementing per call. The
//! kernel later reports, on the socket error queue, ranges of sequence
//! numbers whose pages it no longer references. Until a send is retired its
//! buffers must not be modified or freed.
//!
//! [`CompletionQueue`] mirrors the kernel counter: sends are recorded in
//! FIFO order together with the buffer generation they referenced, and
//! notifications retire them.

use std::collections::VecDeque;

/// A contiguous, inclusive range of retired send sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRange {
    pub lo: u32,
    pub hi: u32,
    /// The kernel fell back to copying for these sends.
    pub copied: bool,
}

impl CompletionRange {
    /// Whether `seq` falls inside this range, accounting for wraparound.
    pub fn contains(&self, seq: u32) -> bool {
        seq.wrapping_sub(self.lo) <= self.hi.wrapping_sub(self.lo)
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    seq: u32,
    generation: u64,
    bytes: usize,
}

/// Outstanding zero-copy sends awaiting kernel completion.
#[derive(Debug, Default)]
pub struct CompletionQueue {
    next_seq: u32,
    outstanding: VecDeque<InFlight>,
    outstanding_bytes: usize,
    retired: u64,
    copied: u64,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send the kernel accepted with the zero-copy flag.
    ///
    /// Returns the sequence number the kernel assigned to it.
    pub fn record(&mut self, generation: u64, bytes: usize) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding.push_back(InFlight {
            seq,
            generation,
            bytes,
        });
        self.outstanding_bytes += bytes;
        seq
    }

    /// Retire every outstanding send covered by `range`.
    ///
    /// Returns the number of sends retired.
    pub fn retire(&mut self, range: CompletionRange) -> usize {
        let before = self.outstanding.len();

        // Notifications normally arrive in order, so the common case only
        // pops from the front.
        while let Some(front) = self.outstanding.front() {
            if !range.contains(front.seq) {
                break;
            }
            self.outstanding_bytes -= front.bytes;
            self.outstanding.pop_front();
        }

        let mut released = 0;
        self.outstanding.retain(|entry| {
            if range.contains(entry.seq) {
                released += entry.bytes;
                false
            } else {
                true
            }
        });
        self.outstanding_bytes -= released;

        let retired = before - self.outstanding.len();
        self.retired += retired as u64;
        if range.copied {
            self.copied += retired as u64;
        }
        retired
    }

    /// Number of sends still referencing user buffers.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes
    }

    /// Whether no outstanding send references buffer content of
    /// `generation`.
    pub fn is_released(&self, generation: u64) -> bool {
        !self
            .outstanding
            .iter()
            .any(|entry| entry.generation == generation)
    }

    /// Total sends retired so far.
    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Sends the kernel reported as copied rather than transmitted from user
    /// pages.
    pub fn copied(&self) -> u64 {
        self.copied
    }
}
