//! Fixed-shape message buffers for vectored I/O.
//!
//! A [`BufferSet`] owns the eight field buffers that make up one message.
//! Fields are allocated once and never reallocated, so a zero-copy send that
//! references them can never observe a freed or moved allocation while the
//! set is alive.
//!
//! Transfer progress is tracked by a [`Cursor`] rather than by rewriting
//! iovec base pointers. The descriptors handed to the kernel are derived from
//! the cursor on every call: fields before the cursor are skipped, the field
//! under the cursor starts at the cursor offset, and later fields are whole.

use std::io::{IoSlice, IoSliceMut};

/// Number of fields in every message.
pub const FIELD_COUNT: usize = 8;

/// Terminating byte written to the last position of every field.
pub const SENTINEL: u8 = 0;

/// Error returned when a buffer set cannot be created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("field size must be non-zero")]
    ZeroFieldSize,
    #[error("failed to allocate {bytes} bytes for message field {field}")]
    OutOfMemory { field: usize, bytes: usize },
}

/// Position within a message, measured in (field, offset-within-field).
///
/// Advancing is a pure function of the current position, the number of bytes
/// consumed and the field size. A cursor with `field == FIELD_COUNT` is
/// complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    field: usize,
    offset: usize,
}

impl Cursor {
    /// Cursor at the start of a message.
    pub const fn start() -> Self {
        Self {
            field: 0,
            offset: 0,
        }
    }

    /// Index of the first field with bytes remaining.
    pub fn field(&self) -> usize {
        self.field
    }

    /// Bytes already transferred within the current field.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Return the cursor moved forward by `n` bytes.
    ///
    /// Fully consumed fields are skipped and the remainder lands inside the
    /// first field that still has room. The result never moves past the end
    /// of the message.
    #[must_use]
    pub fn advance(self, n: usize, field_size: usize) -> Self {
        if field_size == 0 {
            return self;
        }
        let total = FIELD_COUNT * field_size;
        let position = (self.consumed(field_size) + n).min(total);
        Self {
            field: position / field_size,
            offset: position % field_size,
        }
    }

    /// Bytes of the message already transferred.
    pub fn consumed(&self, field_size: usize) -> usize {
        self.field * field_size + self.offset
    }

    /// Bytes still to transfer.
    pub fn remaining(&self, field_size: usize) -> usize {
        FIELD_COUNT * field_size - self.consumed(field_size)
    }

    /// Remaining length of the descriptor for `field`.
    pub fn remaining_in(&self, field: usize, field_size: usize) -> usize {
        use std::cmp::Ordering;
        match field.cmp(&self.field) {
            Ordering::Less => 0,
            Ordering::Equal => field_size - self.offset,
            Ordering::Greater if field < FIELD_COUNT => field_size,
            Ordering::Greater => 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.field >= FIELD_COUNT
    }
}

/// The eight independently owned field buffers of one message.
pub struct BufferSet {
    fields: Vec<Box<[u8]>>,
    field_size: usize,
    cursor: Cursor,
    generation: u64,
}

impl BufferSet {
    /// Allocate eight fields of `field_size` bytes each, filled with the
    /// deterministic filler pattern.
    pub fn create(field_size: usize) -> Result<Self, AllocationError> {
        if field_size == 0 {
            return Err(AllocationError::ZeroFieldSize);
        }

        let mut fields = Vec::with_capacity(FIELD_COUNT);
        for field in 0..FIELD_COUNT {
            let mut buf: Vec<u8> = Vec::new();
            buf.try_reserve_exact(field_size)
                .map_err(|_| AllocationError::OutOfMemory {
                    field,
                    bytes: field_size,
                })?;
            buf.resize(field_size, 0);
            fill_field(field, &mut buf);
            fields.push(buf.into_boxed_slice());
        }

        Ok(Self {
            fields,
            field_size,
            cursor: Cursor::start(),
            generation: 0,
        })
    }

    pub fn field_size(&self) -> usize {
        self.field_size
    }

    /// Total message length, `FIELD_COUNT * field_size`.
    pub fn message_len(&self) -> usize {
        FIELD_COUNT * self.field_size
    }

    pub fn field(&self, index: usize) -> &[u8] {
        &self.fields[index]
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Content generation. Bumped whenever a field is overwritten so that
    /// in-flight zero-copy sends can be attributed to the content they
    /// referenced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes left in the current transfer.
    pub fn remaining(&self) -> usize {
        self.cursor.remaining(self.field_size)
    }

    /// Record `n` bytes of progress in the current transfer.
    pub fn advance(&mut self, n: usize) {
        self.cursor = self.cursor.advance(n, self.field_size);
    }

    /// Restore full descriptor lengths for another transfer of the same
    /// payload.
    pub fn reset(&mut self) {
        self.cursor = Cursor::start();
    }

    /// Descriptors covering the unsent suffix of the message, in field order.
    pub fn descriptors(&self) -> Vec<IoSlice<'_>> {
        let cursor = self.cursor;
        self.fields
            .iter()
            .enumerate()
            .skip(cursor.field)
            .map(|(index, field)| {
                let start = if index == cursor.field { cursor.offset } else { 0 };
                IoSlice::new(&field[start..])
            })
            .collect()
    }

    /// Writable descriptors covering at most `limit` bytes of the unfilled
    /// suffix of the message.
    pub fn descriptors_mut(&mut self, limit: usize) -> Vec<IoSliceMut<'_>> {
        let cursor = self.cursor;
        let mut budget = limit;
        let mut slices = Vec::with_capacity(FIELD_COUNT - cursor.field.min(FIELD_COUNT));

        for (index, field) in self.fields.iter_mut().enumerate().skip(cursor.field) {
            if budget == 0 {
                break;
            }
            let start = if index == cursor.field { cursor.offset } else { 0 };
            let end = field.len().min(start + budget);
            budget -= end - start;
            slices.push(IoSliceMut::new(&mut field[start..end]));
        }

        slices
    }

    /// Replace the contents of one field, starting a new content generation.
    ///
    /// Callers using zero-copy transmission must only do this once every send
    /// referencing the previous generation has been reported complete.
    pub fn overwrite_field(&mut self, index: usize, data: &[u8]) {
        let field = &mut self.fields[index];
        let len = data.len().min(field.len());
        field[..len].copy_from_slice(&data[..len]);
        field[len..].fill(0);
        self.generation += 1;
    }

    /// Index of the first field whose content differs from the filler
    /// pattern, if any.
    pub fn first_mismatch(&self) -> Option<usize> {
        let mut expected = vec![0u8; self.field_size];
        (0..FIELD_COUNT).find(|&index| {
            fill_field(index, &mut expected);
            self.fields[index][..] != expected[..]
        })
    }
}

/// Write the filler pattern for field `index` into `buf`.
///
/// Each byte walks a 26-character ASCII cycle seeded by the field index
/// (`'A'` for field 0, `'B'` for field 1, ...). The final byte is
/// [`SENTINEL`].
pub fn fill_field(index: usize, buf: &mut [u8]) {
    let Some((last, body)) = buf.split_last_mut() else {
        return;
    };
    for (i, byte) in body.iter_mut().enumerate() {
        *byte = b'A' + index as u8 + (i % 26) as u8;
    }
    *last = SENTINEL;
}

/// The expected content of field `index` for the given field size.
pub fn filler(index: usize, field_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; field_size];
    fill_field(index, &mut buf);
    buf
}
