//! Flat receive buffer for accumulating partial reads.
//!
//! A contiguous fixed-capacity byte buffer with three cursors:
//! `read <= write <= last <= capacity`. Incoming bytes land in a region
//! obtained from [`FlatBuffer::prepare`] and become readable after
//! [`FlatBuffer::commit`]; the framing loop consumes whole PDUs from the
//! front. When the tail region is too small for the next read, the live
//! bytes are moved to the origin with a single copy.
//!
//! The capacity is fixed on purpose: it bounds memory per session and
//! leaves backpressure as the only pushback mechanism.

use crate::error::{Error, Result};

/// Contiguous receive buffer with compaction.
#[derive(Debug)]
pub struct FlatBuffer {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    last: usize,
    compactions: u64,
}

impl FlatBuffer {
    /// Create a buffer with the given fixed capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            last: 0,
            compactions: 0,
        }
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of readable bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.write - self.read
    }

    /// Remaining space, counting the region reclaimable by compaction.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.size()
    }

    /// Whether there are no readable bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// The readable region.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    /// Number of compactions performed so far.
    #[inline]
    pub fn compactions(&self) -> u64 {
        self.compactions
    }

    /// Reset all cursors, discarding buffered bytes.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.last = 0;
    }

    /// Obtain a writable region of exactly `n` bytes, compacting if the
    /// tail is too small.
    ///
    /// Fails with [`Error::BufferOverflow`] iff `size() + n > capacity()`.
    pub fn prepare(&mut self, n: usize) -> Result<&mut [u8]> {
        if n <= self.capacity() - self.write {
            self.last = self.write + n;
            return Ok(&mut self.buf[self.write..self.write + n]);
        }

        let len = self.size();
        if len + n > self.capacity() {
            return Err(Error::BufferOverflow);
        }

        if len > 0 {
            self.buf.copy_within(self.read..self.write, 0);
            self.compactions += 1;
        }

        self.read = 0;
        self.write = len;
        self.last = len + n;
        Ok(&mut self.buf[len..len + n])
    }

    /// Advance the write cursor by `n` bytes (clamped to the prepared
    /// region).
    pub fn commit(&mut self, n: usize) {
        self.write += n.min(self.last - self.write);
    }

    /// Advance the read cursor by `n` bytes; resets to the origin when the
    /// buffer would empty.
    pub fn consume(&mut self, n: usize) {
        if n >= self.size() {
            self.read = 0;
            self.write = 0;
            return;
        }
        self.read += n;
    }
}
