//! Lock-free single-producer/single-consumer sample ring.
//!
//! The ring is a pre-allocated flat store of `chunks * chunk_len` samples. The
//! transfer engine appends whole chunks; the drain thread reads published
//! runs and persists them.
//!
//! # Cursor Model
//!
//! Both cursors are derived from monotonically increasing 64-bit sample
//! totals:
//!
//! ```text
//!   W = published_total mod capacity     (next free position)
//!   R = drained_total   mod capacity     (next unflushed position)
//!   pending = published_total - drained_total
//! ```
//!
//! The totals tell "empty" (`pending == 0`) apart from "full"
//! (`pending == capacity`), both of which show `R == W`, and make overwrites
//! detectable (`pending > capacity`).
//!
//! # Ordering
//!
//! - `published_total` is written only by the engine, with `Release` after the
//!   chunk copy, and read by the drain with `Acquire`.
//! - `drained_total` is written only by the drain and read by the engine.
//! - `reserved_total` is bumped by the engine *before* the copy (followed by a
//!   release fence). After copying a run the drain issues an acquire fence
//!   and reads it back, so any part of the run the engine started to
//!   overwrite during the copy is detected and discarded (seqlock pattern).

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::buffers::Sample;
use crate::error::{Result, TransferError};

/// Pre-allocated circular sample store.
pub struct RingBuffer {
    data: Box<[UnsafeCell<Sample>]>,
    chunk_len: usize,
    capacity: usize,
    published_total: AtomicU64,
    reserved_total: AtomicU64,
    drained_total: AtomicU64,
}

// SAFETY: one writer (the transfer engine) and one reader (the drain). The
// reader only copies regions published with Release ordering and validates
// the copy against `reserved_total` afterwards, discarding anything the writer
// may have touched.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocate a ring of `chunks` cells of `chunk_len` samples each.
    pub fn new(chunk_len: usize, chunks: usize) -> Result<Self> {
        if chunk_len == 0 || chunks == 0 {
            return Err(TransferError::configuration(format!(
                "ring buffer needs a non-zero chunk length and chunk count (got {chunk_len} x {chunks})"
            )));
        }
        let capacity = chunk_len.checked_mul(chunks).ok_or_else(|| {
            TransferError::configuration(format!(
                "ring buffer of {chunks} x {chunk_len} samples overflows usize"
            ))
        })?;

        let data = (0..capacity).map(|_| UnsafeCell::new(0)).collect();

        Ok(Self {
            data,
            chunk_len,
            capacity,
            published_total: AtomicU64::new(0),
            reserved_total: AtomicU64::new(0),
            drained_total: AtomicU64::new(0),
        })
    }

    /// Total capacity in samples (`L * buffer_size`).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples per chunk cell.
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Number of chunk cells (`L`).
    pub fn chunks(&self) -> usize {
        self.capacity / self.chunk_len
    }

    /// Write cursor `W`, in samples.
    pub fn write_position(&self) -> usize {
        (self.published_total() % self.capacity as u64) as usize
    }

    /// Read cursor `R`, in samples.
    pub fn read_position(&self) -> usize {
        (self.drained_total() % self.capacity as u64) as usize
    }

    /// Samples ever appended.
    pub fn published_total(&self) -> u64 {
        self.published_total.load(Ordering::Acquire)
    }

    /// Samples ever handed to storage or skipped as overwritten.
    pub fn drained_total(&self) -> u64 {
        self.drained_total.load(Ordering::Acquire)
    }

    /// Samples appended but not yet drained. Exceeds the capacity after an
    /// overflow.
    pub fn pending(&self) -> u64 {
        self.published_total()
            .saturating_sub(self.drained_total())
    }

    /// Append one chunk at `W` and advance `W`, wrapping at the capacity.
    ///
    /// Returns the number of unflushed samples this write overwrote. A chunk
    /// of any other length than `chunk_len` is rejected without touching the
    /// ring. Must only be called from the single writer.
    pub(crate) fn push_chunk(&self, chunk: &[Sample]) -> Result<u64> {
        if chunk.len() != self.chunk_len {
            return Err(TransferError::ChunkLengthMismatch {
                expected: self.chunk_len,
                actual: chunk.len(),
            });
        }
        let len = self.chunk_len;

        let start = self.published_total.load(Ordering::Relaxed);
        let end = start + len as u64;
        let drained = self.drained_total.load(Ordering::Acquire);
        let overwritten = end
            .saturating_sub(drained)
            .saturating_sub(self.capacity as u64)
            .min(len as u64);

        self.reserved_total.store(end, Ordering::Relaxed);
        fence(Ordering::Release);

        // Totals only ever advance by whole chunks, so a chunk never straddles
        // the end of the ring.
        let offset = (start % self.capacity as u64) as usize;
        // SAFETY: offset is a multiple of chunk_len and offset + len <= capacity.
        // The reader never trusts samples in this region once it observes the
        // reservation above.
        unsafe {
            std::ptr::copy_nonoverlapping(chunk.as_ptr(), self.base_ptr().add(offset), len);
        }

        self.published_total.store(end, Ordering::Release);
        Ok(overwritten)
    }

    /// Copy the run starting at absolute sample `start_total` into `out`.
    ///
    /// `out.len()` must not exceed the distance from that position to the end
    /// of the ring. Returns the length of the prefix of `out` that may have
    /// been overwritten by the writer while copying; those samples must be
    /// discarded.
    pub(crate) fn read_run(&self, start_total: u64, out: &mut [Sample]) -> usize {
        let offset = (start_total % self.capacity as u64) as usize;
        let len = out.len().min(self.capacity - offset);

        // Seqlock read: the writer may be storing into the same cells while
        // this loop runs. Volatile reads keep the compiler from caching or
        // fusing them; whatever was read concurrently is reported as torn
        // below and discarded by the caller, never interpreted.
        for (i, sample) in out[..len].iter_mut().enumerate() {
            // SAFETY: offset + i < offset + len <= capacity.
            *sample = unsafe { self.base_ptr().add(offset + i).read_volatile() };
        }

        fence(Ordering::Acquire);
        let reserved = self.reserved_total.load(Ordering::Relaxed);
        let oldest_intact = reserved.saturating_sub(self.capacity as u64);
        oldest_intact.saturating_sub(start_total).min(len as u64) as usize
    }

    /// Advance the drained total. Must only be called from the single reader.
    pub(crate) fn set_drained_total(&self, total: u64) {
        self.drained_total.store(total, Ordering::Release);
    }

    /// Copy of the whole sample store, position 0 first.
    ///
    /// Meant for inspection while the engine is idle; samples being written
    /// concurrently may be torn.
    pub fn snapshot(&self) -> Vec<Sample> {
        let mut out = vec![0; self.capacity];
        fence(Ordering::Acquire);
        // SAFETY: both regions are `capacity` samples long.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base_ptr(), out.as_mut_ptr(), self.capacity);
        }
        out
    }

    fn base_ptr(&self) -> *mut Sample {
        UnsafeCell::raw_get(self.data.as_ptr())
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("chunk_len", &self.chunk_len)
            .field("write_position", &self.write_position())
            .field("read_position", &self.read_position())
            .field("pending", &self.pending())
            .finish()
    }
}
