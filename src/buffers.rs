//! Hardware buffer pair access.
//!
//! The acquisition driver owns two chunk-sized sample buffers and fills them
//! alternately. The transfer engine only ever reads the buffer the driver just
//! completed, through the [`BufferPair`] trait:
//!
//! - [`DriverBufferPair`] views the two driver-owned buffers through raw
//!   pointers handed over at configuration time.
//! - [`OwnedBufferPair`] is a host-allocated pair, used by the simulated
//!   driver and by tests.

use std::fmt;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

/// Sample word delivered by the acquisition card.
pub type Sample = i16;

/// Width of one sample in bytes, as written to storage.
pub const SAMPLE_BYTES: usize = std::mem::size_of::<Sample>();

/// Identifies which of the two hardware buffers was just filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum SlotId {
    /// First hardware buffer (id 0)
    #[default]
    First = 0,
    /// Second hardware buffer (id 1)
    Second = 1,
}

impl SlotId {
    /// Index into a two-element array.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The slot the driver fills next.
    pub fn flip(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

impl TryFrom<u8> for SlotId {
    type Error = u8;

    fn try_from(raw: u8) -> std::result::Result<Self, u8> {
        match raw {
            0 => Ok(Self::First),
            1 => Ok(Self::Second),
            other => Err(other),
        }
    }
}

impl From<SlotId> for u8 {
    fn from(slot: SlotId) -> Self {
        slot as u8
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Read access to the two alternating hardware buffers.
///
/// A chunk returned by [`chunk`](BufferPair::chunk) is only guaranteed to be
/// stable between the driver completing it and the driver starting to refill
/// the same slot, one full alternation later.
pub trait BufferPair: Send {
    /// Number of samples in each buffer.
    fn chunk_len(&self) -> usize;

    /// The samples of one buffer.
    fn chunk(&self, slot: SlotId) -> &[Sample];
}

/// Borrowed view of the two driver-owned acquisition buffers.
pub struct DriverBufferPair {
    buffers: [NonNull<Sample>; 2],
    len: usize,
}

// SAFETY: the pointers refer to driver memory that outlives the pair (see
// `from_raw`); the pair only reads through them, on the callback thread.
unsafe impl Send for DriverBufferPair {}

impl DriverBufferPair {
    /// Wrap the two buffers registered with the driver.
    ///
    /// Fails with a configuration fault if either pointer is null or `len` is
    /// zero.
    ///
    /// # Safety
    ///
    /// Both pointers must point to `len` initialized, properly aligned samples
    /// that stay allocated for the lifetime of the returned pair. The caller
    /// guarantees the driver does not write a slot while the transfer engine is
    /// reading it, which holds when the engine runs inside the driver's
    /// completion callback.
    pub unsafe fn from_raw(first: *const Sample, second: *const Sample, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(TransferError::configuration(
                "hardware buffer length must be greater than 0",
            ));
        }
        let first = NonNull::new(first.cast_mut())
            .ok_or_else(|| TransferError::configuration("hardware buffer 0 is null"))?;
        let second = NonNull::new(second.cast_mut())
            .ok_or_else(|| TransferError::configuration("hardware buffer 1 is null"))?;

        Ok(Self {
            buffers: [first, second],
            len,
        })
    }
}

impl BufferPair for DriverBufferPair {
    fn chunk_len(&self) -> usize {
        self.len
    }

    fn chunk(&self, slot: SlotId) -> &[Sample] {
        // SAFETY: `from_raw` contract: `len` valid samples behind each pointer.
        unsafe { std::slice::from_raw_parts(self.buffers[slot.index()].as_ptr(), self.len) }
    }
}

impl fmt::Debug for DriverBufferPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverBufferPair")
            .field("first", &self.buffers[0])
            .field("second", &self.buffers[1])
            .field("len", &self.len)
            .finish()
    }
}

/// Host-allocated buffer pair.
#[derive(Debug, Clone)]
pub struct OwnedBufferPair {
    buffers: [Box<[Sample]>; 2],
}

impl OwnedBufferPair {
    /// Allocate two zeroed buffers of `len` samples.
    pub fn new(len: usize) -> Self {
        Self {
            buffers: [
                vec![0; len].into_boxed_slice(),
                vec![0; len].into_boxed_slice(),
            ],
        }
    }

    /// Copy `samples` into a slot, as the driver would when completing it.
    pub fn fill(&mut self, slot: SlotId, samples: &[Sample]) -> Result<()> {
        let target = &mut self.buffers[slot.index()];
        if samples.len() != target.len() {
            return Err(TransferError::configuration(format!(
                "chunk of {} samples does not match buffer length {}",
                samples.len(),
                target.len()
            )));
        }
        target.copy_from_slice(samples);
        Ok(())
    }

    /// Mutable access to a slot for in-place generation.
    pub fn slot_mut(&mut self, slot: SlotId) -> &mut [Sample] {
        &mut self.buffers[slot.index()]
    }
}

impl BufferPair for OwnedBufferPair {
    fn chunk_len(&self) -> usize {
        self.buffers[0].len()
    }

    fn chunk(&self, slot: SlotId) -> &[Sample] {
        &self.buffers[slot.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_id_flip_and_raw() {
        assert_eq!(SlotId::First.flip(), SlotId::Second);
        assert_eq!(SlotId::Second.flip(), SlotId::First);
        assert_eq!(SlotId::try_from(1), Ok(SlotId::Second));
        assert_eq!(SlotId::try_from(2), Err(2));
        assert_eq!(u8::from(SlotId::Second), 1);
        assert_eq!(SlotId::First.to_string(), "0");
    }

    #[test]
    fn test_owned_pair_fill() {
        let mut pair = OwnedBufferPair::new(4);
        pair.fill(SlotId::Second, &[1, 2, 3, 4]).unwrap();
        assert_eq!(pair.chunk(SlotId::Second), &[1, 2, 3, 4]);
        assert_eq!(pair.chunk(SlotId::First), &[0, 0, 0, 0]);
        assert!(pair.fill(SlotId::First, &[1, 2]).is_err());
    }

    #[test]
    fn test_driver_pair_reads_raw_buffers() {
        let first: Vec<Sample> = vec![10, 11, 12];
        let second: Vec<Sample> = vec![20, 21, 22];

        let pair = unsafe { DriverBufferPair::from_raw(first.as_ptr(), second.as_ptr(), 3) }.unwrap();
        assert_eq!(pair.chunk_len(), 3);
        assert_eq!(pair.chunk(SlotId::First), &[10, 11, 12]);
        assert_eq!(pair.chunk(SlotId::Second), &[20, 21, 22]);
    }

    #[test]
    fn test_driver_pair_rejects_null() {
        let first: Vec<Sample> = vec![0; 3];
        let result = unsafe { DriverBufferPair::from_raw(first.as_ptr(), std::ptr::null(), 3) };
        assert!(matches!(result, Err(TransferError::ConfigurationFault { .. })));
    }
}
