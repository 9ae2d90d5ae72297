//! Element-wise chunk accumulation.
//!
//! In accumulate mode every delivered chunk is summed into a fixed-size buffer
//! of `i64` sums instead of being archived. A chunk may carry several
//! consecutive records (`records_per_chunk`); all of them fold into the same
//! record-length accumulator:
//!
//! ```text
//! Accumulator[j] += chunk[i * record_len + j]   for i in 0..records_per_chunk
//! ```
//!
//! The transfer engine is the only writer. The host reads a copy through
//! [`Accumulator::snapshot`] and clears the sums between measurement runs.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::buffers::Sample;
use crate::error::{Result, TransferError};

/// Running per-position sums.
#[derive(Debug)]
pub struct Accumulator {
    sums: Box<[AtomicI64]>,
    records_per_chunk: usize,
    chunks: AtomicU64,
}

impl Accumulator {
    /// Allocate zeroed sums for `record_len` positions.
    pub fn new(record_len: usize, records_per_chunk: usize) -> Result<Self> {
        if record_len == 0 || records_per_chunk == 0 {
            return Err(TransferError::configuration(format!(
                "accumulator needs a non-zero record length and record count (got {record_len} x {records_per_chunk})"
            )));
        }
        Ok(Self {
            sums: (0..record_len).map(|_| AtomicI64::new(0)).collect(),
            records_per_chunk,
            chunks: AtomicU64::new(0),
        })
    }

    /// Number of sums (one per sample position of a record).
    pub fn record_len(&self) -> usize {
        self.sums.len()
    }

    /// Records folded in per delivered chunk.
    pub fn records_per_chunk(&self) -> usize {
        self.records_per_chunk
    }

    /// Chunks accumulated since allocation or the last clear.
    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Acquire)
    }

    /// Add every record of `chunk` into the sums.
    ///
    /// Single writer only: each sum is updated with a plain load and store.
    pub(crate) fn add_chunk(&self, chunk: &[Sample]) {
        for record in chunk
            .chunks_exact(self.sums.len())
            .take(self.records_per_chunk)
        {
            for (sum, &sample) in self.sums.iter().zip(record) {
                let value = sum.load(Ordering::Relaxed).saturating_add(i64::from(sample));
                sum.store(value, Ordering::Relaxed);
            }
        }
        self.chunks.fetch_add(1, Ordering::Release);
    }

    /// Reset all sums to zero.
    pub fn clear(&self) {
        for sum in self.sums.iter() {
            sum.store(0, Ordering::Relaxed);
        }
        self.chunks.store(0, Ordering::Release);
    }

    /// Copy of the current sums.
    pub fn snapshot(&self, channels: usize) -> AccumulatorSnapshot {
        let chunks = self.chunks.load(Ordering::Acquire);
        AccumulatorSnapshot {
            sums: self.sums.iter().map(|s| s.load(Ordering::Relaxed)).collect(),
            chunks,
            records_per_chunk: self.records_per_chunk,
            channels: channels.max(1),
        }
    }
}

/// Owned copy of the accumulator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccumulatorSnapshot {
    /// Sum per sample position
    pub sums: Vec<i64>,
    /// Number of chunks summed
    pub chunks: u64,
    /// Records folded in per chunk
    pub records_per_chunk: usize,
    /// Interleaved channel count (flat striding)
    pub channels: usize,
}

impl AccumulatorSnapshot {
    /// Total number of records summed into each position.
    pub fn records(&self) -> u64 {
        self.chunks * self.records_per_chunk as u64
    }

    /// Sums of one interleaved channel.
    pub fn channel(&self, channel: usize) -> Vec<i64> {
        if channel >= self.channels {
            return Vec::new();
        }
        self.sums
            .iter()
            .skip(channel)
            .step_by(self.channels)
            .copied()
            .collect()
    }

    /// Per-position average over all summed records.
    pub fn mean(&self) -> Vec<f64> {
        let records = self.records();
        if records == 0 {
            return vec![0.0; self.sums.len()];
        }
        self.sums
            .iter()
            .map(|&sum| sum as f64 / records as f64)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sums_across_chunks() {
        let acc = Accumulator::new(4, 1).unwrap();
        acc.add_chunk(&[1, 2, 3, 4]);
        acc.add_chunk(&[10, -20, 30, -40]);

        let snap = acc.snapshot(1);
        assert_eq!(snap.sums, vec![11, -18, 33, -36]);
        assert_eq!(snap.chunks, 2);
    }

    #[test]
    fn test_multiple_records_per_chunk() {
        let acc = Accumulator::new(3, 2).unwrap();
        acc.add_chunk(&[1, 2, 3, 10, 20, 30]);

        let snap = acc.snapshot(1);
        assert_eq!(snap.sums, vec![11, 22, 33]);
        assert_eq!(snap.records(), 2);
        assert_eq!(snap.mean(), vec![5.5, 11.0, 16.5]);
    }

    #[test]
    fn test_widening_does_not_wrap() {
        let acc = Accumulator::new(1, 1).unwrap();
        for _ in 0..1000 {
            acc.add_chunk(&[i16::MAX]);
        }
        assert_eq!(acc.snapshot(1).sums, vec![i64::from(i16::MAX) * 1000]);
    }

    #[test]
    fn test_clear_resets() {
        let acc = Accumulator::new(2, 1).unwrap();
        acc.add_chunk(&[5, 6]);
        acc.clear();

        let snap = acc.snapshot(1);
        assert_eq!(snap.sums, vec![0, 0]);
        assert_eq!(snap.chunks, 0);
    }

    #[test]
    fn test_channel_striding() {
        let snap = AccumulatorSnapshot {
            sums: vec![1, 2, 3, 4, 5, 6],
            chunks: 1,
            records_per_chunk: 1,
            channels: 2,
        };
        assert_eq!(snap.channel(0), vec![1, 3, 5]);
        assert_eq!(snap.channel(1), vec![2, 4, 6]);
        assert!(snap.channel(2).is_empty());
    }
}
