//! Transfer engine: the driver's per-chunk completion callback.
//!
//! The engine runs synchronously on the driver's callback thread, once per
//! completed chunk, and must finish before the driver starts refilling the
//! buffer it just delivered. Each invocation:
//!
//! 1. Reads the current buffer slot id. Anything other than 0 or 1 is a
//!    [`TransferError::CursorCorruption`]: no transfer, no flip, no hook.
//!    A chunk whose length differs from the configured chunk size is a
//!    [`TransferError::ChunkLengthMismatch`] handled the same way.
//! 2. Appends the chunk to the ring (append mode) or sums it into the
//!    accumulator (accumulate mode).
//! 3. Flips the slot id.
//! 4. Runs the restart hook, if one is registered.
//!
//! The hot path takes no locks, performs no I/O and does not allocate. Faults
//! are recorded in [`EngineShared`] counters that the host polls through the
//! pipeline status; nothing is thrown across the driver boundary.

use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::trace;

use crate::accumulator::Accumulator;
use crate::buffers::{BufferPair, SlotId};
use crate::config::TransferMode;
use crate::error::{Result, TransferError};
use crate::hook::{HookFailure, RestartHook};
use crate::ring::RingBuffer;

/// No corruption or hook status recorded yet.
const NONE_RECORDED: i32 = i32::MIN;

/// State shared between the engine and the host.
#[derive(Debug)]
pub struct EngineShared {
    slot: AtomicU8,
    invocations: AtomicU64,
    transfers: AtomicU64,
    cursor_corruptions: AtomicU64,
    last_corrupt_raw: AtomicI32,
    chunk_length_faults: AtomicU64,
    overflow_events: AtomicU64,
    lost_samples: AtomicU64,
    hook_failures: AtomicU64,
    last_hook_code: AtomicI32,
    last_transfer_ns: AtomicU64,
    max_transfer_ns: AtomicU64,
    late_transfers: AtomicU64,
}

impl Default for EngineShared {
    fn default() -> Self {
        Self {
            slot: AtomicU8::new(SlotId::First.into()),
            invocations: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            cursor_corruptions: AtomicU64::new(0),
            last_corrupt_raw: AtomicI32::new(NONE_RECORDED),
            chunk_length_faults: AtomicU64::new(0),
            overflow_events: AtomicU64::new(0),
            lost_samples: AtomicU64::new(0),
            hook_failures: AtomicU64::new(0),
            last_hook_code: AtomicI32::new(NONE_RECORDED),
            last_transfer_ns: AtomicU64::new(0),
            max_transfer_ns: AtomicU64::new(0),
            late_transfers: AtomicU64::new(0),
        }
    }
}

impl EngineShared {
    /// Raw slot id as stored, possibly corrupted.
    pub fn raw_slot(&self) -> u8 {
        self.slot.load(Ordering::Acquire)
    }

    pub(crate) fn store_raw_slot(&self, raw: u8) {
        self.slot.store(raw, Ordering::Release);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TransferStats {
        let optional = |value: i32| (value != NONE_RECORDED).then_some(value);
        TransferStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            cursor_corruptions: self.cursor_corruptions.load(Ordering::Relaxed),
            last_corrupt_slot: optional(self.last_corrupt_raw.load(Ordering::Relaxed))
                .and_then(|raw| u8::try_from(raw).ok()),
            chunk_length_faults: self.chunk_length_faults.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            lost_samples: self.lost_samples.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            last_hook_code: optional(self.last_hook_code.load(Ordering::Relaxed)),
            last_transfer: Duration::from_nanos(self.last_transfer_ns.load(Ordering::Relaxed)),
            max_transfer: Duration::from_nanos(self.max_transfer_ns.load(Ordering::Relaxed)),
            late_transfers: self.late_transfers.load(Ordering::Relaxed),
        }
    }

    fn record_timing(&self, elapsed: Duration, budget: Option<Duration>) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.last_transfer_ns.store(nanos, Ordering::Relaxed);
        self.max_transfer_ns.fetch_max(nanos, Ordering::Relaxed);
        if budget.is_some_and(|budget| elapsed > budget) {
            self.late_transfers.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Transfer engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    /// Callback invocations, including faulted ones
    pub invocations: u64,
    /// Completed transfers
    pub transfers: u64,
    /// Invocations that found a corrupted slot id
    pub cursor_corruptions: u64,
    /// Raw slot id of the most recent corruption
    pub last_corrupt_slot: Option<u8>,
    /// Invocations whose chunk had the wrong length
    pub chunk_length_faults: u64,
    /// Transfers that overwrote unflushed ring data
    pub overflow_events: u64,
    /// Unflushed samples overwritten
    pub lost_samples: u64,
    /// Failed restart hook calls
    pub hook_failures: u64,
    /// Status of the most recent hook failure
    pub last_hook_code: Option<i32>,
    /// Duration of the most recent invocation
    pub last_transfer: Duration,
    /// Longest invocation so far
    pub max_transfer: Duration,
    /// Invocations exceeding the configured transfer budget
    pub late_transfers: u64,
}

/// Where transferred chunks go.
#[derive(Debug, Clone)]
pub enum TransferTarget {
    /// Append into the ring buffer
    Append(Arc<RingBuffer>),
    /// Sum into the accumulator
    Accumulate(Arc<Accumulator>),
}

impl TransferTarget {
    /// Operating mode of this target.
    pub fn mode(&self) -> TransferMode {
        match self {
            Self::Append(_) => TransferMode::Append,
            Self::Accumulate(_) => TransferMode::Accumulate,
        }
    }

    /// Samples every delivered chunk must hold.
    pub fn chunk_len(&self) -> usize {
        match self {
            Self::Append(ring) => ring.chunk_len(),
            Self::Accumulate(acc) => acc.record_len() * acc.records_per_chunk(),
        }
    }
}

/// Outcome of one successful transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    /// Slot the chunk was read from
    pub slot: SlotId,
    /// Unflushed ring samples overwritten by this transfer
    pub overwritten: u64,
    /// Restart hook failure, if the hook ran and failed
    pub hook_failure: Option<HookFailure>,
    /// Time spent in the invocation
    pub elapsed: Duration,
}

impl TransferReport {
    /// The overflow this transfer caused, as an error value.
    pub fn overflow(&self) -> Option<TransferError> {
        (self.overwritten > 0).then_some(TransferError::OverflowDataLoss {
            lost_samples: self.overwritten,
        })
    }
}

/// Per-chunk completion callback logic.
pub struct TransferEngine<B: BufferPair> {
    buffers: B,
    target: TransferTarget,
    shared: Arc<EngineShared>,
    hook: Option<Box<dyn RestartHook>>,
    budget: Option<Duration>,
}

impl<B: BufferPair> TransferEngine<B> {
    pub(crate) fn new(
        buffers: B,
        target: TransferTarget,
        shared: Arc<EngineShared>,
        hook: Option<Box<dyn RestartHook>>,
        budget: Option<Duration>,
    ) -> Self {
        Self {
            buffers,
            target,
            shared,
            hook,
            budget,
        }
    }

    /// Handle one completed chunk.
    pub fn on_chunk_complete(&mut self) -> Result<TransferReport> {
        let started = Instant::now();
        self.shared.invocations.fetch_add(1, Ordering::Relaxed);

        let raw = self.shared.raw_slot();
        let slot = match SlotId::try_from(raw) {
            Ok(slot) => slot,
            Err(raw) => {
                self.shared.cursor_corruptions.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .last_corrupt_raw
                    .store(i32::from(raw), Ordering::Relaxed);
                self.shared.record_timing(started.elapsed(), self.budget);
                return Err(TransferError::CursorCorruption { raw });
            }
        };

        let chunk = self.buffers.chunk(slot);
        let expected = self.target.chunk_len();
        if chunk.len() != expected {
            self.shared
                .chunk_length_faults
                .fetch_add(1, Ordering::Relaxed);
            self.shared.record_timing(started.elapsed(), self.budget);
            return Err(TransferError::ChunkLengthMismatch {
                expected,
                actual: chunk.len(),
            });
        }

        let overwritten = match &self.target {
            TransferTarget::Append(ring) => ring.push_chunk(chunk)?,
            TransferTarget::Accumulate(accumulator) => {
                accumulator.add_chunk(chunk);
                0
            }
        };
        if overwritten > 0 {
            self.shared.overflow_events.fetch_add(1, Ordering::Relaxed);
            self.shared
                .lost_samples
                .fetch_add(overwritten, Ordering::Relaxed);
        }

        self.shared.store_raw_slot(slot.flip().into());
        self.shared.transfers.fetch_add(1, Ordering::Relaxed);

        let hook_failure = match self.hook.as_mut().map(|hook| hook.restart()) {
            Some(Err(failure)) => {
                self.shared.hook_failures.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .last_hook_code
                    .store(failure.code, Ordering::Relaxed);
                Some(failure)
            }
            _ => None,
        };

        let elapsed = started.elapsed();
        self.shared.record_timing(elapsed, self.budget);
        trace!(
            %slot,
            overwritten,
            elapsed_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            "Transferred chunk"
        );

        Ok(TransferReport {
            slot,
            overwritten,
            hook_failure,
            elapsed,
        })
    }

    /// Slot id the next invocation will read, or the raw value if corrupted.
    pub fn slot(&self) -> std::result::Result<SlotId, u8> {
        SlotId::try_from(self.shared.raw_slot())
    }

    /// Operating mode.
    pub fn mode(&self) -> TransferMode {
        self.target.mode()
    }

    /// The buffer pair the engine reads from.
    pub fn buffers(&self) -> &B {
        &self.buffers
    }

    /// Mutable access to the buffer pair, for drivers that fill host-owned
    /// buffers.
    pub fn buffers_mut(&mut self) -> &mut B {
        &mut self.buffers
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TransferStats {
        self.shared.stats()
    }
}

impl<B: BufferPair + 'static> TransferEngine<B> {
    /// Convert into a niladic callback for registration with the driver.
    ///
    /// Errors are already recorded in the shared counters, so the callback
    /// discards them.
    pub fn into_callback(mut self) -> impl FnMut() + Send + 'static {
        move || {
            if let Err(err) = self.on_chunk_complete() {
                trace!(error = %err, "Transfer fault recorded");
            }
        }
    }
}

impl<B: BufferPair> std::fmt::Debug for TransferEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("mode", &self.mode())
            .field("slot", &self.shared.raw_slot())
            .field("chunk_len", &self.buffers.chunk_len())
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::{OwnedBufferPair, Sample};
    use std::sync::atomic::AtomicUsize;

    fn append_engine(chunk_len: usize, chunks: usize) -> (TransferEngine<OwnedBufferPair>, Arc<RingBuffer>) {
        let ring = Arc::new(RingBuffer::new(chunk_len, chunks).unwrap());
        let engine = TransferEngine::new(
            OwnedBufferPair::new(chunk_len),
            TransferTarget::Append(Arc::clone(&ring)),
            Arc::new(EngineShared::default()),
            None,
            None,
        );
        (engine, ring)
    }

    #[test]
    fn test_append_reads_current_slot_and_flips() {
        let (mut engine, ring) = append_engine(4, 2);
        engine.buffers_mut().fill(SlotId::First, &[1, 2, 3, 4]).unwrap();
        engine.buffers_mut().fill(SlotId::Second, &[5, 6, 7, 8]).unwrap();

        let report = engine.on_chunk_complete().unwrap();
        assert_eq!(report.slot, SlotId::First);
        assert_eq!(engine.slot(), Ok(SlotId::Second));
        assert_eq!(ring.write_position(), 4);

        let report = engine.on_chunk_complete().unwrap();
        assert_eq!(report.slot, SlotId::Second);
        assert_eq!(engine.slot(), Ok(SlotId::First));
        assert_eq!(ring.write_position(), 0);
        assert_eq!(ring.snapshot(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_corrupted_slot_is_a_fault() {
        let (mut engine, ring) = append_engine(4, 2);
        engine.shared.store_raw_slot(3);

        let err = engine.on_chunk_complete().unwrap_err();
        assert!(matches!(err, TransferError::CursorCorruption { raw: 3 }));
        assert_eq!(ring.write_position(), 0);
        assert_eq!(engine.slot(), Err(3));

        let stats = engine.stats();
        assert_eq!(stats.invocations, 1);
        assert_eq!(stats.transfers, 0);
        assert_eq!(stats.cursor_corruptions, 1);
        assert_eq!(stats.last_corrupt_slot, Some(3));
    }

    /// Driver buffers whose first chunk comes back one sample short.
    struct ShortOnceBuffers {
        data: [Sample; 4],
        calls: usize,
    }

    impl BufferPair for ShortOnceBuffers {
        fn chunk_len(&self) -> usize {
            4
        }

        fn chunk(&self, _slot: SlotId) -> &[Sample] {
            if self.calls == 0 {
                &self.data[..3]
            } else {
                &self.data
            }
        }
    }

    #[test]
    fn test_wrong_chunk_length_is_a_fault() {
        let ring = Arc::new(RingBuffer::new(4, 2).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        let mut engine = TransferEngine::new(
            ShortOnceBuffers {
                data: [1, 2, 3, 4],
                calls: 0,
            },
            TransferTarget::Append(Arc::clone(&ring)),
            Arc::new(EngineShared::default()),
            Some(Box::new(move || {
                hook_calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HookFailure>(())
            })),
            None,
        );

        let err = engine.on_chunk_complete().unwrap_err();
        assert!(matches!(
            err,
            TransferError::ChunkLengthMismatch { expected: 4, actual: 3 }
        ));
        assert_eq!(ring.published_total(), 0);
        assert_eq!(engine.slot(), Ok(SlotId::First));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.stats().chunk_length_faults, 1);
        assert_eq!(engine.stats().transfers, 0);

        // Full-length chunks keep W on chunk boundaries.
        engine.buffers_mut().calls = 1;
        for _ in 0..3 {
            engine.on_chunk_complete().unwrap();
            assert_eq!(ring.write_position() % 4, 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_hook_runs_after_flip() {
        let ring = Arc::new(RingBuffer::new(2, 4).unwrap());
        let shared = Arc::new(EngineShared::default());
        let observed = Arc::new(AtomicUsize::new(usize::MAX));

        let hook_shared = Arc::clone(&shared);
        let hook_ring = Arc::clone(&ring);
        let hook_observed = Arc::clone(&observed);
        let hook = move || {
            // Slot already flipped and W already advanced.
            assert_eq!(hook_shared.raw_slot(), 1);
            hook_observed.store(hook_ring.write_position(), Ordering::SeqCst);
            Ok::<(), HookFailure>(())
        };

        let mut engine = TransferEngine::new(
            OwnedBufferPair::new(2),
            TransferTarget::Append(ring),
            shared,
            Some(Box::new(hook)),
            None,
        );
        engine.on_chunk_complete().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hook_failure_is_recorded_not_fatal() {
        let ring = Arc::new(RingBuffer::new(2, 4).unwrap());
        let mut engine = TransferEngine::new(
            OwnedBufferPair::new(2),
            TransferTarget::Append(Arc::clone(&ring)),
            Arc::new(EngineShared::default()),
            Some(Box::new(|| Err::<(), _>(HookFailure { code: 7 }))),
            None,
        );

        let report = engine.on_chunk_complete().unwrap();
        assert_eq!(report.hook_failure, Some(HookFailure { code: 7 }));
        assert_eq!(ring.write_position(), 2);

        let stats = engine.stats();
        assert_eq!(stats.hook_failures, 1);
        assert_eq!(stats.last_hook_code, Some(7));
        assert_eq!(stats.transfers, 1);
    }

    #[test]
    fn test_accumulate_mode_sums_and_flips() {
        let accumulator = Arc::new(Accumulator::new(3, 1).unwrap());
        let mut engine = TransferEngine::new(
            OwnedBufferPair::new(3),
            TransferTarget::Accumulate(Arc::clone(&accumulator)),
            Arc::new(EngineShared::default()),
            None,
            None,
        );
        engine.buffers_mut().fill(SlotId::First, &[1, 2, 3]).unwrap();
        engine.buffers_mut().fill(SlotId::Second, &[4, 5, 6]).unwrap();

        engine.on_chunk_complete().unwrap();
        engine.on_chunk_complete().unwrap();
        engine.on_chunk_complete().unwrap();

        assert_eq!(accumulator.snapshot(1).sums, vec![6, 9, 12]);
        assert_eq!(engine.slot(), Ok(SlotId::Second));
        assert_eq!(engine.mode(), TransferMode::Accumulate);
    }

    #[test]
    fn test_overflow_counted() {
        let (mut engine, _ring) = append_engine(4, 2);
        for _ in 0..2 {
            assert!(engine.on_chunk_complete().unwrap().overflow().is_none());
        }
        let report = engine.on_chunk_complete().unwrap();
        assert!(matches!(
            report.overflow(),
            Some(TransferError::OverflowDataLoss { lost_samples: 4 })
        ));

        let stats = engine.stats();
        assert_eq!(stats.overflow_events, 1);
        assert_eq!(stats.lost_samples, 4);
    }

    #[test]
    fn test_budget_marks_late_transfers() {
        let ring = Arc::new(RingBuffer::new(2, 4).unwrap());
        let mut engine = TransferEngine::new(
            OwnedBufferPair::new(2),
            TransferTarget::Append(ring),
            Arc::new(EngineShared::default()),
            Some(Box::new(|| {
                std::thread::sleep(Duration::from_millis(2));
                Ok::<(), HookFailure>(())
            })),
            Some(Duration::from_micros(1)),
        );
        engine.on_chunk_complete().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.late_transfers, 1);
        assert!(stats.max_transfer >= Duration::from_millis(2));
    }

    #[test]
    fn test_callback_records_faults() {
        let (engine, _ring) = append_engine(4, 2);
        let shared = Arc::clone(&engine.shared);
        shared.store_raw_slot(9);

        let mut callback = engine.into_callback();
        callback();
        callback();

        assert_eq!(shared.stats().cursor_corruptions, 2);
    }
}
