//! Pipeline context: the single object owning all shared acquisition state.
//!
//! [`PipelineBuilder::start`] allocates the ring (append mode) or the
//! accumulator (accumulate mode), resets the slot id, spawns the drain thread
//! and hands back the [`TransferEngine`] to register with the driver. The
//! returned [`Pipeline`] stays with the host for status polling and stop.
//!
//! Stop the driver before stopping the pipeline; chunks delivered after the
//! drain is joined are no longer persisted.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::accumulator::{Accumulator, AccumulatorSnapshot};
use crate::buffers::{BufferPair, Sample, SlotId};
use crate::config::{PipelineConfig, TransferMode};
use crate::drain::{DrainStats, DrainThread, Drainer, StopOutcome};
use crate::error::{Result, TransferError};
use crate::hook::RestartHook;
use crate::ring::RingBuffer;
use crate::storage::{FileSink, StorageSink};
use crate::transfer::{EngineShared, TransferEngine, TransferStats, TransferTarget};

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    sink: Option<Box<dyn StorageSink>>,
    hook: Option<Box<dyn RestartHook>>,
}

impl PipelineBuilder {
    /// Start from a configuration.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            sink: None,
            hook: None,
        }
    }

    /// Use `sink` instead of opening `storage.path`.
    pub fn sink(mut self, sink: impl StorageSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Register the restart hook run after each transfer.
    pub fn restart_hook(mut self, hook: impl RestartHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Allocate the pipeline state and start the drain thread.
    ///
    /// Fails with [`TransferError::ConfigurationFault`] when the buffers do
    /// not match `buffer_size` or append mode has no storage destination.
    pub fn start<B: BufferPair>(self, buffers: B) -> Result<(Pipeline, TransferEngine<B>)> {
        let config = self.config;
        config.validate()?;

        let acq = &config.acquisition;
        if buffers.chunk_len() != acq.buffer_size {
            return Err(TransferError::configuration(format!(
                "driver buffers hold {} samples, configured buffer_size is {}",
                buffers.chunk_len(),
                acq.buffer_size
            )));
        }

        let shared = Arc::new(EngineShared::default());
        let (target, ring, accumulator, drain) = match acq.mode {
            TransferMode::Append => {
                let sink: Box<dyn StorageSink> = match (self.sink, &config.storage.path) {
                    (Some(sink), _) => sink,
                    (None, Some(path)) => Box::new(FileSink::create(path).map_err(|e| {
                        TransferError::configuration(format!(
                            "cannot open storage path {}: {e}",
                            path.display()
                        ))
                    })?),
                    (None, None) => {
                        return Err(TransferError::configuration(
                            "append mode requires a storage path or sink",
                        ))
                    }
                };
                let ring = Arc::new(RingBuffer::new(acq.buffer_size, acq.ring_chunks)?);
                let drainer = Drainer::new(
                    Arc::clone(&ring),
                    sink,
                    config.drain.max_consecutive_failures,
                );
                let drain =
                    DrainThread::spawn(drainer, config.poll_interval(), config.drain.flush_on_stop)?;
                (
                    TransferTarget::Append(Arc::clone(&ring)),
                    Some(ring),
                    None,
                    Some(drain),
                )
            }
            TransferMode::Accumulate => {
                if self.sink.is_some() {
                    debug!("Ignoring storage sink in accumulate mode");
                }
                let accumulator = Arc::new(Accumulator::new(config.record_len(), acq.records_per_chunk)?);
                (
                    TransferTarget::Accumulate(Arc::clone(&accumulator)),
                    None,
                    Some(accumulator),
                    None,
                )
            }
        };

        let engine = TransferEngine::new(
            buffers,
            target,
            Arc::clone(&shared),
            self.hook,
            acq.transfer_budget,
        );

        info!(
            mode = ?acq.mode,
            buffer_size = acq.buffer_size,
            ring_chunks = acq.ring_chunks,
            records_per_chunk = acq.records_per_chunk,
            "Started acquisition pipeline"
        );

        let pipeline = Pipeline {
            config,
            shared,
            ring,
            accumulator,
            drain,
            stopped: false,
        };
        Ok((pipeline, engine))
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("sink", &self.sink.as_ref().map(|sink| sink.describe()))
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

/// Host-side handle to a running measurement.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    shared: Arc<EngineShared>,
    ring: Option<Arc<RingBuffer>>,
    accumulator: Option<Arc<Accumulator>>,
    drain: Option<DrainThread>,
    stopped: bool,
}

impl Pipeline {
    /// Create a builder for `config`.
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// The configuration the pipeline was started with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Operating mode.
    pub fn mode(&self) -> TransferMode {
        self.config.acquisition.mode
    }

    /// Whether [`Pipeline::stop`] has not been called yet.
    pub fn is_running(&self) -> bool {
        !self.stopped
    }

    /// Snapshot of cursors, slot id and counters.
    pub fn status(&self) -> PipelineStatus {
        let raw = self.shared.raw_slot();
        PipelineStatus {
            mode: self.mode(),
            running: self.is_running(),
            slot_id: raw,
            slot_corrupted: SlotId::try_from(raw).is_err(),
            ring: self.ring.as_deref().map(RingStatus::from),
            transfer: self.shared.stats(),
            drain: self.drain.as_ref().map(|drain| drain.health().stats()),
            accumulated_chunks: self.accumulator.as_ref().map(|acc| acc.chunks()),
        }
    }

    /// Owned copy of the accumulator sums, in accumulate mode.
    pub fn accumulator_snapshot(&self) -> Option<AccumulatorSnapshot> {
        self.accumulator
            .as_ref()
            .map(|acc| acc.snapshot(self.config.acquisition.channels))
    }

    /// Zero the accumulator between measurement runs. No-op in append mode.
    ///
    /// Call only while the driver is idle.
    pub fn clear_accumulator(&self) {
        if let Some(acc) = &self.accumulator {
            acc.clear();
            debug!("Cleared accumulator");
        }
    }

    /// Copy of the ring sample store, in append mode.
    pub fn ring_snapshot(&self) -> Option<Vec<Sample>> {
        self.ring.as_ref().map(|ring| ring.snapshot())
    }

    /// Force the slot id the next transfer reads, e.g. after a corruption.
    pub fn resync_slot(&self, slot: SlotId) {
        self.shared.store_raw_slot(slot.into());
        info!(%slot, "Resynchronised buffer slot id");
    }

    /// Overwrite the raw slot id byte, as a host with direct access to the
    /// shared state would. Used to exercise corruption handling.
    #[doc(hidden)]
    pub fn set_raw_slot_id(&self, raw: u8) {
        self.shared.store_raw_slot(raw);
    }

    /// Report the most severe outstanding fault.
    ///
    /// Checked in order: corrupted slot id, faulted storage, lost samples.
    pub fn check_health(&self) -> Result<()> {
        let raw = self.shared.raw_slot();
        if SlotId::try_from(raw).is_err() {
            return Err(TransferError::CursorCorruption { raw });
        }

        if let Some(drain) = &self.drain {
            if drain.health().is_faulted() {
                let stats = drain.health().stats();
                return Err(TransferError::StorageWriteFailure {
                    requested: 0,
                    written: 0,
                    message: stats
                        .last_error
                        .unwrap_or_else(|| "storage faulted".to_string()),
                });
            }
        }

        let lost_samples = self.shared.stats().lost_samples;
        if lost_samples > 0 {
            return Err(TransferError::OverflowDataLoss { lost_samples });
        }
        Ok(())
    }

    /// Stop the drain thread and close storage.
    ///
    /// Safe to call repeatedly; later calls return
    /// [`StopOutcome::AlreadyStopped`].
    pub fn stop(&mut self) -> Result<StopOutcome> {
        if self.stopped {
            return Ok(StopOutcome::AlreadyStopped);
        }
        self.stopped = true;

        if let Some(drain) = self.drain.as_mut() {
            drain.stop()?;
        }

        let stats = self.shared.stats();
        info!(
            transfers = stats.transfers,
            lost_samples = stats.lost_samples,
            cursor_corruptions = stats.cursor_corruptions,
            "Stopped acquisition pipeline"
        );
        Ok(StopOutcome::Stopped)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.stopped {
            if let Err(e) = self.stop() {
                error!("Error stopping pipeline on drop: {}", e);
            }
        }
    }
}

/// Serializable pipeline snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Operating mode
    pub mode: TransferMode,
    /// Not yet stopped
    pub running: bool,
    /// Raw slot id the next transfer reads
    pub slot_id: u8,
    /// Slot id outside {0, 1}
    pub slot_corrupted: bool,
    /// Ring cursors (append mode)
    pub ring: Option<RingStatus>,
    /// Transfer engine counters
    pub transfer: TransferStats,
    /// Drain health (append mode)
    pub drain: Option<DrainStats>,
    /// Chunks summed (accumulate mode)
    pub accumulated_chunks: Option<u64>,
}

/// Ring cursor snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingStatus {
    /// Capacity in samples
    pub capacity: usize,
    /// `W`
    pub write_position: usize,
    /// `R`
    pub read_position: usize,
    /// Samples not yet drained
    pub pending: u64,
    /// Samples ever appended
    pub published_total: u64,
    /// Samples ever drained or skipped
    pub drained_total: u64,
}

impl From<&RingBuffer> for RingStatus {
    fn from(ring: &RingBuffer) -> Self {
        let published_total = ring.published_total();
        let drained_total = ring.drained_total();
        let capacity = ring.capacity();
        Self {
            capacity,
            write_position: (published_total % capacity as u64) as usize,
            read_position: (drained_total % capacity as u64) as usize,
            pending: published_total.saturating_sub(drained_total),
            published_total,
            drained_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::OwnedBufferPair;
    use crate::hook::HookFailure;
    use crate::storage::MemorySink;

    fn append_config() -> PipelineConfig {
        PipelineConfig::builder()
            .buffer_size(4)
            .ring_chunks(2)
            .poll_interval_ms(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_start_requires_storage_in_append_mode() {
        let err = PipelineBuilder::new(append_config())
            .start(OwnedBufferPair::new(4))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unopenable_storage_path_is_a_configuration_fault() {
        let temp_dir = tempfile::tempdir().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let path = blocker.join("samples.bin");

        let config = PipelineConfig::builder()
            .buffer_size(4)
            .ring_chunks(2)
            .storage_path(path.clone())
            .build()
            .unwrap();
        let err = PipelineBuilder::new(config)
            .start(OwnedBufferPair::new(4))
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(err.to_string().contains("not-a-dir"));
    }

    #[test]
    fn test_start_rejects_mismatched_buffers() {
        let err = PipelineBuilder::new(append_config())
            .sink(MemorySink::new())
            .start(OwnedBufferPair::new(8))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_status_reports_cursors() {
        let (mut pipeline, mut engine) = Pipeline::builder(append_config())
            .sink(MemorySink::new())
            .start(OwnedBufferPair::new(4))
            .unwrap();

        engine.on_chunk_complete().unwrap();
        let status = pipeline.status();
        assert_eq!(status.mode, TransferMode::Append);
        assert_eq!(status.slot_id, 1);
        assert_eq!(status.transfer.transfers, 1);
        assert_eq!(status.ring.unwrap().published_total, 4);
        assert!(status.accumulated_chunks.is_none());

        assert_eq!(pipeline.stop().unwrap(), StopOutcome::Stopped);
        assert_eq!(pipeline.stop().unwrap(), StopOutcome::AlreadyStopped);
        assert!(!pipeline.status().running);
    }

    #[test]
    fn test_corruption_and_resync() {
        let (pipeline, mut engine) = Pipeline::builder(append_config())
            .sink(MemorySink::new())
            .start(OwnedBufferPair::new(4))
            .unwrap();

        pipeline.set_raw_slot_id(2);
        assert!(engine.on_chunk_complete().is_err());
        assert!(matches!(
            pipeline.check_health(),
            Err(TransferError::CursorCorruption { raw: 2 })
        ));
        assert!(pipeline.status().slot_corrupted);

        pipeline.resync_slot(SlotId::First);
        assert!(pipeline.check_health().is_ok());
        assert_eq!(engine.on_chunk_complete().unwrap().slot, SlotId::First);
    }

    #[test]
    fn test_accumulate_mode_pipeline() {
        let config = PipelineConfig::builder()
            .buffer_size(4)
            .mode(TransferMode::Accumulate)
            .records_per_chunk(2)
            .build()
            .unwrap();
        let (mut pipeline, mut engine) = Pipeline::builder(config)
            .restart_hook(|| Ok::<(), HookFailure>(()))
            .start(OwnedBufferPair::new(4))
            .unwrap();

        engine.buffers_mut().fill(SlotId::First, &[1, 2, 3, 4]).unwrap();
        engine.on_chunk_complete().unwrap();

        let snapshot = pipeline.accumulator_snapshot().unwrap();
        assert_eq!(snapshot.sums, vec![4, 6]);
        assert_eq!(pipeline.status().accumulated_chunks, Some(1));
        assert!(pipeline.ring_snapshot().is_none());

        pipeline.clear_accumulator();
        assert_eq!(pipeline.accumulator_snapshot().unwrap().sums, vec![0, 0]);
        assert_eq!(pipeline.stop().unwrap(), StopOutcome::Stopped);
    }
}
