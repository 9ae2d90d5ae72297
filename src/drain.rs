//! Drain thread: persists ring buffer contents to storage.
//!
//! The drain polls the ring every `T` milliseconds. Each tick it compares the
//! cursors and, when samples are pending, appends the contiguous run starting
//! at `R` (up to the end of the ring) to the storage sink in a single call,
//! then advances `R` by what the sink accepted.
//!
//! ```text
//!   ┌──────────────┐  published_total   ┌──────────────┐  append   ┌─────────┐
//!   │ TransferEngine├──────────────────►│  RingBuffer  ├──────────►│  Sink   │
//!   └──────────────┘   (Release)        └──────┬───────┘  Drainer  └─────────┘
//!                                              │ drained_total
//!                                              ▼ (written only here)
//! ```
//!
//! The engine never waits for the drain. If the engine laps the drain, the
//! overwritten samples are skipped here; they were already counted as lost by
//! the engine.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::buffers::Sample;
use crate::error::{Result, TransferError};
use crate::ring::RingBuffer;
use crate::storage::StorageSink;

/// Name of the spawned drain thread.
pub const DRAIN_THREAD_NAME: &str = "daq-drain";

/// Upper bound on drain passes after the stop flag is observed. A pending
/// region crosses the end of the ring at most once, so two passes suffice
/// unless the engine is still delivering.
const FINAL_PASSES: usize = 3;

/// Result of stopping the drain thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The thread was joined and the sink closed by this call
    Stopped,
    /// A previous call already stopped the thread
    AlreadyStopped,
}

/// Drain health counters shared with the host.
#[derive(Debug, Default)]
pub struct DrainHealth {
    ticks: AtomicU64,
    writes: AtomicU64,
    samples_written: AtomicU64,
    skipped_samples: AtomicU64,
    write_failures: AtomicU64,
    consecutive_failures: AtomicU32,
    faulted: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl DrainHealth {
    /// Whether consecutive storage failures reached the configured threshold.
    ///
    /// Sticky until the pipeline stops.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DrainStats {
        DrainStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            skipped_samples: self.skipped_samples.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            faulted: self.is_faulted(),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn record_write(&self, samples: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.samples_written
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Returns true when this failure escalated the drain to faulted.
    fn record_failure(&self, err: &TransferError, threshold: u32) -> bool {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(err.to_string());
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        consecutive >= threshold && !self.faulted.swap(true, Ordering::AcqRel)
    }
}

/// Snapshot of [`DrainHealth`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    /// Drain passes run
    pub ticks: u64,
    /// Append calls that stored at least one sample
    pub writes: u64,
    /// Samples handed to storage
    pub samples_written: u64,
    /// Overwritten samples the drain stepped over
    pub skipped_samples: u64,
    /// Failed or short appends
    pub write_failures: u64,
    /// Failures since the last complete append
    pub consecutive_failures: u32,
    /// Escalation flag
    pub faulted: bool,
    /// Message of the most recent failure
    pub last_error: Option<String>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Samples appended to storage
    pub written: usize,
    /// Overwritten samples stepped over
    pub skipped: u64,
    /// `R` after the pass
    pub read_position: usize,
}

/// Single-reader side of the ring: owns the storage sink.
pub struct Drainer {
    ring: Arc<RingBuffer>,
    sink: Box<dyn StorageSink>,
    scratch: Vec<Sample>,
    health: Arc<DrainHealth>,
    max_consecutive_failures: u32,
}

impl Drainer {
    /// Create the reader for `ring`. There must be exactly one per ring.
    pub fn new(
        ring: Arc<RingBuffer>,
        sink: Box<dyn StorageSink>,
        max_consecutive_failures: u32,
    ) -> Self {
        let scratch = vec![0; ring.capacity()];
        Self {
            ring,
            sink,
            scratch,
            health: Arc::new(DrainHealth::default()),
            max_consecutive_failures: max_consecutive_failures.max(1),
        }
    }

    /// Shared health counters.
    pub fn health(&self) -> Arc<DrainHealth> {
        Arc::clone(&self.health)
    }

    /// Run one drain tick.
    ///
    /// Appends at most one contiguous run. Storage errors are recorded in the
    /// health counters before being returned; the drain stays usable and the
    /// next tick retries from the unchanged `R`.
    pub fn drain_once(&mut self) -> Result<DrainReport> {
        self.health.ticks.fetch_add(1, Ordering::Relaxed);

        let capacity = self.ring.capacity() as u64;
        let published = self.ring.published_total();
        let mut drained = self.ring.drained_total();
        let mut skipped = 0;

        if published - drained > capacity {
            skipped = published - capacity - drained;
            drained += skipped;
            self.ring.set_drained_total(drained);
            warn!(
                skipped,
                read_position = self.ring.read_position(),
                "Ring overflow: unflushed samples were overwritten"
            );
        }

        let pending = published - drained;
        if pending == 0 {
            self.note_skipped(skipped);
            return Ok(self.report(0, skipped));
        }

        let offset = drained % capacity;
        let run = pending.min(capacity - offset) as usize;
        let torn = self.ring.read_run(drained, &mut self.scratch[..run]);
        if torn > 0 {
            skipped += torn as u64;
            drained += torn as u64;
            self.ring.set_drained_total(drained);
            warn!(torn, "Discarded samples overwritten during the drain copy");
        }
        self.note_skipped(skipped);

        let intact = &self.scratch[torn..run];
        if intact.is_empty() {
            return Ok(self.report(0, skipped));
        }

        let requested = intact.len();
        let failure = match self.sink.append(intact) {
            Ok(written) => {
                let written = written.min(requested);
                if written > 0 {
                    self.ring.set_drained_total(drained + written as u64);
                    self.health.record_write(written);
                }
                if written == requested {
                    self.health.record_success();
                    debug!(
                        written,
                        read_position = self.ring.read_position(),
                        "Drained samples to storage"
                    );
                    return Ok(self.report(written, skipped));
                }
                let message = self
                    .sink
                    .take_error()
                    .map_or_else(|| "short write".to_string(), |e| e.to_string());
                TransferError::StorageWriteFailure {
                    requested,
                    written,
                    message,
                }
            }
            Err(e) => TransferError::StorageWriteFailure {
                requested,
                written: 0,
                message: e.to_string(),
            },
        };

        warn!(error = %failure, sink = %self.sink.describe(), "Storage write failed");
        if self
            .health
            .record_failure(&failure, self.max_consecutive_failures)
        {
            error!(
                failures = self.max_consecutive_failures,
                sink = %self.sink.describe(),
                "Storage faulted after consecutive write failures"
            );
        }
        Err(failure)
    }

    /// Close the storage sink, consuming the drainer.
    pub fn close(mut self) -> Result<()> {
        self.sink.close()?;
        debug!(sink = %self.sink.describe(), "Closed storage sink");
        Ok(())
    }

    fn note_skipped(&self, skipped: u64) {
        if skipped > 0 {
            self.health
                .skipped_samples
                .fetch_add(skipped, Ordering::Relaxed);
        }
    }

    fn report(&self, written: usize, skipped: u64) -> DrainReport {
        DrainReport {
            written,
            skipped,
            read_position: self.ring.read_position(),
        }
    }
}

impl std::fmt::Debug for Drainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drainer")
            .field("ring", &self.ring)
            .field("sink", &self.sink.describe())
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .finish()
    }
}

/// Handle to the running drain thread.
#[derive(Debug)]
pub struct DrainThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Drainer>>,
    health: Arc<DrainHealth>,
}

impl DrainThread {
    /// Spawn the drain loop.
    ///
    /// With `flush_on_stop` the thread keeps draining after the stop flag is
    /// observed until nothing is pending, so data transferred before stop
    /// reaches storage.
    pub fn spawn(mut drainer: Drainer, poll_interval: Duration, flush_on_stop: bool) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let health = drainer.health();
        let capacity = drainer.ring.capacity();

        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(DRAIN_THREAD_NAME.to_string())
            .spawn(move || {
                let mut next_tick = Instant::now() + poll_interval;
                while !thread_stop.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < next_tick {
                        thread::park_timeout(next_tick - now);
                        continue;
                    }
                    next_tick = now + poll_interval;
                    // Failures are recorded in the health counters; retry next tick.
                    let _ = drainer.drain_once();
                }

                if flush_on_stop {
                    for _ in 0..FINAL_PASSES {
                        if drainer.ring.pending() == 0 || drainer.drain_once().is_err() {
                            break;
                        }
                    }
                }

                debug!(pending = drainer.ring.pending(), "Drain thread exiting");
                drainer
            })
            .map_err(|e| TransferError::lifecycle(format!("failed to spawn drain thread: {e}")))?;

        info!(
            capacity,
            poll_ms = u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Started drain thread"
        );

        Ok(Self {
            stop,
            handle: Some(handle),
            health,
        })
    }

    /// Whether the thread has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Shared health counters.
    pub fn health(&self) -> &Arc<DrainHealth> {
        &self.health
    }

    /// Signal stop, join the thread and close the sink.
    ///
    /// The in-progress write completes before the thread exits. Calling this
    /// again returns [`StopOutcome::AlreadyStopped`].
    pub fn stop(&mut self) -> Result<StopOutcome> {
        let Some(handle) = self.handle.take() else {
            return Ok(StopOutcome::AlreadyStopped);
        };

        self.stop.store(true, Ordering::Release);
        handle.thread().unpark();

        let drainer = handle
            .join()
            .map_err(|_| TransferError::lifecycle("drain thread panicked"))?;
        drainer.close()?;

        let stats = self.health.stats();
        info!(
            samples_written = stats.samples_written,
            skipped = stats.skipped_samples,
            write_failures = stats.write_failures,
            "Stopped drain thread"
        );
        Ok(StopOutcome::Stopped)
    }
}

impl Drop for DrainThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.stop() {
                error!("Error stopping drain thread on drop: {}", e);
            }
        }
    }
}
