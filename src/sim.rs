//! Simulated acquisition driver.
//!
//! Stands in for the vendor driver: it owns the two buffers, fills them
//! alternately and invokes the transfer engine once per completed chunk. Used
//! by the `simulate` command, the benchmarks and the integration tests.

use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, warn};

use crate::buffers::{BufferPair, OwnedBufferPair, Sample, SlotId};
use crate::error::Result;
use crate::transfer::{TransferEngine, TransferReport};

/// Produces sample chunks for the simulated driver.
pub trait SampleSource {
    /// Fill `chunk` with the next samples.
    fn fill(&mut self, chunk: &mut [Sample]);
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn fill(&mut self, chunk: &mut [Sample]) {
        (**self).fill(chunk);
    }
}

/// Deterministic ramp: consecutive samples count up, wrapping at `i16::MAX`.
#[derive(Debug, Clone, Default)]
pub struct RampSource {
    next: Sample,
}

impl RampSource {
    /// Ramp starting at `start`.
    pub fn starting_at(start: Sample) -> Self {
        Self { next: start }
    }
}

impl SampleSource for RampSource {
    fn fill(&mut self, chunk: &mut [Sample]) {
        for sample in chunk {
            *sample = self.next;
            self.next = self.next.wrapping_add(1);
        }
    }
}

/// Uniform noise in `[-amplitude, amplitude]`.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    rng: StdRng,
    amplitude: Sample,
}

impl NoiseSource {
    /// Seeded noise source, reproducible across runs.
    pub fn seeded(seed: u64, amplitude: Sample) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            amplitude: amplitude.saturating_abs(),
        }
    }
}

impl SampleSource for NoiseSource {
    fn fill(&mut self, chunk: &mut [Sample]) {
        let amplitude = self.amplitude;
        for sample in chunk {
            *sample = self.rng.gen_range(-amplitude..=amplitude);
        }
    }
}

/// Outcome of [`SimulatedDriver::run_paced`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimulationSummary {
    /// Chunks delivered
    pub chunks: u64,
    /// Deliveries the engine rejected
    pub faults: u64,
    /// Deliveries that overwrote unflushed ring data
    pub overflows: u64,
    /// Wall time of the run
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Driver double: fills its buffers alternately and calls the engine.
///
/// The driver keeps its own fill slot, independent of the engine's slot id,
/// as real hardware does.
#[derive(Debug)]
pub struct SimulatedDriver {
    engine: TransferEngine<OwnedBufferPair>,
    fill_slot: SlotId,
    delivered: u64,
}

impl SimulatedDriver {
    /// Drive `engine`, starting with the first slot.
    pub fn new(engine: TransferEngine<OwnedBufferPair>) -> Self {
        Self {
            engine,
            fill_slot: SlotId::First,
            delivered: 0,
        }
    }

    /// Chunk length of the driver buffers.
    pub fn chunk_len(&self) -> usize {
        self.engine.buffers().chunk_len()
    }

    /// Chunks delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// The engine being driven.
    pub fn engine(&self) -> &TransferEngine<OwnedBufferPair> {
        &self.engine
    }

    /// Deliver one chunk of exactly `chunk_len` samples.
    pub fn deliver(&mut self, samples: &[Sample]) -> Result<TransferReport> {
        self.engine.buffers_mut().fill(self.fill_slot, samples)?;
        self.complete()
    }

    /// Deliver one chunk produced by `source`.
    pub fn deliver_from(&mut self, source: &mut impl SampleSource) -> Result<TransferReport> {
        source.fill(self.engine.buffers_mut().slot_mut(self.fill_slot));
        self.complete()
    }

    /// Deliver `chunks` chunks from `source`, one every `period`.
    ///
    /// Engine faults are counted and the run continues, as a driver without an
    /// error channel would.
    pub fn run_paced(
        &mut self,
        source: &mut impl SampleSource,
        chunks: u64,
        period: Duration,
    ) -> SimulationSummary {
        let started = Instant::now();
        let mut faults = 0;
        let mut overflows = 0;

        for n in 0..chunks {
            match self.deliver_from(source) {
                Ok(report) if report.overwritten > 0 => overflows += 1,
                Ok(_) => {}
                Err(e) => {
                    faults += 1;
                    warn!(chunk = n, error = %e, "Simulated delivery rejected");
                }
            }

            let deadline = started + period.saturating_mul(u32::try_from(n + 1).unwrap_or(u32::MAX));
            if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }

        let summary = SimulationSummary {
            chunks,
            faults,
            overflows,
            elapsed: started.elapsed(),
        };
        debug!(?summary, "Simulation finished");
        summary
    }

    fn complete(&mut self) -> Result<TransferReport> {
        self.fill_slot = self.fill_slot.flip();
        self.delivered += 1;
        self.engine.on_chunk_complete()
    }
}
