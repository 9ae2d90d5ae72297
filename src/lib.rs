//! # DAQ Transfer Library
//!
//! The data path of a continuous analog-input acquisition: a driver fills two
//! alternating hardware buffers and calls back once per completed chunk; the
//! transfer engine either appends the chunk to a large ring buffer, which a
//! background thread drains to storage, or sums it into an accumulator.
//!
//! ```text
//!   driver ─► BufferPair ─► TransferEngine ─┬─► RingBuffer ─► drain thread ─► StorageSink
//!                                           └─► Accumulator
//! ```
//!
//! ## Crate Structure
//!
//! - **`buffers`**: the hardware buffer pair and the binary slot id.
//! - **`ring`**: the pre-allocated circular sample store and its cursors.
//! - **`transfer`**: the per-chunk callback logic and its fault counters.
//! - **`accumulator`**: element-wise sums for accumulate mode.
//! - **`drain`**: the polling thread that persists ring data.
//! - **`storage`**: append-only sample sinks (file, memory).
//! - **`hook`**: the restart hook run after each transfer.
//! - **`pipeline`**: the context object tying the above together.
//! - **`config`**: Figment-based configuration.
//! - **`telemetry`**: tracing subscriber setup.
//! - **`sim`**: a simulated driver for testing and benchmarking.
//!
//! ## Example
//!
//! ```no_run
//! use daq_transfer::{OwnedBufferPair, Pipeline, PipelineConfig, SimulatedDriver, RampSource};
//!
//! # fn main() -> daq_transfer::Result<()> {
//! let config = PipelineConfig::builder()
//!     .buffer_size(1024)
//!     .ring_chunks(16)
//!     .storage_path("samples.bin")
//!     .build()?;
//!
//! let (mut pipeline, engine) = Pipeline::builder(config).start(OwnedBufferPair::new(1024))?;
//! let mut driver = SimulatedDriver::new(engine);
//! let mut source = RampSource::default();
//! for _ in 0..100 {
//!     driver.deliver_from(&mut source)?;
//! }
//! pipeline.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod buffers;
pub mod config;
pub mod drain;
pub mod error;
pub mod hook;
pub mod pipeline;
pub mod ring;
pub mod sim;
pub mod storage;
pub mod telemetry;
pub mod transfer;

pub use accumulator::{Accumulator, AccumulatorSnapshot};
pub use buffers::{BufferPair, DriverBufferPair, OwnedBufferPair, Sample, SlotId};
pub use config::{PipelineConfig, TransferMode};
pub use drain::{DrainStats, StopOutcome};
pub use error::{Result, TransferError};
pub use hook::{HookFailure, RestartHook, StatusHook};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStatus, RingStatus};
pub use ring::RingBuffer;
pub use sim::{NoiseSource, RampSource, SampleSource, SimulatedDriver};
pub use storage::{FileSink, MemorySink, StorageSink};
pub use transfer::{TransferEngine, TransferReport, TransferStats};
