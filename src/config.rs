//! Pipeline configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/transfer.toml` by default)
//! 2. Environment variables prefixed with `DAQ_TRANSFER_`, nested keys joined
//!    with `__` (e.g. `DAQ_TRANSFER_DRAIN__POLL_INTERVAL_MS=5`)
//!
//! All values are write-once: they are read when the pipeline starts and
//! never change for the lifetime of a measurement.
//!
//! # Example
//! ```no_run
//! use daq_transfer::config::PipelineConfig;
//!
//! let config = PipelineConfig::load_from("config/transfer.toml")?;
//! println!("Ring capacity: {} samples", config.ring_capacity());
//! # Ok::<(), daq_transfer::TransferError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, TransferError};
use crate::telemetry::OutputFormat;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "DAQ_TRANSFER_";

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/transfer.toml";

/// What the transfer engine does with each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Append chunks to the ring buffer and drain them to storage
    #[default]
    Append,
    /// Sum chunks element-wise into the accumulator
    Accumulate,
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Chunk geometry and operating mode
    pub acquisition: AcquisitionConfig,
    /// Storage destination
    #[serde(default)]
    pub storage: StorageConfig,
    /// Drain thread settings
    #[serde(default)]
    pub drain: DrainConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Chunk geometry and operating mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Samples per hardware chunk
    pub buffer_size: usize,
    /// Ring buffer length in chunks (`L`)
    #[serde(default = "default_ring_chunks")]
    pub ring_chunks: usize,
    /// Append or accumulate
    #[serde(default)]
    pub mode: TransferMode,
    /// Consecutive records carried by one chunk
    #[serde(default = "default_records_per_chunk")]
    pub records_per_chunk: usize,
    /// Interleaved input channels
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Time between chunk completions, if known (used for sanity checks)
    #[serde(default)]
    pub chunk_period_ms: Option<u64>,
    /// Maximum expected duration of one transfer callback
    #[serde(default, with = "humantime_serde")]
    pub transfer_budget: Option<Duration>,
}

/// Storage destination
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Raw sample log, opened in append mode
    pub path: Option<PathBuf>,
}

/// Drain thread settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Poll interval `T` in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive write failures before the drain reports a fault
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Drain whatever is pending once more after the stop signal
    #[serde(default = "default_flush_on_stop")]
    pub flush_on_stop: bool,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
}

// Default value functions
fn default_ring_chunks() -> usize {
    10
}

fn default_records_per_chunk() -> usize {
    1
}

fn default_channels() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_flush_on_stop() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16384,
            ring_chunks: default_ring_chunks(),
            mode: TransferMode::default(),
            records_per_chunk: default_records_per_chunk(),
            channels: default_channels(),
            chunk_period_ms: None,
            transfer_budget: None,
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            flush_on_stop: default_flush_on_stop(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a builder starting from defaults.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load configuration from the default file and environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, with environment
    /// overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<()> {
        let acq = &self.acquisition;

        if acq.buffer_size == 0 {
            return Err(TransferError::configuration("buffer_size must be greater than 0"));
        }
        if acq.ring_chunks == 0 {
            return Err(TransferError::configuration("ring_chunks must be greater than 0"));
        }
        if acq.buffer_size.checked_mul(acq.ring_chunks).is_none() {
            return Err(TransferError::configuration(format!(
                "ring of {} x {} samples is too large",
                acq.ring_chunks, acq.buffer_size
            )));
        }
        if acq.records_per_chunk == 0 || acq.buffer_size % acq.records_per_chunk != 0 {
            return Err(TransferError::configuration(format!(
                "records_per_chunk {} must divide buffer_size {}",
                acq.records_per_chunk, acq.buffer_size
            )));
        }
        if acq.channels == 0 || self.record_len() % acq.channels != 0 {
            return Err(TransferError::configuration(format!(
                "channels {} must divide the record length {}",
                acq.channels,
                self.record_len()
            )));
        }
        if self.drain.poll_interval_ms == 0 {
            return Err(TransferError::configuration(
                "drain.poll_interval_ms must be greater than 0",
            ));
        }
        if self.drain.max_consecutive_failures == 0 {
            return Err(TransferError::configuration(
                "drain.max_consecutive_failures must be greater than 0",
            ));
        }

        // The poll period has to beat one full lap of the ring; not enforced.
        if acq.mode == TransferMode::Append {
            if let Some(fill_time) = self.ring_fill_time() {
                if self.poll_interval() >= fill_time {
                    warn!(
                        poll_interval_ms = self.drain.poll_interval_ms,
                        fill_time_ms = u64::try_from(fill_time.as_millis()).unwrap_or(u64::MAX),
                        "Drain poll interval is not shorter than the ring fill time; expect overflow"
                    );
                }
            }
        }

        Ok(())
    }

    /// Ring capacity in samples (`L * buffer_size`).
    pub fn ring_capacity(&self) -> usize {
        self.acquisition
            .buffer_size
            .saturating_mul(self.acquisition.ring_chunks)
    }

    /// Samples per record.
    pub fn record_len(&self) -> usize {
        self.acquisition.buffer_size / self.acquisition.records_per_chunk.max(1)
    }

    /// Drain poll interval `T`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain.poll_interval_ms)
    }

    /// Time to fill the ring once, if the chunk period is known.
    pub fn ring_fill_time(&self) -> Option<Duration> {
        self.acquisition
            .chunk_period_ms
            .map(|period| Duration::from_millis(period.saturating_mul(self.acquisition.ring_chunks as u64)))
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Set samples per hardware chunk.
    pub fn buffer_size(mut self, samples: usize) -> Self {
        self.config.acquisition.buffer_size = samples;
        self
    }

    /// Set the ring length in chunks.
    pub fn ring_chunks(mut self, chunks: usize) -> Self {
        self.config.acquisition.ring_chunks = chunks;
        self
    }

    /// Set the operating mode.
    pub fn mode(mut self, mode: TransferMode) -> Self {
        self.config.acquisition.mode = mode;
        self
    }

    /// Set the number of records per chunk.
    pub fn records_per_chunk(mut self, records: usize) -> Self {
        self.config.acquisition.records_per_chunk = records;
        self
    }

    /// Set the number of interleaved channels.
    pub fn channels(mut self, channels: usize) -> Self {
        self.config.acquisition.channels = channels;
        self
    }

    /// Set the expected chunk period.
    pub fn chunk_period_ms(mut self, period_ms: u64) -> Self {
        self.config.acquisition.chunk_period_ms = Some(period_ms);
        self
    }

    /// Set the transfer time budget.
    pub fn transfer_budget(mut self, budget: Duration) -> Self {
        self.config.acquisition.transfer_budget = Some(budget);
        self
    }

    /// Set the storage destination.
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.path = Some(path.into());
        self
    }

    /// Set the drain poll interval in milliseconds.
    pub fn poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.drain.poll_interval_ms = interval_ms;
        self
    }

    /// Set the consecutive write failure threshold.
    pub fn max_consecutive_failures(mut self, failures: u32) -> Self {
        self.config.drain.max_consecutive_failures = failures;
        self
    }

    /// Enable or disable the final drain pass on stop.
    pub fn flush_on_stop(mut self, enabled: bool) -> Self {
        self.config.drain.flush_on_stop = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = PipelineConfig::builder()
            .buffer_size(4)
            .ring_chunks(2)
            .build()
            .unwrap();

        assert_eq!(config.ring_capacity(), 8);
        assert_eq!(config.record_len(), 4);
        assert_eq!(config.acquisition.mode, TransferMode::Append);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert!(config.drain.flush_on_stop);
    }

    #[test]
    fn test_config_validation() {
        let invalid = [
            PipelineConfig::builder().buffer_size(0),
            PipelineConfig::builder().ring_chunks(0),
            PipelineConfig::builder().buffer_size(10).records_per_chunk(3),
            PipelineConfig::builder().buffer_size(12).records_per_chunk(2).channels(4),
            PipelineConfig::builder().poll_interval_ms(0),
            PipelineConfig::builder().max_consecutive_failures(0),
        ];
        for builder in invalid {
            let err = builder.build().unwrap_err();
            assert!(err.is_configuration(), "unexpected error: {err}");
        }
    }

    #[test]
    fn test_records_and_channels() {
        let config = PipelineConfig::builder()
            .buffer_size(12)
            .records_per_chunk(3)
            .channels(2)
            .build()
            .unwrap();
        assert_eq!(config.record_len(), 4);
    }

    #[test]
    fn test_ring_fill_time() {
        let config = PipelineConfig::builder()
            .ring_chunks(8)
            .chunk_period_ms(5)
            .build()
            .unwrap();
        assert_eq!(config.ring_fill_time(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_parse_toml() {
        let config: PipelineConfig = Figment::new()
            .merge(Toml::string(
                r#"
                [acquisition]
                buffer_size = 2048
                ring_chunks = 32
                mode = "accumulate"
                transfer_budget = "500us"

                [drain]
                poll_interval_ms = 4
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.acquisition.buffer_size, 2048);
        assert_eq!(config.acquisition.mode, TransferMode::Accumulate);
        assert_eq!(
            config.acquisition.transfer_budget,
            Some(Duration::from_micros(500))
        );
        assert_eq!(config.drain.poll_interval_ms, 4);
        assert_eq!(config.drain.max_consecutive_failures, 5);
        assert!(config.storage.path.is_none());
        assert_eq!(config.logging.level, "info");
    }
}
