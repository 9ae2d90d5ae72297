//! CLI Entry Point for daq-transfer
//!
//! Provides command-line interface for:
//! - Running a simulated driver through a configured pipeline
//! - Checking a configuration file
//!
//! # Usage
//!
//! Simulate 1000 chunks, one every 2 ms:
//! ```bash
//! daq-transfer simulate --config config/transfer.toml --chunks 1000 --period-ms 2
//! ```
//!
//! Validate a configuration:
//! ```bash
//! daq-transfer check-config config/transfer.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use daq_transfer::config::DEFAULT_CONFIG_PATH;
use daq_transfer::{
    telemetry, NoiseSource, OwnedBufferPair, Pipeline, PipelineConfig, RampSource, SampleSource,
    SimulatedDriver,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "daq-transfer")]
#[command(about = "Double-buffer to ring-buffer acquisition pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated driver into a pipeline and print the final status
    Simulate {
        /// Pipeline configuration file (TOML format)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Number of chunks to deliver
        #[arg(long, default_value = "100")]
        chunks: u64,

        /// Time between chunk completions in milliseconds
        #[arg(long, default_value = "1")]
        period_ms: u64,

        /// Sample generator
        #[arg(long, value_enum, default_value = "ramp")]
        source: Source,

        /// Seed for the noise generator
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Override the storage path from the configuration
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file (TOML format)
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Source {
    /// Counting samples
    Ramp,
    /// Uniform random samples
    Noise,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            chunks,
            period_ms,
            source,
            seed,
            output,
        } => simulate(config, chunks, period_ms, source, seed, output),
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn simulate(
    config_path: PathBuf,
    chunks: u64,
    period_ms: u64,
    source: Source,
    seed: u64,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut config = PipelineConfig::load_from(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if let Some(output) = output {
        config.storage.path = Some(output);
    }
    if config.acquisition.chunk_period_ms.is_none() {
        config.acquisition.chunk_period_ms = Some(period_ms);
    }
    telemetry::init_from_config(&config)?;

    let buffer_size = config.acquisition.buffer_size;
    let (mut pipeline, engine) = Pipeline::builder(config)
        .start(OwnedBufferPair::new(buffer_size))
        .context("failed to start pipeline")?;

    let mut source: Box<dyn SampleSource> = match source {
        Source::Ramp => Box::new(RampSource::default()),
        Source::Noise => Box::new(NoiseSource::seeded(seed, 2048)),
    };

    let mut driver = SimulatedDriver::new(engine);
    let summary = driver.run_paced(&mut source, chunks, Duration::from_millis(period_ms));
    info!(chunks = summary.chunks, faults = summary.faults, "Simulation complete");

    pipeline.stop().context("failed to stop pipeline")?;

    let report = serde_json::json!({
        "simulation": summary,
        "status": pipeline.status(),
        "accumulator": pipeline.accumulator_snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Err(e) = pipeline.check_health() {
        eprintln!("Pipeline reported a fault: {e}");
    }
    Ok(())
}

fn check_config(config_path: PathBuf) -> Result<()> {
    let config = PipelineConfig::load_from(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    config.validate()?;

    println!("Configuration OK: {}", config_path.display());
    println!("  mode:              {:?}", config.acquisition.mode);
    println!("  buffer_size:       {}", config.acquisition.buffer_size);
    println!("  ring capacity:     {} samples", config.ring_capacity());
    println!("  record length:     {}", config.record_len());
    println!("  poll interval:     {:?}", config.poll_interval());
    match &config.storage.path {
        Some(path) => println!("  storage:           {}", path.display()),
        None => println!("  storage:           (none)"),
    }
    Ok(())
}
