//! Error types for the transfer pipeline.
//!
//! `TransferError` is the single error type of the crate. It follows the fault
//! taxonomy of the acquisition data path:
//!
//! - **`ConfigurationFault`**: a measurement was started without the buffers,
//!   sizes or storage destination it needs. Start is rejected.
//! - **`CursorCorruption`**: the transfer engine observed a buffer slot id that
//!   is neither 0 nor 1. No transfer happens for that invocation.
//! - **`OverflowDataLoss`**: the write cursor lapped the read cursor and
//!   unflushed samples were overwritten. Counted and reported, never fatal.
//! - **`StorageWriteFailure`**: the storage sink failed or accepted fewer
//!   samples than requested. The drain thread keeps running and retries.
//! - **`ThreadLifecycleFault`**: the drain thread could not be spawned or
//!   joined.
//! - **`Io`** / **`Config`**: wrapped `std::io::Error` and `figment::Error`.
//!
//! Errors raised on the driver's callback thread are never propagated across
//! the callback boundary (the driver has no error channel); they are recorded
//! in the pipeline counters and surfaced through
//! [`Pipeline::check_health`](crate::pipeline::Pipeline::check_health).

use thiserror::Error;

/// Result type alias for transfer pipeline operations.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors that can occur in the acquisition data path.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Required buffers, sizes or destination are missing or inconsistent
    #[error("Configuration fault: {message}")]
    ConfigurationFault { message: String },

    /// Buffer slot id outside {0, 1}
    #[error("Buffer slot id {raw} is corrupted (expected 0 or 1)")]
    CursorCorruption { raw: u8 },

    /// Driver buffer delivered a chunk of the wrong length
    #[error("Driver chunk holds {actual} samples, expected {expected}")]
    ChunkLengthMismatch { expected: usize, actual: usize },

    /// Unflushed ring buffer data was overwritten before the drain caught up
    #[error("Ring buffer overflow: {lost_samples} unflushed samples overwritten")]
    OverflowDataLoss { lost_samples: u64 },

    /// Storage sink error or short write
    #[error("Storage write failed after {written} of {requested} samples: {message}")]
    StorageWriteFailure {
        requested: usize,
        written: usize,
        message: String,
    },

    /// Drain thread could not be started or stopped
    #[error("Drain thread lifecycle fault: {message}")]
    ThreadLifecycleFault { message: String },

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file or environment could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl TransferError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationFault {
            message: message.into(),
        }
    }

    pub(crate) fn lifecycle(message: impl Into<String>) -> Self {
        Self::ThreadLifecycleFault {
            message: message.into(),
        }
    }

    /// Check if this is a configuration fault.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigurationFault { .. } | Self::Config(_))
    }

    /// Whether the pipeline can keep running after this error.
    ///
    /// Overflow and storage failures are reported but the data path keeps
    /// going; everything else ends the measurement.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OverflowDataLoss { .. } | Self::StorageWriteFailure { .. }
        )
    }
}

impl From<figment::Error> for TransferError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
