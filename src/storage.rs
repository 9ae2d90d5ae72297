//! Storage sinks for drained samples.
//!
//! Storage is an append-only stream of raw samples in acquisition order: no
//! header, no framing, each sample in the native byte order of the card's
//! sample word. One drain tick produces at most one append call.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffers::{Sample, SAMPLE_BYTES};

/// Destination for drained samples.
pub trait StorageSink: Send {
    /// Append `samples` and return how many were stored.
    ///
    /// A return value smaller than `samples.len()` is a short write: only that
    /// prefix is persisted.
    fn append(&mut self, samples: &[Sample]) -> io::Result<usize>;

    /// Flush and release the destination. Called exactly once, when the
    /// drain thread has been joined.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Error that cut the last append short, if any.
    ///
    /// A short write returns the stored prefix length instead of an error, so
    /// the cause is kept here until taken.
    fn take_error(&mut self) -> Option<io::Error> {
        None
    }

    /// Human-readable destination for logging.
    fn describe(&self) -> String;
}

/// Raw sample log on disk.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    encoded: Vec<u8>,
    short_write_error: Option<io::Error>,
}

impl FileSink {
    /// Open (or create) `path` for appending, creating missing parent
    /// directories.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "Opened storage file");
        Ok(Self {
            path,
            file: Some(file),
            encoded: Vec::new(),
            short_write_error: None,
        })
    }

    /// Path of the sample log.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageSink for FileSink {
    fn append(&mut self, samples: &[Sample]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "storage file closed"))?;

        self.encoded.clear();
        self.encoded.reserve(samples.len() * SAMPLE_BYTES);
        for sample in samples {
            self.encoded.extend_from_slice(&sample.to_ne_bytes());
        }

        let mut written = 0;
        while written < self.encoded.len() {
            match file.write(&self.encoded[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Report the error only if nothing at all went out
                Err(e) if written == 0 => return Err(e),
                Err(e) => {
                    self.short_write_error = Some(e);
                    break;
                }
            }
        }

        if written == 0 && !samples.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "storage accepted no data",
            ));
        }
        Ok(written / SAMPLE_BYTES)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
            debug!(path = %self.path.display(), "Closed storage file");
        }
        Ok(())
    }

    fn take_error(&mut self) -> Option<io::Error> {
        self.short_write_error.take()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Shared in-memory sample log.
///
/// Clones share the same log, so a host can keep one handle for reading while
/// the drain thread owns another.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    samples: Arc<Mutex<Vec<Sample>>>,
    appends: Arc<Mutex<Vec<usize>>>,
}

impl MemorySink {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything appended so far.
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    /// Length of each append call, in order.
    pub fn append_sizes(&self) -> Vec<usize> {
        self.appends.lock().clone()
    }
}

impl StorageSink for MemorySink {
    fn append(&mut self, samples: &[Sample]) -> io::Result<usize> {
        self.samples.lock().extend_from_slice(samples);
        self.appends.lock().push(samples.len());
        Ok(samples.len())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Decode a raw sample log written by [`FileSink`].
pub fn decode_samples(bytes: &[u8]) -> Vec<Sample> {
    bytes
        .chunks_exact(SAMPLE_BYTES)
        .map(|pair| Sample::from_ne_bytes([pair[0], pair[1]]))
        .collect()
}
