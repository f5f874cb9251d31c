//! Configuration types for BlobIO
//!
//! Everything here is plain data: the client threads these values through
//! constructors instead of keeping process-wide settings.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest dispatch worker count
pub const MAX_DISPATCH_WORKERS: usize = 64;
/// Smallest ring size exponent (1024 slots)
pub const MIN_RING_SIZE_SHIFT: u32 = 10;
/// Largest ring size exponent (2^30 slots)
pub const MAX_RING_SIZE_SHIFT: u32 = 30;

/// Root configuration for a BlobIO client
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::configuration(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&s)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::configuration(format!("render: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        self.stream.validate()
    }
}

/// Dispatch worker pool configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of worker threads, a power of two in [1, 64]
    pub workers: usize,
    /// Per-worker ring capacity is `1 << ring_size_shift`, shift in [10, 30]
    pub ring_size_shift: u32,
    /// CPU for each worker; empty leaves scheduling to the OS
    pub cpu_affinity: Vec<usize>,
    /// Push attempts on a full ring between two backoff sleeps
    pub spin_batch: u32,
    /// Backoff sleep in microseconds when a ring stays full
    pub backoff_us: u64,
    /// Upper bound on how long an idle worker sleeps between wake checks
    pub wake_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            ring_size_shift: 12, // 4096 slots
            cpu_affinity: Vec::new(),
            spin_batch: 64,
            backoff_us: 50,
            wake_timeout_ms: 100,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_DISPATCH_WORKERS || !self.workers.is_power_of_two()
        {
            return Err(Error::configuration(format!(
                "dispatch.workers must be a power of two in [1, {MAX_DISPATCH_WORKERS}], got {}",
                self.workers
            )));
        }
        if !(MIN_RING_SIZE_SHIFT..=MAX_RING_SIZE_SHIFT).contains(&self.ring_size_shift) {
            return Err(Error::configuration(format!(
                "dispatch.ring_size_shift must be in [{MIN_RING_SIZE_SHIFT}, {MAX_RING_SIZE_SHIFT}], got {}",
                self.ring_size_shift
            )));
        }
        if !self.cpu_affinity.is_empty() && self.cpu_affinity.len() != self.workers {
            return Err(Error::configuration(format!(
                "dispatch.cpu_affinity lists {} cpus for {} workers",
                self.cpu_affinity.len(),
                self.workers
            )));
        }
        if self.spin_batch == 0 {
            return Err(Error::configuration("dispatch.spin_batch must be positive"));
        }
        Ok(())
    }

    /// Ring capacity in slots
    #[must_use]
    pub const fn ring_capacity(&self) -> usize {
        1usize << self.ring_size_shift
    }
}

/// Per-blob stream configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Extent size in bytes, a power of two
    pub extent_size: u64,
    /// Largest single request accepted
    pub max_io_size: u64,
    /// Size callers should prefer
    pub optimal_io_size: u64,
    /// Admit requests through a range scheduler so overlapping I/O never runs concurrently
    pub serialize_overlapping: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            extent_size: 64 * 1024 * 1024, // 64 MB
            max_io_size: 1024 * 1024,      // 1 MB
            optimal_io_size: 128 * 1024,   // 128 KB
            serialize_overlapping: false,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.extent_size == 0 || !self.extent_size.is_power_of_two() {
            return Err(Error::configuration(format!(
                "stream.extent_size must be a power of two, got {}",
                self.extent_size
            )));
        }
        if self.max_io_size == 0 {
            return Err(Error::configuration("stream.max_io_size must be positive"));
        }
        if self.optimal_io_size > self.max_io_size {
            return Err(Error::configuration(format!(
                "stream.optimal_io_size {} exceeds max_io_size {}",
                self.optimal_io_size, self.max_io_size
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
