//! Store configuration
//!
//! All sections deserialize from JSON with per-field defaults, so a config
//! file only needs the values it overrides:
//!
//! ```json
//! { "segment": { "flush_records": 500 }, "coordinator": { "max_workers": 4 } }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub segment: SegmentConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

impl StoreConfig {
    /// Load and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: StoreConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.segment.validate()?;
        self.coordinator.validate()?;
        Ok(())
    }
}

/// Write-path settings of a segment writer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Records buffered before a block is flushed (default: 1000)
    #[serde(default = "default_flush_records")]
    pub flush_records: u32,

    /// Encoded bytes buffered before a block is flushed (default: 4MB)
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,

    /// Compress blocks with zstd (default: true)
    #[serde(default = "default_true")]
    pub compression: bool,

    /// zstd level, 1-22 (default: 3)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// fsync after every block (default: true)
    #[serde(default = "default_true")]
    pub sync_on_flush: bool,
}

impl SegmentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_records == 0 {
            return Err(Error::Configuration("segment.flush_records must be > 0".into()));
        }
        if self.flush_bytes == 0 {
            return Err(Error::Configuration("segment.flush_bytes must be > 0".into()));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::Configuration(format!(
                "segment.compression_level must be in 1..=22, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            flush_records: default_flush_records(),
            flush_bytes: default_flush_bytes(),
            compression: true,
            compression_level: default_compression_level(),
            sync_on_flush: true,
        }
    }
}

/// Task scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Concurrent worker tasks (default: available parallelism)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-task deadline in seconds (default: 3600)
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Registry polling interval while waiting for tasks (default: 250ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl CoordinatorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Configuration("coordinator.max_workers must be > 0".into()));
        }
        if self.task_timeout_secs == 0 {
            return Err(Error::Configuration(
                "coordinator.task_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            task_timeout_secs: default_task_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Merge pass settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Drop duplicate events (default: true)
    #[serde(default = "default_true")]
    pub deduplicate: bool,

    /// Decoded event data kept per segment cursor (default: 4096)
    #[serde(default = "default_data_cache_entries")]
    pub data_cache_entries: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            deduplicate: true,
            data_cache_entries: default_data_cache_entries(),
        }
    }
}

fn default_flush_records() -> u32 {
    1000
}

fn default_flush_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_compression_level() -> i32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_task_timeout_secs() -> u64 {
    3600
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_data_cache_entries() -> usize {
    4096
}
