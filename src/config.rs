//! Store Configuration
//!
//! Settings for the mmap backend. Loadable from a TOML document or from
//! environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | MMAP_METRICS_DIR | /tmp/mmap-metrics | Directory holding the dictionary files |
//! | MMAP_METRICS_INITIAL_CAPACITY | 1048576 | Size of a freshly created file in bytes |

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};
use crate::mmap::dict::{HEADER_SIZE, INITIAL_MMAP_SIZE};

/// Configuration for the mmap store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory for dictionary files (created if missing)
    pub dir: PathBuf,
    /// Capacity of a new dictionary file (default: 1MB, doubled on overflow)
    pub initial_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            dir: PathBuf::from("/tmp/mmap-metrics"),
            initial_capacity: INITIAL_MMAP_SIZE,
        }
    }
}

impl StoreConfig {
    /// Configuration rooted at the given directory, default capacity
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StoreConfig {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> StoreResult<Self> {
        let defaults = Self::default();
        let dir = std::env::var("MMAP_METRICS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.dir);
        let initial_capacity = match std::env::var("MMAP_METRICS_INITIAL_CAPACITY") {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                StoreError::InvalidConfig(format!(
                    "MMAP_METRICS_INITIAL_CAPACITY is not a byte count: {:?}",
                    raw
                ))
            })?,
            Err(_) => defaults.initial_capacity,
        };

        let config = StoreConfig {
            dir,
            initial_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document such as `dir = "/var/run/metrics"`
    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        let config: StoreConfig =
            toml::from_str(s).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can produce valid dictionary files
    pub fn validate(&self) -> StoreResult<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig("dir must not be empty".to_string()));
        }
        // Room past the header, and doubled capacities stay 8-byte aligned.
        if self.initial_capacity < HEADER_SIZE * 2 || self.initial_capacity % 8 != 0 {
            return Err(StoreError::InvalidConfig(format!(
                "initial_capacity must be a multiple of 8 and at least {} bytes, got {}",
                HEADER_SIZE * 2,
                self.initial_capacity
            )));
        }
        Ok(())
    }
}
