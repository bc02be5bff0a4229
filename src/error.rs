//! Store Error - single error type for every store operation

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate
pub type StoreResult<T> = Result<T, StoreError>;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Open, extend, map, lock or fsync failed
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Per-metric settings rejected at `for_metric` time
    #[error("invalid store settings: {0}")]
    InvalidSettings(String),

    /// Metric name cannot be turned into a file name
    #[error("invalid metric name: {0:?}")]
    InvalidMetricName(String),

    /// Backend configuration rejected
    #[error("invalid store config: {0}")]
    InvalidConfig(String),

    /// A dictionary file does not follow the on-disk format
    #[error("corrupted dictionary {}: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },

    /// Encoded label key does not fit the 32-bit length prefix
    #[error("key of {len} bytes exceeds the maximum entry size")]
    KeyTooLarge { len: usize },

    /// Dictionary would grow past what the 32-bit `used` header can address
    #[error("dictionary {} is full ({used} bytes used)", path.display())]
    DictionaryFull { path: PathBuf, used: usize },
}

impl StoreError {
    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
