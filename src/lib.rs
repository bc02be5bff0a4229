pub mod config;
pub mod error;
pub mod metrics;
pub mod mmap;
pub mod store;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use metrics::{Aggregation, LabelKeyEncoder, LabelSet, MetricSettings, MetricType};
pub use mmap::{DictReader, MmapMetricStore, MmapStore, MmapedDict};
pub use store::{DataStore, InMemoryMetricStore, InMemoryStore, MetricStore};
