//! Store Abstraction
//!
//! The contract every metric value backend implements. Metric types hold a
//! `MetricStore` (usually as `Box<dyn MetricStore>`) and never see which
//! backend sits behind it.
//!
//! Implementations:
//! - `MmapStore`: multi-process, one mapped file per (metric, process)
//! - `InMemoryStore`: single process, for tests and non-forking programs

mod memory;

use std::collections::BTreeMap;

use crate::error::StoreResult;
use crate::metrics::{Aggregation, LabelSet, MetricSettings, MetricType};

pub use memory::{InMemoryMetricStore, InMemoryStore};

/// Values of one metric
pub trait MetricStore: Send + Sync {
    /// Name of the metric this store holds
    fn metric_name(&self) -> &str;

    /// How values from different processes are combined by `all_values`
    fn aggregation(&self) -> Aggregation;

    /// Overwrite the value for `labels`
    fn set(&self, labels: &LabelSet, value: f64) -> StoreResult<()>;

    /// Add `by` to the value for `labels`. Safe under concurrent callers.
    fn increment(&self, labels: &LabelSet, by: f64) -> StoreResult<()>;

    /// Add 1 to the value for `labels`
    fn increment_one(&self, labels: &LabelSet) -> StoreResult<()> {
        self.increment(labels, 1.0)
    }

    /// This process's value for `labels`; 0.0 if never written.
    fn get(&self, labels: &LabelSet) -> StoreResult<f64>;

    /// Run `block` so that no reader observes a partially applied
    /// multi-value update. `block` may call back into this store.
    fn synchronize(
        &self,
        block: &mut dyn FnMut(&dyn MetricStore) -> StoreResult<()>,
    ) -> StoreResult<()>;

    /// Aggregated value of every label set, across all writers
    fn all_values(&self) -> StoreResult<BTreeMap<LabelSet, f64>>;
}

/// Builds a `MetricStore` per metric
pub trait DataStore: Send + Sync {
    type Store: MetricStore + 'static;

    /// Validate `settings` and create the store for `metric_name`.
    /// Fails before touching any backing storage when settings are invalid.
    fn for_metric(
        &self,
        metric_name: &str,
        metric_type: MetricType,
        settings: &MetricSettings,
    ) -> StoreResult<Self::Store>;
}
