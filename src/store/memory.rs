//! In-process metric store
//!
//! Values live in a map per metric, guarded by a re-entrant mutex so that
//! `synchronize` blocks can call back into the store. Only sees writes of
//! the current process; `all_values` has nothing to aggregate across.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use parking_lot::ReentrantMutex;

use super::{DataStore, MetricStore};
use crate::error::{StoreError, StoreResult};
use crate::metrics::{Aggregation, LabelSet, MetricSettings, MetricType};

/// Factory for in-process metric stores
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore;

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore
    }
}

impl DataStore for InMemoryStore {
    type Store = InMemoryMetricStore;

    fn for_metric(
        &self,
        metric_name: &str,
        metric_type: MetricType,
        settings: &MetricSettings,
    ) -> StoreResult<InMemoryMetricStore> {
        if metric_name.is_empty() {
            return Err(StoreError::InvalidMetricName(metric_name.to_string()));
        }
        let aggregation = settings.resolve_aggregation(metric_type)?;

        Ok(InMemoryMetricStore {
            metric_name: metric_name.to_string(),
            aggregation,
            values: ReentrantMutex::new(RefCell::new(HashMap::new())),
        })
    }
}

/// Values of one metric held in process memory
pub struct InMemoryMetricStore {
    metric_name: String,
    aggregation: Aggregation,
    values: ReentrantMutex<RefCell<HashMap<LabelSet, f64>>>,
}

impl MetricStore for InMemoryMetricStore {
    fn metric_name(&self) -> &str {
        &self.metric_name
    }

    fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    fn set(&self, labels: &LabelSet, value: f64) -> StoreResult<()> {
        let guard = self.values.lock();
        guard.borrow_mut().insert(labels.clone(), value);
        Ok(())
    }

    fn increment(&self, labels: &LabelSet, by: f64) -> StoreResult<()> {
        let guard = self.values.lock();
        *guard.borrow_mut().entry(labels.clone()).or_insert(0.0) += by;
        Ok(())
    }

    fn get(&self, labels: &LabelSet) -> StoreResult<f64> {
        let guard = self.values.lock();
        let value = guard.borrow().get(labels).copied().unwrap_or(0.0);
        Ok(value)
    }

    fn synchronize(
        &self,
        block: &mut dyn FnMut(&dyn MetricStore) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let _guard = self.values.lock();
        block(self)
    }

    fn all_values(&self) -> StoreResult<BTreeMap<LabelSet, f64>> {
        let guard = self.values.lock();
        let values = guard
            .borrow()
            .iter()
            .map(|(labels, value)| (labels.clone(), *value))
            .collect();
        Ok(values)
    }
}

impl std::fmt::Debug for InMemoryMetricStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMetricStore")
            .field("metric_name", &self.metric_name)
            .field("aggregation", &self.aggregation)
            .finish()
    }
}
