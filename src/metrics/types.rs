//! Core metric types shared by every store backend

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{StoreError, StoreResult};

/// Kind of metric a store is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Monotonically increasing counter
    Counter,

    /// Point-in-time value
    Gauge,

    /// Bucketed distribution (bucket counters + sum + count)
    Histogram,

    /// Sum + count pair
    Summary,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How values written by different processes are folded into one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Arithmetic sum. Required for accumulating metric types.
    #[default]
    Sum,
    /// Highest value reported by any process (gauges only)
    Max,
    /// Lowest value reported by any process (gauges only)
    Min,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
        }
    }

    /// Whether this mode makes sense for the given metric type.
    ///
    /// Counters, histograms and summaries accumulate, so only `sum` keeps
    /// their per-process values meaningful once combined.
    pub fn is_valid_for(&self, metric_type: MetricType) -> bool {
        match self {
            Aggregation::Sum => true,
            Aggregation::Max | Aggregation::Min => metric_type == MetricType::Gauge,
        }
    }

    /// Fold per-process values. Returns None for an empty input.
    pub fn fold<I>(&self, values: I) -> Option<f64>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut values = values.into_iter();
        let first = values.next()?;
        Some(match self {
            Aggregation::Sum => values.fold(first, |acc, v| acc + v),
            Aggregation::Max => values.fold(first, f64::max),
            Aggregation::Min => values.fold(first, f64::min),
        })
    }
}

impl FromStr for Aggregation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Aggregation::Sum),
            "max" => Ok(Aggregation::Max),
            "min" => Ok(Aggregation::Min),
            other => Err(StoreError::InvalidSettings(format!(
                "unsupported aggregation mode {:?} (expected sum, max or min)",
                other
            ))),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form per-metric settings, validated by the store factory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricSettings {
    entries: BTreeMap<String, String>,
}

impl MetricSettings {
    /// Setting key selecting the aggregation mode
    pub const AGGREGATION: &'static str = "aggregation";

    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for settings holding only an aggregation mode
    pub fn with_aggregation(aggregation: Aggregation) -> Self {
        Self::new().with(Self::AGGREGATION, aggregation.as_str())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check the settings and resolve the aggregation mode.
    ///
    /// Only the `aggregation` key is accepted; a missing mode means `sum`.
    pub fn resolve_aggregation(&self, metric_type: MetricType) -> StoreResult<Aggregation> {
        if let Some(unknown) = self.entries.keys().find(|k| *k != Self::AGGREGATION) {
            return Err(StoreError::InvalidSettings(format!(
                "only the aggregation setting can be specified, got {:?}",
                unknown
            )));
        }

        let aggregation = match self.get(Self::AGGREGATION) {
            Some(mode) => mode.parse::<Aggregation>()?,
            None => Aggregation::default(),
        };

        if !aggregation.is_valid_for(metric_type) {
            return Err(StoreError::InvalidSettings(format!(
                "{} aggregation is not allowed for {} metrics",
                aggregation, metric_type
            )));
        }

        Ok(aggregation)
    }
}

/// A set of labels (name/value pairs) identifying one series of a metric.
///
/// Labels are kept sorted by name, so the same labels supplied in a
/// different order are the same series and encode to the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet {
    labels: BTreeMap<String, String>,
}

impl LabelSet {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        LabelSet { labels }
    }

    /// Create an empty LabelSet
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create LabelSet from slice of (name, value) tuples.
    /// A repeated name keeps its last value.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let labels = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LabelSet { labels }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Iterate labels in canonical (name) order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={:?}", k, v)?;
        }
        f.write_str("}")
    }
}
