//! Metric-facing types shared by all store backends
//!
//! - **Label sets** identify one series of a metric
//! - **Settings** carry the per-metric aggregation mode
//! - **Key encoding** turns label sets into dictionary keys and back

mod types;
mod key_encoder;

pub use types::{Aggregation, LabelSet, MetricSettings, MetricType};
pub use key_encoder::LabelKeyEncoder;
