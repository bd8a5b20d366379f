//! Metric aggregation: flattening per-dataset metrics and reducing them across steps.

pub mod aggregate;
pub mod cross_step;

use std::collections::BTreeMap;

/// Flat mapping of metric name to value.
pub type Metrics = BTreeMap<String, f64>;

pub use aggregate::{
    DecodeMetrics, EvalMetrics, MetricFamilies, TuningMetricsInput, aggregate_metrics,
    flatten_dataset_metrics, update_float_dict,
};
pub use cross_step::{AverageMetricValues, CrossStepAggregator, LastReportedMetricValues};
