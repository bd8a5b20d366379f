//! Reduction of per-step metrics into the final measurement of a trial.

use std::collections::HashMap;

use super::Metrics;

/// Reduces the ordered `(step, metrics)` history of a trial to one mapping.
pub trait CrossStepAggregator: Send + Sync {
    fn aggregate(&self, metrics_across_steps: &[(u64, Metrics)]) -> Metrics;
}

/// The last reported value of every metric wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastReportedMetricValues;

impl CrossStepAggregator for LastReportedMetricValues {
    fn aggregate(&self, metrics_across_steps: &[(u64, Metrics)]) -> Metrics {
        let mut result = Metrics::new();
        for (_, metrics) in metrics_across_steps {
            for (k, v) in metrics {
                result.insert(k.clone(), *v);
            }
        }
        result
    }
}

/// Mean of the last `last_n` reported values of every metric.
#[derive(Debug, Clone, Copy)]
pub struct AverageMetricValues {
    last_n: usize,
}

impl AverageMetricValues {
    /// A window of zero is widened to one so the mean is always defined.
    pub fn new(last_n: usize) -> Self {
        Self {
            last_n: last_n.max(1),
        }
    }

    pub fn last_n(&self) -> usize {
        self.last_n
    }
}

impl CrossStepAggregator for AverageMetricValues {
    fn aggregate(&self, metrics_across_steps: &[(u64, Metrics)]) -> Metrics {
        let mut history: HashMap<&str, Vec<f64>> = HashMap::new();
        for (_, metrics) in metrics_across_steps {
            for (k, v) in metrics {
                history.entry(k.as_str()).or_default().push(*v);
            }
        }

        history
            .into_iter()
            .map(|(k, values)| {
                let tail = &values[values.len().saturating_sub(self.last_n)..];
                let mean = tail.iter().sum::<f64>() / tail.len() as f64;
                (k.to_string(), mean)
            })
            .collect()
    }
}
