//! Reward functions turning a flat metric mapping into a scalar.

use trialkeep_core::MetricMode;

use crate::metrics::Metrics;

/// Computes the scalar reward of a measurement. NaN means the reward is
/// undefined and fails the trial.
pub trait RewardFn: Send + Sync {
    fn reward(&self, metrics: &Metrics, step: u64) -> f64;
}

impl<F> RewardFn for F
where
    F: Fn(&Metrics, u64) -> f64 + Send + Sync,
{
    fn reward(&self, metrics: &Metrics, step: u64) -> f64 {
        self(metrics, step)
    }
}

/// Reward read from a single metric, negated when lower is better.
#[derive(Debug, Clone)]
pub struct SingleObjective {
    pub metric: String,
    pub goal: MetricMode,
}

impl SingleObjective {
    pub fn maximize(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            goal: MetricMode::Max,
        }
    }

    pub fn minimize(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            goal: MetricMode::Min,
        }
    }
}

impl RewardFn for SingleObjective {
    fn reward(&self, metrics: &Metrics, _step: u64) -> f64 {
        match metrics.get(&self.metric) {
            Some(v) if self.goal == MetricMode::Min => -v,
            Some(v) => *v,
            None => f64::NAN,
        }
    }
}
