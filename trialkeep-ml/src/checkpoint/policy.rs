//! Save cadence, retention options and checkpoint directory naming.

use serde::{Deserialize, Serialize};
use trialkeep_core::{BestMetric, CheckpointConfig, CheckpointFormat, MetricMode};

use crate::metrics::Metrics;

/// Prefix shared by every checkpoint directory name.
pub const CHECKPOINT_PREFIX: &str = "checkpoint_";

/// The only checkpointable item key.
pub const DEFAULT_ITEM_NAME: &str = "default";

/// Options supplied once when a retention controller is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionOptions {
    pub save_interval_steps: u64,
    pub max_to_keep: Option<usize>,
    pub todelete_subdir: Option<String>,
    pub best_metric: Option<BestMetric>,
}

impl Default for RetentionOptions {
    fn default() -> Self {
        Self {
            save_interval_steps: 1,
            max_to_keep: None,
            todelete_subdir: None,
            best_metric: None,
        }
    }
}

impl RetentionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_interval_steps(mut self, steps: u64) -> Self {
        self.save_interval_steps = steps;
        self
    }

    pub fn max_to_keep(mut self, n: usize) -> Self {
        self.max_to_keep = Some(n);
        self
    }

    pub fn todelete_subdir(mut self, subdir: impl Into<String>) -> Self {
        self.todelete_subdir = Some(subdir.into());
        self
    }

    pub fn best_metric(mut self, name: impl Into<String>, mode: MetricMode) -> Self {
        self.best_metric = Some(BestMetric {
            name: name.into(),
            mode,
        });
        self
    }

    /// Whether metrics are loaded alongside checkpoints and used for pruning.
    pub fn track_best(&self) -> bool {
        self.best_metric.is_some()
    }
}

impl From<&CheckpointConfig> for RetentionOptions {
    fn from(config: &CheckpointConfig) -> Self {
        Self {
            save_interval_steps: config.save_interval_steps,
            max_to_keep: config.max_to_keep,
            todelete_subdir: config.todelete_subdir.clone(),
            best_metric: config.best_metric.clone(),
        }
    }
}

/// Cadence and naming rules of one checkpoint root.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    format: CheckpointFormat,
    options: RetentionOptions,
}

impl RetentionPolicy {
    /// Build a policy. A zero save interval is normalized to one.
    pub fn new(format: CheckpointFormat, mut options: RetentionOptions) -> Self {
        if options.save_interval_steps == 0 {
            options.save_interval_steps = 1;
        }
        Self { format, options }
    }

    pub fn format(&self) -> CheckpointFormat {
        self.format
    }

    pub fn options(&self) -> &RetentionOptions {
        &self.options
    }

    /// Directory name of the checkpoint at `step`.
    pub fn checkpoint_name(&self, step: u64) -> String {
        match self.format {
            CheckpointFormat::Persistence => format!("{CHECKPOINT_PREFIX}{step:08}"),
            _ => format!("{CHECKPOINT_PREFIX}{step}"),
        }
    }

    /// Step encoded in a directory name, if it is a checkpoint of this format.
    ///
    /// In-progress directories (`checkpoint_00000010.tmp-1712`) do not parse.
    pub fn parse_step(&self, name: &str) -> Option<u64> {
        let digits = name.strip_prefix(CHECKPOINT_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let step: u64 = digits.parse().ok()?;
        (self.checkpoint_name(step) == name).then_some(step)
    }

    /// Regular cadence: strictly after the last checkpoint and on the interval.
    pub fn on_cadence(&self, step: u64, last_step: Option<u64>) -> bool {
        match last_step {
            None => true,
            Some(last) => last < step && step % self.options.save_interval_steps == 0,
        }
    }

    /// Score used for best-aware pruning; higher is better.
    pub fn score(&self, metrics: Option<&Metrics>) -> Option<f64> {
        let best = self.options.best_metric.as_ref()?;
        let value = *metrics?.get(&best.name)?;
        if value.is_nan() {
            return None;
        }
        Some(match best.mode {
            MetricMode::Max => value,
            MetricMode::Min => -value,
        })
    }
}
