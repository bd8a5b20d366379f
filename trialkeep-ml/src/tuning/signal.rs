//! Outcome of a training run, and the runner interface that produces it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use trialkeep_core::Result;

use super::early_stop::EarlyStopFn;
use super::experiment::Experiment;
use crate::metrics::Metrics;

/// How a sub-experiment run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum TrialSignal {
    /// Ran to completion; proceed with the next sub-experiment.
    Continue,
    /// Stop the trial and report a final measurement. Without a reward, the
    /// reward function is applied to `metrics`.
    EarlyStop {
        reward: Option<f64>,
        metrics: Metrics,
        step: u64,
        checkpoint: Option<PathBuf>,
    },
    /// The trial is infeasible.
    Skip { reason: Option<String>, step: u64 },
}

/// What the runner needs to know about the sub-experiment it runs.
#[derive(Debug, Clone)]
pub struct SubExperimentRun {
    pub trial_id: u64,
    /// Position of the sub-experiment in the trial.
    pub index: usize,
    pub id: String,
    pub experiment: Arc<dyn Experiment>,
    pub tuning_step_start: u64,
}

/// The training, evaluation and decode loop of one sub-experiment.
///
/// Runs with the trial's decisions bound and calls `callback` at its
/// evaluation, decode and checkpoint boundaries.
pub trait TrialRunner {
    fn run(
        &mut self,
        run: &SubExperimentRun,
        trial_dir: &Path,
        callback: &mut dyn EarlyStopFn,
    ) -> Result<TrialSignal>;
}
