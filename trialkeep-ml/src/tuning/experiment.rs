//! The experiment interface consumed by the tuning loop.

use std::fmt;
use std::sync::Arc;

use trialkeep_core::Result;

use super::controller::SearchAlgorithm;
use super::reward::RewardFn;
use super::search_space::DnaSpec;
use crate::metrics::CrossStepAggregator;

/// Search configuration declared by an experiment.
pub struct SearchSettings {
    pub algorithm: Box<dyn SearchAlgorithm>,
    pub reward: Arc<dyn RewardFn>,
    /// Reduction used for the final measurement. Defaults to the last
    /// reported value per metric.
    pub cross_step_metric_aggregator: Option<Arc<dyn CrossStepAggregator>>,
    pub max_num_trials: Option<usize>,
    /// Training error kinds that skip the trial.
    pub errors_to_skip: Vec<String>,
}

impl fmt::Debug for SearchSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchSettings")
            .field("algorithm", &self.algorithm.describe())
            .field("max_num_trials", &self.max_num_trials)
            .field("errors_to_skip", &self.errors_to_skip)
            .finish_non_exhaustive()
    }
}

/// A tunable experiment.
pub trait Experiment: Send + Sync {
    fn name(&self) -> &str;

    /// Decision points this experiment reads while it is built.
    fn search_space(&self) -> Result<DnaSpec>;

    fn search(&self) -> SearchSettings;

    /// Ordered phases of a trial. Empty means the experiment itself is the
    /// only phase.
    fn sub_experiments(&self) -> Vec<SubExperiment> {
        Vec::new()
    }
}

impl fmt::Debug for dyn Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Experiment({})", self.name())
    }
}

/// One phase of a trial.
#[derive(Debug, Clone)]
pub struct SubExperiment {
    /// Suffix appended to reported metric names. Empty for single-phase trials.
    pub id: String,
    pub experiment: Arc<dyn Experiment>,
}

impl SubExperiment {
    pub fn new(id: impl Into<String>, experiment: Arc<dyn Experiment>) -> Self {
        Self {
            id: id.into(),
            experiment,
        }
    }
}
