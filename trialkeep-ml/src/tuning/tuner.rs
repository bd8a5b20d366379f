//! The tuning loop.
//!
//! Samples trials from a search controller and evaluates each one by running
//! the experiment's sub-experiments in order. Sub-experiment `i` reports
//! measurements at steps offset by `i * SUB_EXPERIMENT_STEP_OFFSET` so the
//! series of different phases never collide.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use trialkeep_core::persistence::write_file_once;
use trialkeep_core::{ConfigError, ProcessGroup, Result, TuningConfig};

use super::binding::DecisionScope;
use super::controller::{Feedback, SampleRequest, SearchController};
use super::dirname::TrialDirectoryNamer;
use super::early_stop::{EarlyStopFn, EarlyStoppingCallback, RunningMode};
use super::experiment::{Experiment, SubExperiment};
use super::reward::RewardFn;
use super::signal::{SubExperimentRun, TrialRunner, TrialSignal};
use crate::metrics::{CrossStepAggregator, LastReportedMetricValues, Metrics};

/// Step distance between consecutive sub-experiments of a trial.
pub const SUB_EXPERIMENT_STEP_OFFSET: u64 = 1_000_000_000;

/// Step reported to the search controller for `step` of sub-experiment `index`.
pub fn tuning_step(index: usize, step: u64) -> u64 {
    index as u64 * SUB_EXPERIMENT_STEP_OFFSET + step
}

/// Process-level options of the tuning loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerOptions {
    pub job_log_dir: PathBuf,
    pub study: Option<String>,
    pub tuner_group: Option<String>,
    /// Overrides the experiment's trial budget.
    pub max_num_trials: Option<usize>,
    pub is_metric_reporting_role: bool,
    /// Added to the experiment's own skip list.
    pub errors_to_skip: Vec<String>,
    pub dirname_length_threshold: usize,
}

impl From<&TuningConfig> for TunerOptions {
    fn from(config: &TuningConfig) -> Self {
        Self {
            job_log_dir: config.job_log_dir.clone(),
            study: config.study.clone(),
            tuner_group: config.tuner_group.clone(),
            max_num_trials: config.max_num_trials,
            is_metric_reporting_role: config.is_metric_reporting_role,
            errors_to_skip: config.errors_to_skip.clone(),
            dirname_length_threshold: config.dirname_length_threshold,
        }
    }
}

/// How a trial ended, as seen by this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    Completed,
    EarlyStopped { step: u64, reward: Option<f64> },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialReport {
    pub trial_id: u64,
    pub trial_dir: PathBuf,
    pub outcome: TrialOutcome,
}

/// Trials evaluated by one call of [`Tuner::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudySummary {
    pub experiment: String,
    pub study: Option<String>,
    pub trials: Vec<TrialReport>,
}

impl StudySummary {
    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, TrialOutcome::Completed))
    }

    pub fn early_stopped(&self) -> usize {
        self.count(|o| matches!(o, TrialOutcome::EarlyStopped { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, TrialOutcome::Skipped { .. }))
    }

    fn count(&self, pred: impl Fn(&TrialOutcome) -> bool) -> usize {
        self.trials.iter().filter(|t| pred(&t.outcome)).count()
    }
}

/// Shared, per-study parts of the early-stopping callback.
struct TrialContext<'a> {
    sub_experiments: &'a [SubExperiment],
    reward: &'a dyn RewardFn,
    aggregator: &'a dyn CrossStepAggregator,
}

/// Records whether the training loop reported its last checkpoint.
struct LastCheckpointTracker<'a, F: EarlyStopFn + ?Sized> {
    inner: &'a mut F,
    reached: bool,
}

impl<F: EarlyStopFn + ?Sized> EarlyStopFn for LastCheckpointTracker<'_, F> {
    fn call(
        &mut self,
        metrics: Metrics,
        running_mode: RunningMode,
        global_step: u64,
        is_last_ckpt: bool,
    ) -> Result<bool> {
        let stop = self.inner.call(metrics, running_mode, global_step, is_last_ckpt)?;
        self.reached |= is_last_ckpt;
        Ok(stop)
    }
}

pub struct Tuner {
    experiment: Arc<dyn Experiment>,
    group: Arc<dyn ProcessGroup>,
    options: TunerOptions,
}

impl Tuner {
    pub fn new(
        experiment: Arc<dyn Experiment>,
        group: Arc<dyn ProcessGroup>,
        options: TunerOptions,
    ) -> Self {
        Self {
            experiment,
            group,
            options,
        }
    }

    pub fn options(&self) -> &TunerOptions {
        &self.options
    }

    /// Run trials until the controller stops handing them out.
    ///
    /// Skippable trial errors mark the trial skipped and the loop goes on;
    /// any other error ends the loop.
    pub fn run<C>(&self, controller: &mut C, runner: &mut dyn TrialRunner) -> Result<StudySummary>
    where
        C: SearchController + ?Sized,
    {
        let mut settings = self.experiment.search();
        let max_num_trials = self.options.max_num_trials.or(settings.max_num_trials);
        let mut errors_to_skip = settings.errors_to_skip.clone();
        errors_to_skip.extend(self.options.errors_to_skip.iter().cloned());
        let aggregator: Arc<dyn CrossStepAggregator> = settings
            .cross_step_metric_aggregator
            .clone()
            .unwrap_or_else(|| Arc::new(LastReportedMetricValues));

        let space = self.experiment.search_space()?;
        if space.is_constant() {
            return Err(ConfigError::ConstantSearchSpace {
                experiment: self.experiment.name().to_string(),
            }
            .into());
        }

        let job_log_dir = &self.options.job_log_dir;
        std::fs::create_dir_all(job_log_dir)?;
        tracing::info!(search_space = %space, "Search space");
        write_file_once(&job_log_dir.join("search_space.txt"), &space.to_string())?;
        let algorithm_description = settings.algorithm.describe();
        tracing::info!(algorithm = %algorithm_description, "Search algorithm");
        write_file_once(&job_log_dir.join("search_algorithm.txt"), &algorithm_description)?;

        let mut sub_experiments = self.experiment.sub_experiments();
        if sub_experiments.is_empty() {
            sub_experiments.push(SubExperiment::new("", Arc::clone(&self.experiment)));
        }
        let namer = TrialDirectoryNamer::new(
            job_log_dir.clone(),
            &space,
            self.options.dirname_length_threshold,
        );
        let context = TrialContext {
            sub_experiments: &sub_experiments,
            reward: settings.reward.as_ref(),
            aggregator: aggregator.as_ref(),
        };

        let mut summary = StudySummary {
            experiment: self.experiment.name().to_string(),
            study: self.options.study.clone(),
            trials: Vec::new(),
        };

        let sampler = controller.sample(SampleRequest {
            space: &space,
            algorithm: settings.algorithm.as_mut(),
            max_trials: max_num_trials,
            group: self.options.tuner_group.as_deref(),
            study: self.options.study.as_deref(),
        })?;

        for feedback in sampler {
            let mut feedback = feedback?;
            let trial_id = feedback.id();
            tracing::info!(trial_id, group = ?self.options.tuner_group, "Start working on trial");

            let _scope = DecisionScope::enter(&space, feedback.dna())?;
            let trial_dir = namer.dirname(trial_id, feedback.dna())?;

            let outcome = match self.run_trial(feedback.as_mut(), &trial_dir, &context, runner) {
                Ok(outcome) => outcome,
                Err(e) => match e.skip_reason(&errors_to_skip) {
                    Some(reason) => {
                        tracing::warn!(trial_id, reason = %reason, "Trial failed and will be skipped");
                        self.sync_early_stop(trial_id, || feedback.skip(&reason))?;
                        TrialOutcome::Skipped { reason }
                    }
                    None => return Err(e),
                },
            };
            summary.trials.push(TrialReport {
                trial_id,
                trial_dir,
                outcome,
            });
        }

        tracing::info!(
            study = ?self.options.study,
            trials = summary.trials.len(),
            completed = summary.completed(),
            early_stopped = summary.early_stopped(),
            skipped = summary.skipped(),
            "Completed with all trials"
        );
        Ok(summary)
    }

    fn run_trial(
        &self,
        feedback: &mut dyn Feedback,
        trial_dir: &Path,
        context: &TrialContext<'_>,
        runner: &mut dyn TrialRunner,
    ) -> Result<TrialOutcome> {
        let trial_id = feedback.id();
        let last_index = context.sub_experiments.len().saturating_sub(1);

        for (index, sub) in context.sub_experiments.iter().enumerate() {
            let run = SubExperimentRun {
                trial_id,
                index,
                id: sub.id.clone(),
                experiment: Arc::clone(&sub.experiment),
                tuning_step_start: tuning_step(index, 0),
            };
            let (signal, reached_last_checkpoint) = {
                let mut callback = EarlyStoppingCallback {
                    sub_experiment_id: &sub.id,
                    feedback: &mut *feedback,
                    reward_fn: context.reward,
                    cross_step_metric_aggregator: context.aggregator,
                    group: self.group.as_ref(),
                    is_metric_reporting_role: self.options.is_metric_reporting_role,
                    is_last_experiment: index == last_index,
                    tuning_step_start: run.tuning_step_start,
                };
                let mut tracked = LastCheckpointTracker {
                    inner: &mut callback,
                    reached: false,
                };
                let signal = runner.run(&run, trial_dir, &mut tracked)?;
                (signal, tracked.reached)
            };

            match signal {
                TrialSignal::Continue
                    if index == last_index
                        && self.options.is_metric_reporting_role
                        && !reached_last_checkpoint =>
                {
                    // A run resumed past its last evaluation returns without
                    // ever reporting the last checkpoint.
                    tracing::warn!(
                        trial_id,
                        sub_experiment = %sub.id,
                        "Training returned before its last checkpoint; completing the trial"
                    );
                    self.sync_early_stop(trial_id, || feedback.done())?;
                }
                TrialSignal::Continue => {}
                TrialSignal::EarlyStop {
                    reward,
                    metrics,
                    step,
                    checkpoint,
                } => {
                    let mut reported = None;
                    if self.group.is_coordinator() {
                        let reward = reward.unwrap_or_else(|| context.reward.reward(&metrics, step));
                        tracing::info!(
                            trial_id,
                            step,
                            reward,
                            metrics = ?metrics,
                            "Trial is early stopped and its reward fed back to the controller"
                        );
                        feedback.add_measurement(reward, metrics, step, checkpoint)?;
                        reported = Some(reward);
                    }
                    self.sync_early_stop(trial_id, || feedback.done())?;
                    return Ok(TrialOutcome::EarlyStopped {
                        step,
                        reward: reported,
                    });
                }
                TrialSignal::Skip { reason, step } => {
                    let reason = reason.unwrap_or_else(|| "Unknown.".to_string());
                    self.sync_early_stop(trial_id, || feedback.skip(&reason))?;
                    tracing::info!(
                        trial_id,
                        step,
                        reason = %reason,
                        "Trial is early stopped and will be skipped by the controller"
                    );
                    return Ok(TrialOutcome::Skipped { reason });
                }
            }
        }
        Ok(TrialOutcome::Completed)
    }

    /// Run `finish` on the coordinator between two barriers shared by every
    /// process of the group.
    fn sync_early_stop(&self, trial_id: u64, finish: impl FnOnce() -> Result<()>) -> Result<()> {
        self.group
            .sync_global_devices(&format!("Sync on trial {trial_id} early stopping started"))?;
        if self.group.is_coordinator() {
            finish()?;
        }
        self.group
            .sync_global_devices(&format!("Sync on trial {trial_id} early stopping completed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuning_step_offsets() {
        assert_eq!(tuning_step(0, 5), 5);
        assert_eq!(tuning_step(2, 5), 2_000_000_005);
    }

    #[test]
    fn test_summary_counts() {
        let report = |id, outcome| TrialReport {
            trial_id: id,
            trial_dir: PathBuf::from(format!("/logs/{id}")),
            outcome,
        };
        let summary = StudySummary {
            experiment: "demo".into(),
            study: None,
            trials: vec![
                report(1, TrialOutcome::Completed),
                report(
                    2,
                    TrialOutcome::Skipped {
                        reason: "Unknown.".into(),
                    },
                ),
                report(
                    3,
                    TrialOutcome::EarlyStopped {
                        step: 10,
                        reward: Some(0.5),
                    },
                ),
            ],
        };
        assert_eq!(summary.completed(), 1);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.early_stopped(), 1);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["trials"][1]["outcome"]["status"], "skipped");
    }
}
