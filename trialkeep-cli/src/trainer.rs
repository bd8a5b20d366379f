//! A simulated training loop driving checkpoint retention and early stopping.
//!
//! The loss decays exponentially at a rate set by the bound hyperparameters.
//! Learning rates that are too large for the optimizer make it grow instead,
//! and the run fails with a `diverged` training error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use trialkeep_core::{
    CheckpointConfig, CheckpointFormat, PreemptionSignal, ProcessGroup, Result, TrialError,
};
use trialkeep_ml::checkpoint::{LocalFsStorage, RetentionController, RetentionOptions};
use trialkeep_ml::metrics::{EvalMetrics, Metrics, TuningMetricsInput, aggregate_metrics};
use trialkeep_ml::tuning::{
    DecisionScope, EarlyStopFn, RunningMode, SubExperimentRun, TrialRunner, TrialSignal,
    is_last_checkpoint, should_early_stop,
};

use crate::demo::{DIVERGED, EVAL_SET, LEARNING_RATE, NUM_LAYERS, OPTIMIZER};

const DIVERGENCE_LOSS: f64 = 1e3;

#[derive(Debug, Clone, PartialEq)]
struct Hyperparameters {
    learning_rate: f64,
    optimizer: String,
    num_layers: i64,
}

impl Hyperparameters {
    /// Read the decisions bound to the current trial.
    fn from_scope() -> Self {
        let learning_rate = DecisionScope::decision(LEARNING_RATE)
            .and_then(|v| v.as_f64())
            .unwrap_or(1e-3);
        let optimizer = DecisionScope::decision(OPTIMIZER)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "'adam'".to_string());
        let num_layers = DecisionScope::decision(NUM_LAYERS)
            .and_then(|v| v.as_i64())
            .unwrap_or(2);
        Self {
            learning_rate,
            optimizer,
            num_layers,
        }
    }

    /// Per-step loss decay. Negative when training diverges.
    fn decay_rate(&self) -> f64 {
        let (gain, max_stable_lr) = if self.optimizer.contains("sgd") {
            (4.0, 0.05)
        } else {
            (20.0, 0.08)
        };
        if self.learning_rate > max_stable_lr {
            return -0.5;
        }
        gain * self.learning_rate / (self.num_layers.max(1) as f64).sqrt()
    }

    fn loss_floor(&self) -> f64 {
        0.05 + 0.4 / self.num_layers.max(1) as f64
    }
}

/// State saved in every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub step: u64,
    pub loss: f64,
    pub initial_loss: f64,
}

impl TrainState {
    /// Later phases start from a partially trained model.
    fn initial(phase: usize) -> Self {
        let loss = 2.0 / (phase as f64 + 1.0);
        Self {
            step: 0,
            loss,
            initial_loss: loss,
        }
    }

    fn advance(&mut self, step: u64, hp: &Hyperparameters) -> Result<()> {
        let floor = hp.loss_floor();
        self.loss = floor + (self.loss - floor) * (-hp.decay_rate()).exp();
        self.step = step;
        if !self.loss.is_finite() || self.loss > DIVERGENCE_LOSS {
            return Err(TrialError::training(
                DIVERGED,
                format!("loss reached {:.3e} at step {step}", self.loss),
            )
            .into());
        }
        Ok(())
    }

    fn accuracy(&self) -> f64 {
        (1.0 - self.loss / self.initial_loss.max(1.0)).clamp(0.0, 1.0)
    }

    fn train_metrics(&self) -> Metrics {
        [("loss".to_string(), self.loss)].into_iter().collect()
    }

    fn eval_metrics(&self) -> Metrics {
        [
            ("accuracy".to_string(), self.accuracy()),
            ("loss".to_string(), self.loss),
        ]
        .into_iter()
        .collect()
    }
}

/// Runs every sub-experiment with the same step budget and evaluation
/// cadence. Checkpoints go under `<trial_dir>[/<sub-experiment>]/checkpoints`.
pub struct SimulatedTrainer {
    format: CheckpointFormat,
    retention: RetentionOptions,
    group: Arc<dyn ProcessGroup>,
    preemption: PreemptionSignal,
    num_train_steps: u64,
    eval_interval_steps: u64,
}

impl SimulatedTrainer {
    pub fn new(
        checkpoint: &CheckpointConfig,
        group: Arc<dyn ProcessGroup>,
        preemption: PreemptionSignal,
        num_train_steps: u64,
        eval_interval_steps: u64,
    ) -> Self {
        Self {
            format: checkpoint.format,
            retention: RetentionOptions::from(checkpoint),
            group,
            preemption,
            num_train_steps,
            eval_interval_steps: eval_interval_steps.max(1),
        }
    }

    /// Report the evaluation of `state` at `step`; `Some` when the tuner
    /// asks to stop early.
    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        run: &SubExperimentRun,
        state: &TrainState,
        step: u64,
        is_last: bool,
        train_steps_per_sec: Option<f64>,
        controller: &RetentionController<LocalFsStorage<TrainState>>,
        callback: &mut dyn EarlyStopFn,
    ) -> Result<Option<TrialSignal>> {
        let input = TuningMetricsInput {
            train_metrics: Some(state.train_metrics()),
            eval_metrics: Some(EvalMetrics {
                input_names: vec![EVAL_SET.to_string()],
                metrics_list: Some(vec![Some(state.eval_metrics())]),
                ..Default::default()
            }),
            train_steps_per_sec,
            ..Default::default()
        };
        let reported = aggregate_metrics(&input)?;
        tracing::debug!(step, loss = state.loss, accuracy = state.accuracy(), "Evaluated");

        if !should_early_stop(Some(callback), step, is_last, input)? {
            return Ok(None);
        }
        tracing::info!(trial_id = run.trial_id, step, "Early stop requested");
        let checkpoint = controller
            .latest_step()
            .map(|s| controller.resolve_save_path(s, None))
            .transpose()?;
        Ok(Some(TrialSignal::EarlyStop {
            reward: None,
            metrics: with_sub_experiment_suffix(reported, &run.id),
            step: run.tuning_step_start + step,
            checkpoint,
        }))
    }

    fn checkpoint_dir(run: &SubExperimentRun, trial_dir: &Path) -> PathBuf {
        if run.id.is_empty() {
            trial_dir.join("checkpoints")
        } else {
            trial_dir.join(&run.id).join("checkpoints")
        }
    }
}

fn with_sub_experiment_suffix(metrics: Metrics, id: &str) -> Metrics {
    if id.is_empty() {
        return metrics;
    }
    metrics
        .into_iter()
        .map(|(k, v)| (format!("{k}:{id}"), v))
        .collect()
}

impl TrialRunner for SimulatedTrainer {
    fn run(
        &mut self,
        run: &SubExperimentRun,
        trial_dir: &Path,
        callback: &mut dyn EarlyStopFn,
    ) -> Result<TrialSignal> {
        let hp = Hyperparameters::from_scope();
        let checkpoint_dir = Self::checkpoint_dir(run, trial_dir);
        let mut controller = RetentionController::new(
            &checkpoint_dir,
            self.format,
            self.retention.clone(),
            LocalFsStorage::<TrainState>::new(),
            Arc::clone(&self.group),
            self.preemption.clone(),
        )?;

        let (mut state, start_step) = match controller.restore(None)? {
            Some(state) => {
                let start = state.step + 1;
                (state, start)
            }
            None => (TrainState::initial(run.index), 0),
        };
        tracing::info!(
            trial_id = run.trial_id,
            sub_experiment = %run.id,
            experiment = run.experiment.name(),
            learning_rate = hp.learning_rate,
            optimizer = %hp.optimizer,
            num_layers = hp.num_layers,
            start_step,
            "Training started"
        );

        // A run restored at or past its final step still owes the tuner its
        // last checkpoint report.
        if start_step > self.num_train_steps {
            let step = state.step;
            if let Some(signal) =
                self.evaluate(run, &state, step, true, None, &controller, callback)?
            {
                return Ok(signal);
            }
            return Ok(TrialSignal::Continue);
        }

        let started = Instant::now();
        let mut reported_last = false;
        for step in start_step..=self.num_train_steps {
            state.advance(step, &hp)?;

            let is_eval = step > 0 && step % self.eval_interval_steps == 0;
            let running_mode = if is_eval {
                RunningMode::TRAIN | RunningMode::EVAL
            } else {
                RunningMode::TRAIN
            };
            let is_last = is_last_checkpoint(
                running_mode,
                step,
                self.num_train_steps,
                self.eval_interval_steps,
                0,
                self.retention.save_interval_steps,
            );

            controller.save(step, &state, Some(state.eval_metrics()))?;
            if self.preemption.sync_point() == Some(step) {
                return Err(TrialError::training(
                    "preempted",
                    format!(
                        "checkpoint forced at step {step}; resume from {}",
                        checkpoint_dir.display()
                    ),
                )
                .into());
            }

            // Training runs to the end; the tuner hears about the last
            // checkpoint once.
            if reported_last || !(is_eval || is_last) {
                continue;
            }
            let elapsed = started.elapsed().as_secs_f64();
            let steps_per_sec = (elapsed > 0.0).then(|| (step + 1 - start_step) as f64 / elapsed);
            if let Some(signal) =
                self.evaluate(run, &state, step, is_last, steps_per_sec, &controller, callback)?
            {
                return Ok(signal);
            }
            reported_last = is_last;
        }

        tracing::info!(
            trial_id = run.trial_id,
            sub_experiment = %run.id,
            loss = state.loss,
            accuracy = state.accuracy(),
            "Training finished"
        );
        Ok(TrialSignal::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use trialkeep_core::SingleProcess;
    use trialkeep_ml::tuning::{Decision, DecisionPoint, Dna, DnaSpec, Experiment};

    /// Records every call instead of reporting to a study.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<(u64, bool, Metrics)>,
        stop_at: Option<u64>,
    }

    impl EarlyStopFn for Recorder {
        fn call(
            &mut self,
            metrics: Metrics,
            _running_mode: RunningMode,
            global_step: u64,
            is_last_ckpt: bool,
        ) -> Result<bool> {
            self.calls.push((global_step, is_last_ckpt, metrics));
            Ok(self.stop_at == Some(global_step))
        }
    }

    fn space() -> DnaSpec {
        DnaSpec::new(vec![
            DecisionPoint::float(LEARNING_RATE, 1e-4, 1.0),
            DecisionPoint::choices(OPTIMIZER, vec!["'adam'".into(), "<class 'optax.sgd'>".into()]),
            DecisionPoint::choices(NUM_LAYERS, vec![2.into(), 4.into()]),
        ])
        .unwrap()
    }

    fn trainer(num_train_steps: u64, eval_interval_steps: u64) -> SimulatedTrainer {
        trainer_saving_every(num_train_steps, eval_interval_steps, 5)
    }

    fn trainer_saving_every(
        num_train_steps: u64,
        eval_interval_steps: u64,
        save_interval_steps: u64,
    ) -> SimulatedTrainer {
        let checkpoint = CheckpointConfig {
            format: CheckpointFormat::Flat,
            save_interval_steps,
            max_to_keep: Some(2),
            ..Default::default()
        };
        SimulatedTrainer::new(
            &checkpoint,
            Arc::new(SingleProcess::new()),
            PreemptionSignal::new(),
            num_train_steps,
            eval_interval_steps,
        )
    }

    fn sub_run(index: usize, id: &str) -> SubExperimentRun {
        let mut registry = crate::demo::registry(0);
        let experiment: Arc<dyn Experiment> = registry.get("demo.synthetic.TinyLm").unwrap();
        SubExperimentRun {
            trial_id: 1,
            index,
            id: id.to_string(),
            experiment,
            tuning_step_start: index as u64 * 1_000_000_000,
        }
    }

    #[test]
    fn test_runs_to_last_checkpoint_and_retains() {
        let dir = TempDir::new().unwrap();
        let dna = Dna::new(vec![
            Decision::Float(0.01),
            Decision::Choice(0),
            Decision::Choice(0),
        ]);
        let _scope = DecisionScope::enter(&space(), &dna).unwrap();
        let mut recorder = Recorder::default();

        let signal = trainer(20, 5)
            .run(&sub_run(0, ""), dir.path(), &mut recorder)
            .unwrap();

        assert_eq!(signal, TrialSignal::Continue);
        let steps: Vec<(u64, bool)> = recorder.calls.iter().map(|c| (c.0, c.1)).collect();
        assert_eq!(steps, vec![(5, false), (10, false), (15, false), (20, true)]);
        assert!(recorder.calls[0].2.contains_key("eval_test_synthetic/metrics/accuracy"));
        assert!(recorder.calls[0].2.contains_key("train/loss"));

        let mut kept: Vec<String> = std::fs::read_dir(dir.path().join("checkpoints"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        kept.sort();
        assert_eq!(kept, vec!["checkpoint_15", "checkpoint_20"]);
    }

    #[test]
    fn test_early_stop_returns_signal_with_checkpoint() {
        let dir = TempDir::new().unwrap();
        let dna = Dna::new(vec![
            Decision::Float(0.01),
            Decision::Choice(1),
            Decision::Choice(1),
        ]);
        let _scope = DecisionScope::enter(&space(), &dna).unwrap();
        let mut recorder = Recorder {
            stop_at: Some(10),
            ..Default::default()
        };

        let signal = trainer(50, 5)
            .run(&sub_run(1, "finetune"), dir.path(), &mut recorder)
            .unwrap();

        match signal {
            TrialSignal::EarlyStop {
                reward,
                metrics,
                step,
                checkpoint,
            } => {
                assert_eq!(reward, None);
                assert_eq!(step, 1_000_000_010);
                assert!(metrics.contains_key("eval_test_synthetic/metrics/accuracy:finetune"));
                assert_eq!(
                    checkpoint,
                    Some(dir.path().join("finetune").join("checkpoints").join("checkpoint_10"))
                );
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn test_divergence_is_a_training_error() {
        let dir = TempDir::new().unwrap();
        let dna = Dna::new(vec![
            Decision::Float(0.5),
            Decision::Choice(1),
            Decision::Choice(0),
        ]);
        let _scope = DecisionScope::enter(&space(), &dna).unwrap();

        let err = trainer(100, 10)
            .run(&sub_run(0, ""), dir.path(), &mut Recorder::default())
            .unwrap_err();
        assert!(err.skip_reason(&[DIVERGED.to_string()]).is_some());
        assert!(err.skip_reason(&[]).is_none());
    }

    #[test]
    fn test_resumes_from_latest_checkpoint() {
        let dir = TempDir::new().unwrap();
        let dna = Dna::new(vec![
            Decision::Float(0.01),
            Decision::Choice(0),
            Decision::Choice(0),
        ]);
        let _scope = DecisionScope::enter(&space(), &dna).unwrap();

        trainer(10, 5)
            .run(&sub_run(0, ""), dir.path(), &mut Recorder::default())
            .unwrap();
        let mut recorder = Recorder::default();
        trainer(20, 5)
            .run(&sub_run(0, ""), dir.path(), &mut recorder)
            .unwrap();
        let steps: Vec<u64> = recorder.calls.iter().map(|c| c.0).collect();
        assert_eq!(steps, vec![15, 20]);
    }

    #[test]
    fn test_resume_at_final_step_reports_last_checkpoint() {
        let dir = TempDir::new().unwrap();
        let dna = Dna::new(vec![
            Decision::Float(0.01),
            Decision::Choice(0),
            Decision::Choice(0),
        ]);
        let _scope = DecisionScope::enter(&space(), &dna).unwrap();

        trainer(10, 5)
            .run(&sub_run(0, ""), dir.path(), &mut Recorder::default())
            .unwrap();
        let mut recorder = Recorder::default();
        let signal = trainer(10, 5)
            .run(&sub_run(0, ""), dir.path(), &mut recorder)
            .unwrap();

        assert_eq!(signal, TrialSignal::Continue);
        let steps: Vec<(u64, bool)> = recorder.calls.iter().map(|c| (c.0, c.1)).collect();
        assert_eq!(steps, vec![(10, true)]);
        assert!(recorder.calls[0].2.contains_key("eval_test_synthetic/metrics/accuracy"));
    }

    #[test]
    fn test_trains_to_the_end_after_early_last_checkpoint() {
        let dir = TempDir::new().unwrap();
        let dna = Dna::new(vec![
            Decision::Float(0.01),
            Decision::Choice(0),
            Decision::Choice(0),
        ]);
        let _scope = DecisionScope::enter(&space(), &dna).unwrap();
        let mut recorder = Recorder::default();

        trainer_saving_every(100, 10, 25)
            .run(&sub_run(0, ""), dir.path(), &mut recorder)
            .unwrap();

        // Fewer steps than the save interval remain after step 80.
        let last: Vec<u64> = recorder.calls.iter().filter(|c| c.1).map(|c| c.0).collect();
        assert_eq!(last, vec![80]);
        assert_eq!(recorder.calls.last().unwrap().0, 80);

        let mut kept: Vec<String> = std::fs::read_dir(dir.path().join("checkpoints"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        kept.sort();
        assert_eq!(kept, vec!["checkpoint_100", "checkpoint_75"]);
    }
}
