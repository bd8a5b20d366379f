//! Per-trial early-stopping callback invoked by the training loop.

use std::fmt;
use std::ops::BitOr;

use trialkeep_core::{ProcessGroup, Result, TrialError};

use super::controller::Feedback;
use super::reward::RewardFn;
use crate::metrics::{CrossStepAggregator, Metrics, TuningMetricsInput, aggregate_metrics};

/// Which loops produced the metrics of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunningMode(u8);

impl RunningMode {
    pub const UNKNOWN: RunningMode = RunningMode(0);
    pub const TRAIN: RunningMode = RunningMode(1);
    pub const EVAL: RunningMode = RunningMode(1 << 1);
    pub const DECODE: RunningMode = RunningMode(1 << 2);

    pub fn detect(has_train: bool, has_eval: bool, has_decode: bool) -> Self {
        let mut mode = Self::UNKNOWN;
        if has_train {
            mode = mode | Self::TRAIN;
        }
        if has_eval {
            mode = mode | Self::EVAL;
        }
        if has_decode {
            mode = mode | Self::DECODE;
        }
        mode
    }

    pub fn contains(self, other: RunningMode) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn has_train(self) -> bool {
        self.contains(Self::TRAIN)
    }

    pub fn has_eval(self) -> bool {
        self.contains(Self::EVAL)
    }

    pub fn has_decode(self) -> bool {
        self.contains(Self::DECODE)
    }
}

impl BitOr for RunningMode {
    type Output = RunningMode;

    fn bitor(self, rhs: RunningMode) -> RunningMode {
        RunningMode(self.0 | rhs.0)
    }
}

impl fmt::Display for RunningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::TRAIN, "TRAIN"),
            (Self::EVAL, "EVAL"),
            (Self::DECODE, "DECODE"),
        ]
        .into_iter()
        .filter(|(m, _)| self.contains(*m))
        .map(|(_, n)| n)
        .collect();
        if names.is_empty() {
            write!(f, "UNKNOWN")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Called by the training loop at evaluation, decode and checkpoint
/// boundaries. Returns whether training should stop.
pub trait EarlyStopFn {
    fn call(
        &mut self,
        metrics: Metrics,
        running_mode: RunningMode,
        global_step: u64,
        is_last_ckpt: bool,
    ) -> Result<bool>;
}

/// Reports measurements of one sub-experiment of a trial and completes the
/// trial at the last checkpoint of the last sub-experiment.
pub struct EarlyStoppingCallback<'a> {
    pub sub_experiment_id: &'a str,
    pub feedback: &'a mut dyn Feedback,
    pub reward_fn: &'a dyn RewardFn,
    pub cross_step_metric_aggregator: &'a dyn CrossStepAggregator,
    pub group: &'a dyn ProcessGroup,
    pub is_metric_reporting_role: bool,
    pub is_last_experiment: bool,
    pub tuning_step_start: u64,
}

impl EarlyStoppingCallback<'_> {
    fn add_final_measurement(&mut self, step: u64) -> Result<()> {
        let metrics_across_steps: Vec<(u64, Metrics)> = self
            .feedback
            .measurements()
            .into_iter()
            .map(|m| {
                let mut metrics = m.metrics;
                metrics.insert("reward".into(), m.reward);
                (m.step, metrics)
            })
            .collect();

        let mut final_metrics = self.cross_step_metric_aggregator.aggregate(&metrics_across_steps);
        final_metrics.remove("reward");
        let final_reward = self.reward_fn.reward(&final_metrics, step);
        tracing::info!(
            trial_id = self.feedback.id(),
            step,
            reward = final_reward,
            metrics = ?final_metrics,
            "Final measurement reported"
        );
        self.feedback.add_measurement(final_reward, final_metrics, step, None)
    }
}

impl EarlyStopFn for EarlyStoppingCallback<'_> {
    fn call(
        &mut self,
        metrics: Metrics,
        running_mode: RunningMode,
        global_step: u64,
        is_last_ckpt: bool,
    ) -> Result<bool> {
        if self.is_metric_reporting_role {
            let tuning_step = self.tuning_step_start + global_step;

            // No metrics to report on train-only steps.
            if self.group.is_coordinator() && (running_mode.has_eval() || running_mode.has_decode())
            {
                let metrics: Metrics = if self.sub_experiment_id.is_empty() {
                    metrics
                } else {
                    metrics
                        .into_iter()
                        .map(|(k, v)| (format!("{k}:{}", self.sub_experiment_id), v))
                        .collect()
                };

                let reward = self.reward_fn.reward(&metrics, tuning_step);
                if reward.is_nan() {
                    return Err(TrialError::NanReward { step: tuning_step }.into());
                }
                tracing::info!(
                    trial_id = self.feedback.id(),
                    sub_experiment = self.sub_experiment_id,
                    step = global_step,
                    reward,
                    mode = %running_mode,
                    is_last_ckpt,
                    "Measurement reported"
                );
                self.feedback.add_measurement(reward, metrics, tuning_step, None)?;
            }

            if is_last_ckpt {
                self.group.sync_global_devices(&format!(
                    "Sync on trial {} (sub-experiment={:?}) termination at step {global_step} started",
                    self.feedback.id(),
                    self.sub_experiment_id
                ))?;
                // Completes the trial exactly once.
                if self.is_last_experiment && self.group.is_coordinator() {
                    self.add_final_measurement(tuning_step + 1)?;
                    self.feedback.done()?;
                }
                self.group.sync_global_devices(&format!(
                    "Sync on trial {} (sub-experiment={:?}) termination at step {global_step} completed",
                    self.feedback.id(),
                    self.sub_experiment_id
                ))?;
                tracing::info!(
                    trial_id = self.feedback.id(),
                    sub_experiment = self.sub_experiment_id,
                    "Sub-experiment completed"
                );
            }
        }
        Ok(self.feedback.should_stop_early())
    }
}

/// Whether `global_step` is the last evaluation point of the run.
///
/// True at the final step, or when fewer steps remain than the larger of the
/// active loop's interval and the save interval.
pub fn is_last_checkpoint(
    running_mode: RunningMode,
    global_step: u64,
    num_train_steps: u64,
    eval_interval_steps: u64,
    decode_interval_steps: u64,
    save_interval_steps: u64,
) -> bool {
    let remaining = num_train_steps as i128 - global_step as i128;
    if remaining == 0 {
        return true;
    }
    let last_eval = running_mode.has_eval()
        && remaining < eval_interval_steps.max(save_interval_steps) as i128;
    let last_decode = running_mode.has_decode()
        && remaining < decode_interval_steps.max(save_interval_steps) as i128;
    last_eval || last_decode
}

/// Aggregate the metrics of a step and ask `early_stop_fn` whether to stop.
///
/// Train metrics are folded in only at the last checkpoint or on steps that
/// also evaluate or decode.
pub fn should_early_stop(
    early_stop_fn: Option<&mut dyn EarlyStopFn>,
    global_step: u64,
    is_last_ckpt: bool,
    mut input: TuningMetricsInput,
) -> Result<bool> {
    let Some(early_stop_fn) = early_stop_fn else {
        return Ok(false);
    };

    let running_mode = RunningMode::detect(
        input.train_steps_per_sec.is_some(),
        input.eval_metrics.is_some(),
        input.decode_metrics.is_some(),
    );

    if !(is_last_ckpt || running_mode.has_eval() || running_mode.has_decode()) {
        input.train_metrics = None;
    }

    let tuning_metrics = aggregate_metrics(&input)?;
    early_stop_fn.call(tuning_metrics, running_mode, global_step, is_last_ckpt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{EvalMetrics, LastReportedMetricValues};
    use crate::tuning::controller::Measurement;
    use crate::tuning::search_space::Dna;
    use std::path::PathBuf;
    use std::thread;
    use trialkeep_core::{DistributedError, SingleProcess, ThreadGroup};

    #[derive(Default)]
    struct RecordingFeedback {
        id: u64,
        dna: Dna,
        measurements: Vec<Measurement>,
        done_calls: usize,
        stop: bool,
    }

    impl Feedback for RecordingFeedback {
        fn id(&self) -> u64 {
            self.id
        }
        fn dna(&self) -> &Dna {
            &self.dna
        }
        fn add_measurement(
            &mut self,
            reward: f64,
            metrics: Metrics,
            step: u64,
            checkpoint_path: Option<PathBuf>,
        ) -> Result<()> {
            self.measurements.push(Measurement {
                step,
                reward,
                metrics,
                checkpoint_path,
            });
            Ok(())
        }
        fn done(&mut self) -> Result<()> {
            self.done_calls += 1;
            Ok(())
        }
        fn skip(&mut self, _reason: &str) -> Result<()> {
            Ok(())
        }
        fn should_stop_early(&self) -> bool {
            self.stop
        }
        fn measurements(&self) -> Vec<Measurement> {
            self.measurements.clone()
        }
    }

    fn acc_reward(metrics: &Metrics, _step: u64) -> f64 {
        metrics
            .iter()
            .find(|(k, _)| k.starts_with("acc"))
            .map(|(_, v)| *v)
            .unwrap_or(f64::NAN)
    }

    fn metrics(pairs: &[(&str, f64)]) -> Metrics {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_running_mode() {
        let mode = RunningMode::detect(true, false, true);
        assert!(mode.has_train() && mode.has_decode() && !mode.has_eval());
        assert_eq!(mode.to_string(), "TRAIN|DECODE");
        assert_eq!(RunningMode::detect(false, false, false).to_string(), "UNKNOWN");
    }

    #[test]
    fn test_is_last_checkpoint() {
        let eval = RunningMode::EVAL;
        assert!(is_last_checkpoint(RunningMode::TRAIN, 100, 100, 10, 10, 10));
        assert!(!is_last_checkpoint(RunningMode::TRAIN, 95, 100, 10, 10, 10));
        assert!(is_last_checkpoint(eval, 95, 100, 10, 50, 1));
        assert!(!is_last_checkpoint(eval, 80, 100, 10, 50, 1));
        assert!(is_last_checkpoint(eval, 80, 100, 10, 50, 25));
        assert!(is_last_checkpoint(RunningMode::DECODE, 60, 100, 10, 50, 1));
        assert!(!is_last_checkpoint(RunningMode::UNKNOWN, 99, 100, 10, 10, 10));
        assert!(is_last_checkpoint(eval, 120, 100, 10, 10, 10));
    }

    #[test]
    fn test_callback_suffixes_and_offsets() {
        let group = SingleProcess::new();
        let mut feedback = RecordingFeedback::default();
        let aggregator = LastReportedMetricValues;
        let mut callback = EarlyStoppingCallback {
            sub_experiment_id: "ft",
            feedback: &mut feedback,
            reward_fn: &acc_reward,
            cross_step_metric_aggregator: &aggregator,
            group: &group,
            is_metric_reporting_role: true,
            is_last_experiment: false,
            tuning_step_start: 2 * 1_000_000_000,
        };
        let stop = callback
            .call(metrics(&[("acc", 0.5)]), RunningMode::EVAL, 5, false)
            .unwrap();
        assert!(!stop);

        assert_eq!(feedback.measurements.len(), 1);
        let m = &feedback.measurements[0];
        assert_eq!(m.step, 2_000_000_005);
        assert_eq!(m.metrics, metrics(&[("acc:ft", 0.5)]));
        assert_eq!(m.reward, 0.5);
    }

    #[test]
    fn test_callback_skips_train_only_steps() {
        let group = SingleProcess::new();
        let mut feedback = RecordingFeedback::default();
        let aggregator = LastReportedMetricValues;
        let mut callback = EarlyStoppingCallback {
            sub_experiment_id: "",
            feedback: &mut feedback,
            reward_fn: &acc_reward,
            cross_step_metric_aggregator: &aggregator,
            group: &group,
            is_metric_reporting_role: true,
            is_last_experiment: true,
            tuning_step_start: 0,
        };
        callback
            .call(metrics(&[("acc", 0.5)]), RunningMode::TRAIN, 3, false)
            .unwrap();
        assert!(feedback.measurements.is_empty());
    }

    #[test]
    fn test_callback_nan_reward_fails() {
        let group = SingleProcess::new();
        let mut feedback = RecordingFeedback::default();
        let aggregator = LastReportedMetricValues;
        let mut callback = EarlyStoppingCallback {
            sub_experiment_id: "",
            feedback: &mut feedback,
            reward_fn: &acc_reward,
            cross_step_metric_aggregator: &aggregator,
            group: &group,
            is_metric_reporting_role: true,
            is_last_experiment: true,
            tuning_step_start: 0,
        };
        let err = callback
            .call(metrics(&[("loss", 1.0)]), RunningMode::EVAL, 3, false)
            .unwrap_err();
        assert!(matches!(
            err,
            trialkeep_core::TrialkeepError::Trial(TrialError::NanReward { step: 3 })
        ));
    }

    #[test]
    fn test_last_checkpoint_adds_final_measurement_once() {
        let group = SingleProcess::new();
        let mut feedback = RecordingFeedback {
            id: 7,
            ..Default::default()
        };
        let aggregator = LastReportedMetricValues;
        let mut callback = EarlyStoppingCallback {
            sub_experiment_id: "",
            feedback: &mut feedback,
            reward_fn: &acc_reward,
            cross_step_metric_aggregator: &aggregator,
            group: &group,
            is_metric_reporting_role: true,
            is_last_experiment: true,
            tuning_step_start: 0,
        };
        callback
            .call(metrics(&[("acc", 0.4), ("loss", 2.0)]), RunningMode::EVAL, 10, false)
            .unwrap();
        callback
            .call(metrics(&[("acc", 0.6)]), RunningMode::EVAL, 20, true)
            .unwrap();

        assert_eq!(feedback.done_calls, 1);
        let last = feedback.measurements.last().unwrap();
        assert_eq!(last.step, 21);
        assert_eq!(last.reward, 0.6);
        assert_eq!(last.metrics, metrics(&[("acc", 0.6), ("loss", 2.0)]));
        assert_eq!(
            group.barrier_labels(),
            vec![
                "Sync on trial 7 (sub-experiment=\"\") termination at step 20 started".to_string(),
                "Sync on trial 7 (sub-experiment=\"\") termination at step 20 completed".to_string(),
            ]
        );
    }

    #[test]
    fn test_last_checkpoint_of_earlier_sub_experiment_does_not_finish() {
        let group = SingleProcess::new();
        let mut feedback = RecordingFeedback::default();
        let aggregator = LastReportedMetricValues;
        let mut callback = EarlyStoppingCallback {
            sub_experiment_id: "pretrain",
            feedback: &mut feedback,
            reward_fn: &acc_reward,
            cross_step_metric_aggregator: &aggregator,
            group: &group,
            is_metric_reporting_role: true,
            is_last_experiment: false,
            tuning_step_start: 0,
        };
        callback
            .call(metrics(&[("acc", 0.6)]), RunningMode::EVAL, 20, true)
            .unwrap();
        assert_eq!(feedback.done_calls, 0);
        assert_eq!(group.barrier_labels().len(), 2);
    }

    #[test]
    fn test_termination_barrier_rejects_processes_in_different_trials() {
        let handles: Vec<_> = ThreadGroup::new(2)
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let mut feedback = RecordingFeedback {
                        id: 1 + member.process_index() as u64,
                        ..Default::default()
                    };
                    let aggregator = LastReportedMetricValues;
                    let mut callback = EarlyStoppingCallback {
                        sub_experiment_id: "",
                        feedback: &mut feedback,
                        reward_fn: &acc_reward,
                        cross_step_metric_aggregator: &aggregator,
                        group: &member,
                        is_metric_reporting_role: true,
                        is_last_experiment: true,
                        tuning_step_start: 0,
                    };
                    callback.call(metrics(&[("acc", 0.6)]), RunningMode::EVAL, 20, true)
                })
            })
            .collect();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(
                err,
                trialkeep_core::TrialkeepError::Distributed(DistributedError::BarrierMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_non_reporting_role_only_polls() {
        let group = SingleProcess::new();
        let mut feedback = RecordingFeedback {
            stop: true,
            ..Default::default()
        };
        let aggregator = LastReportedMetricValues;
        let mut callback = EarlyStoppingCallback {
            sub_experiment_id: "",
            feedback: &mut feedback,
            reward_fn: &acc_reward,
            cross_step_metric_aggregator: &aggregator,
            group: &group,
            is_metric_reporting_role: false,
            is_last_experiment: true,
            tuning_step_start: 0,
        };
        let stop = callback
            .call(metrics(&[("acc", 0.6)]), RunningMode::EVAL, 20, true)
            .unwrap();
        assert!(stop);
        assert!(feedback.measurements.is_empty());
        assert!(group.barrier_labels().is_empty());
    }

    struct Capture(Option<Metrics>, Option<RunningMode>);

    impl EarlyStopFn for Capture {
        fn call(
            &mut self,
            metrics: Metrics,
            running_mode: RunningMode,
            _global_step: u64,
            _is_last_ckpt: bool,
        ) -> Result<bool> {
            self.0 = Some(metrics);
            self.1 = Some(running_mode);
            Ok(true)
        }
    }

    #[test]
    fn test_should_early_stop_without_callback() {
        assert!(!should_early_stop(None, 1, true, TuningMetricsInput::default()).unwrap());
    }

    #[test]
    fn test_should_early_stop_drops_train_metrics_on_train_only_steps() {
        let mut capture = Capture(None, None);
        let input = TuningMetricsInput {
            train_metrics: Some(metrics(&[("loss", 1.0)])),
            train_steps_per_sec: Some(4.0),
            ..Default::default()
        };
        assert!(should_early_stop(Some(&mut capture), 3, false, input).unwrap());
        assert_eq!(capture.0.unwrap(), metrics(&[("train_steps_per_sec", 4.0)]));
        assert_eq!(capture.1, Some(RunningMode::TRAIN));
    }

    #[test]
    fn test_should_early_stop_keeps_train_metrics_on_eval_steps() {
        let mut capture = Capture(None, None);
        let input = TuningMetricsInput {
            train_metrics: Some(metrics(&[("loss", 1.0)])),
            eval_metrics: Some(EvalMetrics {
                input_names: vec!["dev".into()],
                metrics_list: Some(vec![Some(metrics(&[("acc", 0.5)]))]),
                ..Default::default()
            }),
            ..Default::default()
        };
        should_early_stop(Some(&mut capture), 3, false, input).unwrap();
        assert_eq!(
            capture.0.unwrap(),
            metrics(&[("train/loss", 1.0), ("eval_test_dev/metrics/acc", 0.5)])
        );
        assert_eq!(capture.1, Some(RunningMode::EVAL));
    }
}
