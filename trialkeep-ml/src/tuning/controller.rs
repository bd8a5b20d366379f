//! Interfaces to the search controller that owns trial identity and
//! final disposition.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trialkeep_core::Result;

use super::search_space::{Dna, DnaSpec};
use crate::metrics::Metrics;

/// One reported `(reward, metrics, step)` tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub step: u64,
    pub reward: f64,
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<PathBuf>,
}

/// Final disposition of a trial as seen by the search controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Running,
    Completed,
    Skipped,
}

/// Controller-side record of a trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: u64,
    pub dna: Dna,
    pub status: TrialStatus,
    pub skip_reason: Option<String>,
    pub measurements: Vec<Measurement>,
    pub group: Option<String>,
    pub stop_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrialRecord {
    /// Reward of the last measurement, which is the final one once the trial
    /// is completed.
    pub fn final_reward(&self) -> Option<f64> {
        self.measurements.last().map(|m| m.reward)
    }
}

/// Per-trial channel back to the search controller.
pub trait Feedback: Send {
    fn id(&self) -> u64;
    fn dna(&self) -> &Dna;
    fn add_measurement(
        &mut self,
        reward: f64,
        metrics: Metrics,
        step: u64,
        checkpoint_path: Option<PathBuf>,
    ) -> Result<()>;
    /// Mark the trial completed. Must be called at most once per trial.
    fn done(&mut self) -> Result<()>;
    /// Mark the trial infeasible.
    fn skip(&mut self, reason: &str) -> Result<()>;
    fn should_stop_early(&self) -> bool;
    /// Measurements reported so far, in order.
    fn measurements(&self) -> Vec<Measurement>;
}

/// Proposes new decision assignments.
pub trait SearchAlgorithm: Send {
    /// Human-readable description, written to `search_algorithm.txt`.
    fn describe(&self) -> String;
    fn propose(&mut self, space: &DnaSpec) -> Result<Dna>;
}

/// Arguments of [`SearchController::sample`].
pub struct SampleRequest<'a> {
    pub space: &'a DnaSpec,
    pub algorithm: &'a mut dyn SearchAlgorithm,
    pub max_trials: Option<usize>,
    /// Processes in the same group are handed the same trials, in order.
    pub group: Option<&'a str>,
    pub study: Option<&'a str>,
}

pub type FeedbackIter<'a> = Box<dyn Iterator<Item = Result<Box<dyn Feedback + 'a>>> + 'a>;

/// Hands out trials lazily.
pub trait SearchController {
    fn sample<'a>(&'a mut self, request: SampleRequest<'a>) -> Result<FeedbackIter<'a>>;
}
