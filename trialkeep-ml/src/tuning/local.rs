//! In-process search controller backed by a shared study state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use trialkeep_core::persistence::atomic_write_json;
use trialkeep_core::{Result, TrialError};

use super::controller::{
    Feedback, FeedbackIter, Measurement, SampleRequest, SearchAlgorithm, SearchController,
    TrialRecord, TrialStatus,
};
use super::search_space::{Decision, DecisionPoint, Dna, DnaSpec};
use crate::metrics::Metrics;

#[derive(Debug, Serialize)]
struct StudyState {
    study_id: String,
    name: Option<String>,
    trials: Vec<TrialRecord>,
    #[serde(skip)]
    groups: HashMap<String, Vec<u64>>,
}

impl StudyState {
    fn trial_mut(&mut self, id: u64) -> Result<&mut TrialRecord> {
        self.trials
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| controller_error(format!("unknown trial {id}")))
    }

    fn running_trial_mut(&mut self, id: u64) -> Result<&mut TrialRecord> {
        let trial = self.trial_mut(id)?;
        if trial.status != TrialStatus::Running {
            return Err(controller_error(format!(
                "trial {id} is already {:?}",
                trial.status
            )));
        }
        Ok(trial)
    }
}

fn controller_error(message: impl Into<String>) -> trialkeep_core::TrialkeepError {
    TrialError::Controller {
        message: message.into(),
    }
    .into()
}

/// A study whose trials live in memory.
///
/// Clones share state, so one study can serve several in-process workers.
#[derive(Debug, Clone)]
pub struct LocalStudy {
    state: Arc<Mutex<StudyState>>,
}

impl LocalStudy {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StudyState {
                study_id: uuid::Uuid::new_v4().to_string(),
                name: name.map(str::to_string),
                trials: Vec::new(),
                groups: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StudyState>> {
        self.state
            .lock()
            .map_err(|_| controller_error("study state poisoned"))
    }

    pub fn id(&self) -> Result<String> {
        Ok(self.lock()?.study_id.clone())
    }

    pub fn trials(&self) -> Result<Vec<TrialRecord>> {
        Ok(self.lock()?.trials.clone())
    }

    pub fn trial(&self, id: u64) -> Result<Option<TrialRecord>> {
        Ok(self.lock()?.trials.iter().find(|t| t.id == id).cloned())
    }

    /// Completed trial with the highest final reward.
    pub fn best_trial(&self) -> Result<Option<TrialRecord>> {
        Ok(self
            .lock()?
            .trials
            .iter()
            .filter(|t| t.status == TrialStatus::Completed)
            .filter_map(|t| Some((t, t.final_reward().filter(|r| !r.is_nan())?)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(t, _)| t.clone()))
    }

    /// Ask the trial to stop at its next early-stopping check.
    pub fn request_early_stop(&self, id: u64) -> Result<()> {
        self.lock()?.trial_mut(id)?.stop_requested = true;
        Ok(())
    }

    /// Write the study as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.lock()?;
        atomic_write_json(path, &*state)?;
        tracing::debug!(path = %path.display(), trials = state.trials.len(), "Saved study");
        Ok(())
    }

    fn next_trial(&self, seq: usize, request: &mut SampleRequest<'_>) -> Result<Option<(u64, Dna)>> {
        let mut state = self.lock()?;

        if let Some(group) = request.group {
            let assigned = state.groups.get(group).and_then(|ids| ids.get(seq).copied());
            if let Some(id) = assigned {
                let dna = state.trial_mut(id)?.dna.clone();
                return Ok(Some((id, dna)));
            }
            if request.max_trials.is_some_and(|max| seq >= max) {
                return Ok(None);
            }
        } else if request.max_trials.is_some_and(|max| state.trials.len() >= max) {
            return Ok(None);
        }

        let dna = request.algorithm.propose(request.space)?;
        dna.validate(request.space)?;
        let id = state.trials.len() as u64 + 1;
        state.trials.push(TrialRecord {
            id,
            dna: dna.clone(),
            status: TrialStatus::Running,
            skip_reason: None,
            measurements: Vec::new(),
            group: request.group.map(str::to_string),
            stop_requested: false,
            created_at: Utc::now(),
            completed_at: None,
        });
        if let Some(group) = request.group {
            state.groups.entry(group.to_string()).or_default().push(id);
        }
        tracing::debug!(trial_id = id, dna = %dna, group = ?request.group, "Created trial");
        Ok(Some((id, dna)))
    }
}

impl SearchController for LocalStudy {
    fn sample<'a>(&'a mut self, request: SampleRequest<'a>) -> Result<FeedbackIter<'a>> {
        Ok(Box::new(LocalSampler {
            study: self.clone(),
            request,
            seq: 0,
        }))
    }
}

struct LocalSampler<'a> {
    study: LocalStudy,
    request: SampleRequest<'a>,
    seq: usize,
}

impl<'a> Iterator for LocalSampler<'a> {
    type Item = Result<Box<dyn Feedback + 'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.study.next_trial(self.seq, &mut self.request) {
            Ok(Some((id, dna))) => {
                self.seq += 1;
                let feedback: Box<dyn Feedback + 'a> = Box::new(LocalFeedback {
                    study: self.study.clone(),
                    id,
                    dna,
                });
                Some(Ok(feedback))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

struct LocalFeedback {
    study: LocalStudy,
    id: u64,
    dna: Dna,
}

impl Feedback for LocalFeedback {
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
        let mut state = self.study.lock()?;
        state.running_trial_mut(self.id)?.measurements.push(Measurement {
            step,
            reward,
            metrics,
            checkpoint_path,
        });
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        let mut state = self.study.lock()?;
        let trial = state.running_trial_mut(self.id)?;
        trial.status = TrialStatus::Completed;
        trial.completed_at = Some(Utc::now());
        tracing::info!(trial_id = self.id, reward = ?trial.final_reward(), "Trial completed");
        Ok(())
    }

    fn skip(&mut self, reason: &str) -> Result<()> {
        let mut state = self.study.lock()?;
        let trial = state.running_trial_mut(self.id)?;
        trial.status = TrialStatus::Skipped;
        trial.skip_reason = Some(reason.to_string());
        trial.completed_at = Some(Utc::now());
        tracing::info!(trial_id = self.id, reason, "Trial skipped");
        Ok(())
    }

    fn should_stop_early(&self) -> bool {
        self.study
            .lock()
            .ok()
            .and_then(|s| s.trials.iter().find(|t| t.id == self.id).map(|t| t.stop_requested))
            .unwrap_or(false)
    }

    fn measurements(&self) -> Vec<Measurement> {
        self.study
            .lock()
            .ok()
            .and_then(|s| s.trials.iter().find(|t| t.id == self.id).map(|t| t.measurements.clone()))
            .unwrap_or_default()
    }
}

/// Uniform random sampling with a fixed seed.
pub struct RandomSearch {
    seed: u64,
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SearchAlgorithm for RandomSearch {
    fn describe(&self) -> String {
        format!("RandomSearch(seed={})", self.seed)
    }

    fn propose(&mut self, space: &DnaSpec) -> Result<Dna> {
        let decisions = space
            .decision_points()
            .iter()
            .map(|dp| match dp {
                DecisionPoint::Choices { literal_values, .. } => {
                    Decision::Choice(self.rng.gen_range(0..literal_values.len()))
                }
                DecisionPoint::Float { min, max, .. } if min == max => Decision::Float(*min),
                DecisionPoint::Float { min, max, .. } => {
                    Decision::Float(self.rng.gen_range(*min..=*max))
                }
                DecisionPoint::Custom { .. } => {
                    Decision::Custom(format!("{:016x}", self.rng.gen_range(0..u64::MAX)))
                }
            })
            .collect();
        Ok(Dna::new(decisions))
    }
}
