//! Checkpoint retention controller.
//!
//! Decides at every training step whether a checkpoint is due, discovers the
//! checkpoints already on disk, and deletes or archives stale ones.
//!
//! One controller is created on every process of a distributed job and all
//! public methods may be called by all processes. Save decisions are pure
//! functions of the step and the locally known checkpoint list, so processes
//! agree without talking to each other. Only the coordinator (process 0)
//! touches the filesystem destructively, bracketed by labeled barriers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trialkeep_core::{
    CheckpointError, CheckpointFormat, ConfigError, PreemptionSignal, ProcessGroup, Result,
};

use super::policy::{CHECKPOINT_PREFIX, DEFAULT_ITEM_NAME, RetentionOptions, RetentionPolicy};
use super::storage::CheckpointStorage;
use crate::metrics::Metrics;

/// Metadata of one checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub step: u64,
    pub time: DateTime<Utc>,
    pub metrics: Option<Metrics>,
}

/// Retention engine parameterized by a policy and a storage engine.
pub struct RetentionController<S: CheckpointStorage> {
    root: PathBuf,
    policy: RetentionPolicy,
    storage: S,
    group: Arc<dyn ProcessGroup>,
    preemption: PreemptionSignal,
    checkpoints: Vec<CheckpointInfo>,
}

impl<S: CheckpointStorage> RetentionController<S> {
    /// Build a controller over `root`.
    ///
    /// Removes checkpoints left half-written by a crash, then loads the
    /// remaining ones. Fails when `format` is unspecified.
    pub fn new(
        root: impl Into<PathBuf>,
        format: CheckpointFormat,
        options: RetentionOptions,
        storage: S,
        group: Arc<dyn ProcessGroup>,
        preemption: PreemptionSignal,
    ) -> Result<Self> {
        if format == CheckpointFormat::Unspecified {
            return Err(ConfigError::MissingCheckpointType.into());
        }
        let root = root.into();
        storage.create_dir_all(&root)?;

        let mut controller = Self {
            root,
            policy: RetentionPolicy::new(format, options),
            storage,
            group,
            preemption,
            checkpoints: Vec::new(),
        };
        controller.cleanup_incomplete()?;
        controller.checkpoints = controller.discover_existing(&controller.root)?;

        tracing::info!(
            root = %controller.root.display(),
            format = %format,
            existing = controller.checkpoints.len(),
            latest = ?controller.latest_step(),
            "Checkpoint retention controller ready"
        );
        Ok(controller)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Known checkpoints, ascending by step.
    pub fn checkpoints(&self) -> &[CheckpointInfo] {
        &self.checkpoints
    }

    pub fn all_steps(&self) -> Vec<u64> {
        self.checkpoints.iter().map(|c| c.step).collect()
    }

    pub fn latest_step(&self) -> Option<u64> {
        self.checkpoints.last().map(|c| c.step)
    }

    /// Step of the best-scoring checkpoint when track-best mode is enabled.
    pub fn best_step(&self) -> Option<u64> {
        self.checkpoints
            .iter()
            .filter_map(|c| Some((c.step, self.policy.score(c.metrics.as_ref())?)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(step, _)| step)
    }

    pub fn checkpoint_name(&self, step: u64) -> String {
        self.policy.checkpoint_name(step)
    }

    /// Whether a checkpoint must be saved at `step`.
    ///
    /// True at the preemption sync point, when nothing was saved yet, or when
    /// `step` is past the last checkpoint and on the save interval. Saving at
    /// preemption keeps the regular cadence for later steps.
    pub fn should_save(&self, step: u64) -> bool {
        if self.preemption.reached_sync_point(step) {
            tracing::info!(step, "Saving on-demand checkpoint at preemption sync point");
            return true;
        }
        self.policy.on_cadence(step, self.latest_step())
    }

    /// Checkpoints present under `directory`, ascending by step.
    ///
    /// In track-best mode the metrics record of every checkpoint is loaded;
    /// a missing or unreadable record yields `None` for that entry.
    pub fn discover_existing(&self, directory: &Path) -> Result<Vec<CheckpointInfo>> {
        let mut steps: Vec<u64> = self
            .storage
            .list_entries(directory)?
            .iter()
            .filter_map(|name| self.policy.parse_step(name))
            .filter(|step| {
                self.storage
                    .is_dir(&directory.join(self.policy.checkpoint_name(*step)))
            })
            .collect();
        steps.sort_unstable();
        steps.dedup();

        let track_best = self.policy.options().track_best();
        let mut infos = Vec::with_capacity(steps.len());
        for step in steps {
            let path = directory.join(self.policy.checkpoint_name(step));
            let time = self.storage.modified(&path)?;
            let metrics = if track_best {
                match self.storage.load_metrics(&path) {
                    Ok(metrics) => metrics,
                    Err(e) => {
                        tracing::debug!(step, error = %e, "Unreadable checkpoint metrics");
                        None
                    }
                }
            } else {
                None
            };
            infos.push(CheckpointInfo {
                step,
                time,
                metrics,
            });
        }
        Ok(infos)
    }

    /// Directory where the item `key` of `step` is saved.
    ///
    /// Only the default item is checkpointable; it lives directly in the step
    /// directory.
    pub fn resolve_save_path(&self, step: u64, key: Option<&str>) -> Result<PathBuf> {
        match key {
            None | Some(DEFAULT_ITEM_NAME) => Ok(self.root.join(self.policy.checkpoint_name(step))),
            Some(other) => Err(CheckpointError::UnsupportedItem {
                key: other.to_string(),
            }
            .into()),
        }
    }

    /// Save `item` at `step` if a checkpoint is due, then apply retention.
    ///
    /// Returns whether a checkpoint was written.
    pub fn save(&mut self, step: u64, item: &S::Item, metrics: Option<Metrics>) -> Result<bool> {
        if !self.should_save(step) || self.checkpoints.iter().any(|c| c.step == step) {
            return Ok(false);
        }
        let dir = self.resolve_save_path(step, None)?;

        self.group
            .sync_global_devices(&format!("checkpoint save at step {step} started"))?;
        if self.group.is_coordinator() {
            self.storage.create_dir_all(&dir)?;
            self.storage.save(&dir, item)?;
            if let Some(m) = &metrics {
                self.storage.save_metrics(&dir, m)?;
            }
            self.storage.finalize(&dir)?;
        }
        self.group
            .sync_global_devices(&format!("checkpoint save at step {step} completed"))?;

        tracing::info!(step, path = %dir.display(), "Saved checkpoint");
        self.checkpoints.push(CheckpointInfo {
            step,
            time: Utc::now(),
            metrics,
        });
        self.prune()?;
        Ok(true)
    }

    /// Load the item saved at `step`, or at the latest step when `None`.
    ///
    /// Nothing to restore from an empty root is `Ok(None)`; an explicit step
    /// that is not a known checkpoint is an error.
    pub fn restore(&self, step: Option<u64>) -> Result<Option<S::Item>> {
        let step = match step {
            Some(step) if !self.checkpoints.iter().any(|c| c.step == step) => {
                return Err(CheckpointError::NotFound { step }.into());
            }
            Some(step) => step,
            None => match self.latest_step() {
                Some(latest) => latest,
                None => return Ok(None),
            },
        };
        self.storage.load(&self.resolve_save_path(step, None)?)
    }

    /// Delete the checkpoint at `step`.
    ///
    /// With `todelete_subdir` configured the directory is renamed into
    /// `<root>/<todelete_subdir>/` instead of being removed.
    pub fn delete(&mut self, step: u64) -> Result<()> {
        let name = self.policy.checkpoint_name(step);
        if self.group.is_coordinator() {
            let src = self.root.join(&name);
            match &self.policy.options().todelete_subdir {
                Some(subdir) => {
                    let rename_dir = self.root.join(subdir);
                    if !self.storage.exists(&rename_dir) {
                        self.storage.create_dir_all(&rename_dir)?;
                    }
                    // Destination is not conflict-checked.
                    let dst = rename_dir.join(&name);
                    self.storage.rename(&src, &dst)?;
                    tracing::info!(step, to = %dst.display(), "Moved checkpoint for deletion");
                }
                None => {
                    self.storage.remove_dir(&src)?;
                    tracing::info!(step, "Deleted checkpoint");
                }
            }
        }
        self.group
            .sync_global_devices(&format!("checkpoint delete at step {step}"))?;
        self.checkpoints.retain(|c| c.step != step);
        Ok(())
    }

    /// Remove checkpoint directories whose finalization marker is missing.
    ///
    /// Skipped on mock storage. Returns the number of incomplete directories
    /// found.
    pub fn cleanup_incomplete(&self) -> Result<usize> {
        if self.storage.is_mock() {
            tracing::debug!("Mock storage backend; skipping incomplete checkpoint cleanup");
            return Ok(0);
        }

        let tmp_dirs: Vec<PathBuf> = self
            .storage
            .list_entries(&self.root)?
            .into_iter()
            .filter(|name| name.starts_with(CHECKPOINT_PREFIX))
            .map(|name| self.root.join(name))
            .filter(|path| self.storage.is_dir(path) && !self.storage.is_finalized(path))
            .collect();

        if self.group.is_coordinator() {
            for dir in &tmp_dirs {
                tracing::warn!(path = %dir.display(), "Removing incomplete checkpoint");
                self.storage.remove_dir(dir)?;
            }
        }
        self.group.sync_global_devices("cleanup_tmp_dirs")?;
        Ok(tmp_dirs.len())
    }

    /// Structure of the latest checkpoint, as reported by the storage engine.
    pub fn structure(&self) -> Result<serde_json::Value> {
        if self.policy.format() == CheckpointFormat::Flat {
            return Err(CheckpointError::UnsupportedForFormat {
                operation: "structure".into(),
                format: self.policy.format().to_string(),
            }
            .into());
        }
        let step = self.latest_step().ok_or_else(|| CheckpointError::Empty {
            root: self.root.clone(),
        })?;
        self.storage.structure(&self.resolve_save_path(step, None)?)
    }

    /// Apply `max_to_keep` to the known checkpoints. Returns the evicted
    /// steps in eviction order.
    pub fn prune(&mut self) -> Result<Vec<u64>> {
        let Some(max_to_keep) = self.policy.options().max_to_keep else {
            return Ok(Vec::new());
        };
        let mut evicted = Vec::new();
        while self.checkpoints.len() > max_to_keep {
            let Some(index) = self.eviction_candidate() else {
                break;
            };
            let step = self.checkpoints[index].step;
            self.delete(step)?;
            evicted.push(step);
        }
        Ok(evicted)
    }

    /// Index of the next checkpoint to evict. The latest checkpoint is never
    /// a candidate.
    fn eviction_candidate(&self) -> Option<usize> {
        let candidates = self.checkpoints.len().checked_sub(1)?;
        if candidates == 0 {
            return None;
        }
        if !self.policy.options().track_best() {
            return Some(0);
        }
        // Unscored checkpoints go first, oldest first; then the worst score.
        (0..candidates).min_by(|&a, &b| {
            let score_a = self.policy.score(self.checkpoints[a].metrics.as_ref());
            let score_b = self.policy.score(self.checkpoints[b].metrics.as_ref());
            match (score_a, score_b) {
                (None, None) => a.cmp(&b),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => x.total_cmp(&y).then(a.cmp(&b)),
            }
        })
    }
}
