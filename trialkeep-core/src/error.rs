//! Error types for trialkeep.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering configuration, checkpoint retention, trial execution, and
//! process-group coordination.

use std::path::PathBuf;

/// Top-level error type for trialkeep.
#[derive(Debug, thiserror::Error)]
pub enum TrialkeepError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Distributed error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors caused by a setup mistake. These are never recovered from.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Must specify checkpoint type")]
    MissingCheckpointType,

    #[error("Aborting tuning: there are no tunable parameters in experiment '{experiment}'")]
    ConstantSearchSpace { experiment: String },

    #[error("Could not find experiment '{name}'")]
    ExperimentNotFound { name: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Errors from the checkpoint retention controller.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Unrecognized item '{key}' is not currently supported")]
    UnsupportedItem { key: String },

    #[error("'{operation}' is not supported for {format} format checkpoints")]
    UnsupportedForFormat { operation: String, format: String },

    #[error("No checkpoint found for step {step}")]
    NotFound { step: u64 },

    #[error("No checkpoints under {root}")]
    Empty { root: PathBuf },

    #[error("Storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },
}

/// Errors raised while a trial is running.
#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("Reward is NaN at step {step}")]
    NanReward { step: u64 },

    #[error("{kind}: {message}")]
    Training { kind: String, message: String },

    #[error("Search controller error: {message}")]
    Controller { message: String },

    #[error("Invalid DNA: {message}")]
    InvalidDna { message: String },
}

impl TrialError {
    /// Kind name used when matching against a skip allowlist.
    pub fn kind(&self) -> &str {
        match self {
            Self::NanReward { .. } => "nan_reward",
            Self::Training { kind, .. } => kind,
            Self::Controller { .. } => "controller",
            Self::InvalidDna { .. } => "invalid_dna",
        }
    }

    /// Shorthand for a training failure of a given kind.
    pub fn training(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Training {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Errors from collective synchronization between processes.
#[derive(Debug, thiserror::Error)]
pub enum DistributedError {
    #[error("Barrier mismatch on process {process}: expected '{expected}', peers reached {observed:?}")]
    BarrierMismatch {
        process: usize,
        expected: String,
        observed: Vec<String>,
    },

    #[error("Process group state poisoned at barrier '{label}'")]
    Poisoned { label: String },
}

impl TrialkeepError {
    /// Returns the reason string when this error should turn the current trial
    /// into a skipped trial instead of aborting the tuning loop.
    ///
    /// NaN rewards are always skippable; training failures are skippable when
    /// their kind is listed in `errors_to_skip`.
    pub fn skip_reason(&self, errors_to_skip: &[String]) -> Option<String> {
        match self {
            Self::Trial(err @ TrialError::NanReward { .. }) => Some(err.to_string()),
            Self::Trial(err @ TrialError::Training { kind, .. })
                if errors_to_skip.iter().any(|k| k == kind) =>
            {
                Some(err.to_string())
            }
            _ => None,
        }
    }
}

/// Convenience result type for trialkeep operations.
pub type Result<T> = std::result::Result<T, TrialkeepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrialkeepError::Checkpoint(CheckpointError::UnsupportedItem {
            key: "metrics".into(),
        });
        assert_eq!(
            err.to_string(),
            "Checkpoint error: Unrecognized item 'metrics' is not currently supported"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TrialkeepError = io_err.into();
        assert!(matches!(err, TrialkeepError::Io(_)));
    }

    #[test]
    fn test_nan_reward_is_always_skippable() {
        let err: TrialkeepError = TrialError::NanReward { step: 12 }.into();
        let reason = err.skip_reason(&[]).unwrap();
        assert!(reason.contains("NaN"));
    }

    #[test]
    fn test_training_error_skippable_only_when_allowlisted() {
        let err: TrialkeepError = TrialError::training("out_of_memory", "HBM exhausted").into();
        assert!(err.skip_reason(&[]).is_none());
        let reason = err.skip_reason(&["out_of_memory".to_string()]).unwrap();
        assert_eq!(reason, "out_of_memory: HBM exhausted");
    }

    #[test]
    fn test_config_errors_never_skippable() {
        let err: TrialkeepError = ConfigError::MissingCheckpointType.into();
        assert!(err.skip_reason(&["config".to_string()]).is_none());
    }

    #[test]
    fn test_trial_error_kind() {
        assert_eq!(TrialError::NanReward { step: 0 }.kind(), "nan_reward");
        assert_eq!(TrialError::training("diverged", "loss exploded").kind(), "diverged");
    }
}
