//! Configuration system for trialkeep.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/trialkeep/config.toml` and/or
//! `.trialkeep/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrialkeepConfig {
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// On-disk layout of checkpoint directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    /// Not chosen yet; rejected when a controller is built.
    #[default]
    Unspecified,
    /// Simplified flat format: `checkpoint_<step>`, no structural introspection.
    Flat,
    /// Zero-padded persistence format: `checkpoint_<step:08>`.
    Persistence,
}

impl std::fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointFormat::Unspecified => write!(f, "unspecified"),
            CheckpointFormat::Flat => write!(f, "flat"),
            CheckpointFormat::Persistence => write!(f, "persistence"),
        }
    }
}

/// Whether a larger or a smaller metric value is better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricMode {
    #[default]
    Max,
    Min,
}

/// Metric used to rank checkpoints when retention keeps the best ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestMetric {
    pub name: String,
    #[serde(default)]
    pub mode: MetricMode,
}

/// Checkpoint retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory layout of checkpoints.
    #[serde(default)]
    pub format: CheckpointFormat,
    /// Save every N steps. Zero is treated as one.
    #[serde(default = "default_save_interval_steps")]
    pub save_interval_steps: u64,
    /// Keep at most this many checkpoints (all when unset).
    #[serde(default)]
    pub max_to_keep: Option<usize>,
    /// Rename checkpoints into this subdirectory instead of deleting them.
    #[serde(default)]
    pub todelete_subdir: Option<String>,
    /// Rank checkpoints by this metric when pruning.
    #[serde(default)]
    pub best_metric: Option<BestMetric>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            format: CheckpointFormat::default(),
            save_interval_steps: default_save_interval_steps(),
            max_to_keep: None,
            todelete_subdir: None,
            best_metric: None,
        }
    }
}

fn default_save_interval_steps() -> u64 {
    1
}

/// Hyperparameter tuning loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Root directory for per-trial logs and checkpoints.
    #[serde(default = "default_job_log_dir")]
    pub job_log_dir: PathBuf,
    /// Overrides the experiment's own trial budget when set.
    #[serde(default)]
    pub max_num_trials: Option<usize>,
    /// Processes sharing a tuner group work on the same trial.
    #[serde(default)]
    pub tuner_group: Option<String>,
    /// Study name.
    #[serde(default)]
    pub study: Option<String>,
    /// Only the metric-reporting role reports measurements and completion.
    #[serde(default = "default_true")]
    pub is_metric_reporting_role: bool,
    /// Training error kinds that skip the trial instead of aborting the loop.
    #[serde(default)]
    pub errors_to_skip: Vec<String>,
    /// Decision names are dropped from trial directories above this total length.
    #[serde(default = "default_dirname_length_threshold")]
    pub dirname_length_threshold: usize,
    /// Seed for the local search sampler.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            job_log_dir: default_job_log_dir(),
            max_num_trials: None,
            tuner_group: None,
            study: None,
            is_metric_reporting_role: true,
            errors_to_skip: Vec::new(),
            dirname_length_threshold: default_dirname_length_threshold(),
            seed: default_seed(),
        }
    }
}

fn default_job_log_dir() -> PathBuf {
    PathBuf::from("trialkeep-logs")
}

fn default_true() -> bool {
    true
}

fn default_dirname_length_threshold() -> usize {
    64
}

fn default_seed() -> u64 {
    42
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write JSON logs to a daily rolling file.
    #[serde(default = "default_true")]
    pub json_file: bool,
    /// Directory for log files (project data dir when unset).
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json_file: true,
            log_dir: None,
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TRIALKEEP_`)
/// 3. Workspace-local config (`.trialkeep/config.toml`)
/// 4. User config (`~/.config/trialkeep/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&TrialkeepConfig>,
) -> Result<TrialkeepConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TrialkeepConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "trialkeep", "trialkeep") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".trialkeep").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TRIALKEEP_CHECKPOINT__MAX_TO_KEEP, TRIALKEEP_TUNING__STUDY, etc.
    figment = figment.merge(Env::prefixed("TRIALKEEP_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Default directory for log files.
pub fn default_log_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "trialkeep", "trialkeep")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrialkeepConfig::default();
        assert_eq!(config.checkpoint.format, CheckpointFormat::Unspecified);
        assert_eq!(config.checkpoint.save_interval_steps, 1);
        assert!(config.checkpoint.max_to_keep.is_none());
        assert!(config.tuning.is_metric_reporting_role);
        assert_eq!(config.tuning.dirname_length_threshold, 64);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = TrialkeepConfig::default();
        config.checkpoint.format = CheckpointFormat::Persistence;
        config.checkpoint.todelete_subdir = Some("archive".into());
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: TrialkeepConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.checkpoint.format, CheckpointFormat::Persistence);
        assert_eq!(deserialized.checkpoint.todelete_subdir.as_deref(), Some("archive"));
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = TrialkeepConfig::default();
        overrides.checkpoint.save_interval_steps = 100;
        overrides.tuning.max_num_trials = Some(3);

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.checkpoint.save_interval_steps, 100);
        assert_eq!(config.tuning.max_num_trials, Some(3));
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".trialkeep");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            r#"
[checkpoint]
format = "flat"
max_to_keep = 3
todelete_subdir = "archive"

[checkpoint.best_metric]
name = "eval_test_dev/metrics/accuracy"
mode = "max"

[tuning]
errors_to_skip = ["out_of_memory"]
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.checkpoint.format, CheckpointFormat::Flat);
        assert_eq!(config.checkpoint.max_to_keep, Some(3));
        assert_eq!(
            config.checkpoint.best_metric.unwrap().name,
            "eval_test_dev/metrics/accuracy"
        );
        assert_eq!(config.tuning.errors_to_skip, vec!["out_of_memory"]);
    }

    #[test]
    fn test_checkpoint_format_display() {
        assert_eq!(CheckpointFormat::Flat.to_string(), "flat");
        assert_eq!(CheckpointFormat::Persistence.to_string(), "persistence");
    }
}
