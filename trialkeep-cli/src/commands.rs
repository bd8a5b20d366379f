//! CLI subcommand handlers.

use crate::CheckpointAction;
use crate::Commands;
use crate::ConfigAction;
use crate::TuneArgs;
use crate::trainer::SimulatedTrainer;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use trialkeep_core::{
    CheckpointFormat, PreemptionSignal, ProcessGroup, SingleProcess, TrialkeepConfig,
};
use trialkeep_ml::checkpoint::{
    CHECKPOINT_PREFIX, CheckpointStorage, LocalFsStorage, RetentionController, RetentionOptions,
    RetentionPolicy,
};
use trialkeep_ml::tuning::{LocalStudy, StudySummary, TrialOutcome, Tuner, TunerOptions};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config: TrialkeepConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, &config),
        Commands::Tune(args) => handle_tune(args, config).await,
        Commands::Checkpoints { action } => handle_checkpoints(action, &config),
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config: &TrialkeepConfig,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".trialkeep");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&TrialkeepConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}

async fn handle_tune(args: TuneArgs, mut config: TrialkeepConfig) -> anyhow::Result<()> {
    if let Some(study) = args.study {
        config.tuning.study = Some(study);
    }
    if args.max_trials.is_some() {
        config.tuning.max_num_trials = args.max_trials;
    }
    if let Some(dir) = args.job_log_dir {
        config.tuning.job_log_dir = dir;
    }
    if let Some(seed) = args.seed {
        config.tuning.seed = seed;
    }
    if config.checkpoint.format == CheckpointFormat::Unspecified {
        tracing::info!("No checkpoint format configured; trials use the persistence format");
        config.checkpoint.format = CheckpointFormat::Persistence;
    }

    let mut registry = crate::demo::registry(config.tuning.seed);
    let experiment = registry.get(&args.experiment)?;

    // Ctrl-C only requests preemption. The trainer saves at the agreed step
    // and fails the running trial with a "preempted" error.
    let preemption = PreemptionSignal::new();
    {
        let preemption = preemption.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                preemption.request();
            }
        });
    }

    let group: Arc<dyn ProcessGroup> = Arc::new(SingleProcess::new());
    let options = TunerOptions::from(&config.tuning);
    let study_path = options.job_log_dir.join("study.json");
    let study_name = config.tuning.study.clone();
    let mut trainer = SimulatedTrainer::new(
        &config.checkpoint,
        Arc::clone(&group),
        preemption,
        args.num_train_steps,
        args.eval_interval_steps,
    );

    // The tuning loop binds decisions to the calling thread, so it runs on a
    // single blocking thread from start to end.
    let (summary, study) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let tuner = Tuner::new(experiment, group, options);
        let mut study = LocalStudy::new(study_name.as_deref());
        let result = tuner.run(&mut study, &mut trainer);
        study.save(&study_path)?;
        Ok((result?, study))
    })
    .await??;

    print_summary(&summary);
    if let Some(best) = study.best_trial()? {
        println!(
            "Best trial: #{} reward={:.4} {}",
            best.id,
            best.final_reward().unwrap_or(f64::NAN),
            best.dna
        );
    }
    Ok(())
}

fn print_summary(summary: &StudySummary) {
    println!(
        "Study {} on {}: {} trial(s), {} completed, {} early stopped, {} skipped",
        summary.study.as_deref().unwrap_or("(unnamed)"),
        summary.experiment,
        summary.trials.len(),
        summary.completed(),
        summary.early_stopped(),
        summary.skipped()
    );
    for trial in &summary.trials {
        let outcome = match &trial.outcome {
            TrialOutcome::Completed => "completed".to_string(),
            TrialOutcome::EarlyStopped { step, .. } => format!("early stopped at step {step}"),
            TrialOutcome::Skipped { reason } => format!("skipped: {reason}"),
        };
        println!("  #{:<4} {:<24} {}", trial.trial_id, outcome, trial.trial_dir.display());
    }
}

type JsonStorage = LocalFsStorage<serde_json::Value>;

fn handle_checkpoints(action: CheckpointAction, config: &TrialkeepConfig) -> anyhow::Result<()> {
    let storage = JsonStorage::new();
    match action {
        CheckpointAction::List { dir } => {
            let format = resolve_format(&dir, config, &storage)?;
            let policy = RetentionPolicy::new(format, RetentionOptions::from(&config.checkpoint));
            let entries = scan(&dir, &policy, &storage)?;
            if entries.is_empty() {
                println!("No checkpoints under {}", dir.display());
                return Ok(());
            }
            println!("Checkpoints under {} ({} format):", dir.display(), format);
            for entry in &entries {
                let status = if entry.finalized { "ok" } else { "INCOMPLETE" };
                let metrics = storage
                    .load_metrics(&entry.path)
                    .ok()
                    .flatten()
                    .map(|m| serde_json::to_string(&m).unwrap_or_default())
                    .unwrap_or_default();
                println!("  {:>10}  {:<10}  {}", entry.step, status, metrics);
            }
            Ok(())
        }
        CheckpointAction::Cleanup { dir } => {
            let format = resolve_format(&dir, config, &storage)?;
            let incomplete = count_incomplete(&dir, &storage)?;
            let controller = open(&dir, format, RetentionOptions::from(&config.checkpoint))?;
            println!(
                "Removed {} incomplete checkpoint(s); {} remain",
                incomplete,
                controller.checkpoints().len()
            );
            Ok(())
        }
        CheckpointAction::Prune { dir, keep } => {
            let format = resolve_format(&dir, config, &storage)?;
            let options = RetentionOptions::from(&config.checkpoint).max_to_keep(keep);
            let mut controller = open(&dir, format, options)?;
            let evicted = controller.prune()?;
            if evicted.is_empty() {
                println!("Nothing to prune; {} checkpoint(s) kept", controller.checkpoints().len());
            } else {
                println!(
                    "Pruned steps {:?}; kept {:?}",
                    evicted,
                    controller.all_steps()
                );
            }
            Ok(())
        }
    }
}

fn open(
    dir: &Path,
    format: CheckpointFormat,
    options: RetentionOptions,
) -> anyhow::Result<RetentionController<JsonStorage>> {
    Ok(RetentionController::new(
        dir,
        format,
        options,
        JsonStorage::new(),
        Arc::new(SingleProcess::new()),
        PreemptionSignal::new(),
    )?)
}

#[derive(Debug)]
struct ScannedCheckpoint {
    step: u64,
    path: PathBuf,
    finalized: bool,
}

/// Checkpoints of `policy`'s format under `dir`, ascending by step. Unlike
/// opening a controller, scanning never removes anything.
fn scan(
    dir: &Path,
    policy: &RetentionPolicy,
    storage: &impl CheckpointStorage,
) -> anyhow::Result<Vec<ScannedCheckpoint>> {
    let mut entries: Vec<ScannedCheckpoint> = storage
        .list_entries(dir)?
        .into_iter()
        .filter_map(|name| {
            let step = policy.parse_step(&name)?;
            let path = dir.join(&name);
            storage.is_dir(&path).then(|| ScannedCheckpoint {
                step,
                finalized: storage.is_finalized(&path),
                path,
            })
        })
        .collect();
    entries.sort_by_key(|e| e.step);
    Ok(entries)
}

fn count_incomplete(dir: &Path, storage: &impl CheckpointStorage) -> anyhow::Result<usize> {
    Ok(storage
        .list_entries(dir)?
        .into_iter()
        .filter(|name| name.starts_with(CHECKPOINT_PREFIX))
        .map(|name| dir.join(name))
        .filter(|path| storage.is_dir(path) && !storage.is_finalized(path))
        .count())
}

/// The configured format, or the one whose names appear under `dir`.
fn resolve_format(
    dir: &Path,
    config: &TrialkeepConfig,
    storage: &impl CheckpointStorage,
) -> anyhow::Result<CheckpointFormat> {
    if config.checkpoint.format != CheckpointFormat::Unspecified {
        return Ok(config.checkpoint.format);
    }
    let persistence = RetentionPolicy::new(CheckpointFormat::Persistence, RetentionOptions::new());
    let names = storage.list_entries(dir)?;
    if names.iter().any(|n| persistence.parse_step(n).is_some()) {
        Ok(CheckpointFormat::Persistence)
    } else {
        Ok(CheckpointFormat::Flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn make_checkpoint(root: &Path, name: &str, finalized: bool) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("item.json"), "{}").unwrap();
        if finalized {
            std::fs::write(dir.join("commit_success.txt"), "ok").unwrap();
        }
    }

    #[test]
    fn test_resolve_format_from_names() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::new();
        let config = TrialkeepConfig::default();
        assert_eq!(
            resolve_format(dir.path(), &config, &storage).unwrap(),
            CheckpointFormat::Flat
        );

        make_checkpoint(dir.path(), "checkpoint_00000010", true);
        assert_eq!(
            resolve_format(dir.path(), &config, &storage).unwrap(),
            CheckpointFormat::Persistence
        );

        let mut configured = TrialkeepConfig::default();
        configured.checkpoint.format = CheckpointFormat::Flat;
        assert_eq!(
            resolve_format(dir.path(), &configured, &storage).unwrap(),
            CheckpointFormat::Flat
        );
    }

    #[test]
    fn test_scan_does_not_remove_incomplete() {
        let dir = TempDir::new().unwrap();
        make_checkpoint(dir.path(), "checkpoint_20", false);
        make_checkpoint(dir.path(), "checkpoint_3", true);
        std::fs::write(dir.path().join("checkpoint_4"), "not a directory").unwrap();

        let storage = JsonStorage::new();
        let policy = RetentionPolicy::new(CheckpointFormat::Flat, RetentionOptions::new());
        let entries = scan(dir.path(), &policy, &storage).unwrap();
        let summary: Vec<(u64, bool)> = entries.iter().map(|e| (e.step, e.finalized)).collect();
        assert_eq!(summary, vec![(3, true), (20, false)]);
        assert!(dir.path().join("checkpoint_20").exists());
        assert_eq!(count_incomplete(dir.path(), &storage).unwrap(), 1);
    }

    #[test]
    fn test_prune_through_cli_options() {
        let dir = TempDir::new().unwrap();
        for step in [1, 2, 3] {
            make_checkpoint(dir.path(), &format!("checkpoint_{step}"), true);
        }
        let mut controller = open(
            dir.path(),
            CheckpointFormat::Flat,
            RetentionOptions::new().max_to_keep(1),
        )
        .unwrap();
        assert_eq!(controller.prune().unwrap(), vec![1, 2]);
        assert!(!dir.path().join("checkpoint_2").exists());
    }
}
