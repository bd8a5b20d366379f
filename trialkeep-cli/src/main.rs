//! trialkeep CLI: run tuning studies and manage checkpoint directories.

mod commands;
mod demo;
mod trainer;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// trialkeep: checkpoint retention and hyperparameter tuning for training jobs
#[derive(Parser, Debug)]
#[command(name = "trialkeep", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `.trialkeep/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a tuning study on a registered experiment
    Tune(TuneArgs),
    /// Inspect and maintain a checkpoint directory
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(clap::Args, Debug)]
struct TuneArgs {
    /// Experiment name (e.g. demo.synthetic.TinyLm)
    experiment: String,

    /// Study name
    #[arg(long)]
    study: Option<String>,

    /// Maximum number of trials (overrides the experiment's budget)
    #[arg(short = 'n', long)]
    max_trials: Option<usize>,

    /// Root directory for trial logs and checkpoints
    #[arg(long)]
    job_log_dir: Option<PathBuf>,

    /// Training steps per sub-experiment
    #[arg(long, default_value = "100")]
    num_train_steps: u64,

    /// Evaluate every N steps
    #[arg(long, default_value = "10")]
    eval_interval_steps: u64,

    /// Seed of the local search sampler
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
enum CheckpointAction {
    /// List checkpoints and whether they were finalized
    List {
        /// Checkpoint directory
        dir: PathBuf,
    },
    /// Remove checkpoints left half-written by a crash
    Cleanup {
        /// Checkpoint directory
        dir: PathBuf,
    },
    /// Keep only the N checkpoints retention would keep
    Prune {
        /// Checkpoint directory
        dir: PathBuf,
        /// Number of checkpoints to keep
        #[arg(short, long)]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = trialkeep_core::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    // Set up tracing: human-readable stderr + optional JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let (json_layer, _guard) = if config.logging.json_file {
        let log_dir = config
            .logging
            .log_dir
            .clone()
            .unwrap_or_else(trialkeep_core::config::default_log_dir);
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "trialkeep.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, &workspace, config).await
}
