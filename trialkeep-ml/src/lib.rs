//! # trialkeep-ml
//!
//! Checkpoint retention and hyperparameter tuning for distributed training
//! jobs.
//!
//! - [`checkpoint`]: when to save, what to keep, crash recovery.
//! - [`metrics`]: flattening train, eval and decode metrics into one mapping.
//! - [`tuning`]: the trial loop, early stopping and search controller
//!   interfaces.

pub mod checkpoint;
pub mod metrics;
pub mod tuning;

pub use checkpoint::{CheckpointInfo, RetentionController, RetentionOptions, RetentionPolicy};
pub use metrics::Metrics;
pub use tuning::{Tuner, TunerOptions};
