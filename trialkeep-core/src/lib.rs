//! # trialkeep-core
//!
//! Shared plumbing for trialkeep: the error taxonomy, layered configuration,
//! atomic persistence helpers, and the process-group abstraction used to keep
//! the workers of a distributed training job in agreement.

pub mod config;
pub mod distributed;
pub mod error;
pub mod persistence;
pub mod preemption;

pub use config::{
    BestMetric, CheckpointConfig, CheckpointFormat, LoggingConfig, MetricMode, TrialkeepConfig,
    TuningConfig, load_config,
};
pub use distributed::{ProcessGroup, SingleProcess, ThreadGroup};
pub use error::{
    CheckpointError, ConfigError, DistributedError, Result, TrialError, TrialkeepError,
};
pub use preemption::PreemptionSignal;
