//! Hyperparameter tuning: trial lifecycle, early stopping and the search
//! controller interfaces.

pub mod binding;
pub mod controller;
pub mod dirname;
pub mod early_stop;
pub mod experiment;
pub mod local;
pub mod registry;
pub mod reward;
pub mod search_space;
pub mod signal;
pub mod tuner;

pub use binding::{BindingGuard, DecisionScope};
pub use controller::{
    Feedback, FeedbackIter, Measurement, SampleRequest, SearchAlgorithm, SearchController,
    TrialRecord, TrialStatus,
};
pub use dirname::{DEFAULT_NAME_LENGTH_THRESHOLD, TrialDirectoryNamer};
pub use early_stop::{
    EarlyStopFn, EarlyStoppingCallback, RunningMode, is_last_checkpoint, should_early_stop,
};
pub use experiment::{Experiment, SearchSettings, SubExperiment};
pub use local::{LocalStudy, RandomSearch};
pub use registry::ExperimentRegistry;
pub use reward::{RewardFn, SingleObjective};
pub use search_space::{Decision, DecisionPoint, Dna, DnaSpec, Literal};
pub use signal::{SubExperimentRun, TrialRunner, TrialSignal};
pub use tuner::{
    SUB_EXPERIMENT_STEP_OFFSET, StudySummary, TrialOutcome, TrialReport, Tuner, TunerOptions,
    tuning_step,
};
