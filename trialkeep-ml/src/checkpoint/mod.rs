//! Checkpoint retention: save cadence, discovery, crash recovery and pruning.

pub mod manager;
pub mod policy;
pub mod storage;

pub use manager::{CheckpointInfo, RetentionController};
pub use policy::{CHECKPOINT_PREFIX, DEFAULT_ITEM_NAME, RetentionOptions, RetentionPolicy};
pub use storage::{
    COMMIT_MARKER, CheckpointStorage, ITEM_FILE, InMemoryStorage, LocalFsStorage, METRICS_FILE,
    describe_structure,
};
