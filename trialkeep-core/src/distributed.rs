//! Process-group coordination.
//!
//! Workers of a distributed job share no memory and no lock service. They
//! coordinate through two rules: exactly one process (index 0) performs
//! destructive filesystem operations, and every process reaches the same
//! labeled barrier before and after such an operation.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::DistributedError;

/// Membership of the current process in a distributed job.
pub trait ProcessGroup: Send + Sync {
    /// Index of this process within the job.
    fn process_index(&self) -> usize;

    /// Number of processes in the job.
    fn process_count(&self) -> usize;

    /// Whether this process performs coordinator-only work.
    fn is_coordinator(&self) -> bool {
        self.process_index() == 0
    }

    /// Block until every process in the job has reached the barrier named `label`.
    fn sync_global_devices(&self, label: &str) -> Result<(), DistributedError>;
}

/// A job made of a single process. Barriers return immediately.
#[derive(Debug, Default)]
pub struct SingleProcess {
    labels: Mutex<Vec<String>>,
}

impl SingleProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels of every barrier reached so far, in order.
    pub fn barrier_labels(&self) -> Vec<String> {
        self.labels.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ProcessGroup for SingleProcess {
    fn process_index(&self) -> usize {
        0
    }

    fn process_count(&self) -> usize {
        1
    }

    fn sync_global_devices(&self, label: &str) -> Result<(), DistributedError> {
        tracing::trace!(label, "Barrier (single process)");
        self.labels
            .lock()
            .map_err(|_| DistributedError::Poisoned {
                label: label.to_string(),
            })?
            .push(label.to_string());
        Ok(())
    }
}

struct ThreadGroupShared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<String>>>,
}

/// One member of an in-process group where each member runs on its own thread.
///
/// Used to run several "processes" of a job inside one test binary. Every
/// barrier publishes its label; when members disagree on the label all of
/// them fail with [`DistributedError::BarrierMismatch`].
#[derive(Clone)]
pub struct ThreadGroup {
    index: usize,
    size: usize,
    shared: Arc<ThreadGroupShared>,
}

impl ThreadGroup {
    /// Create all `size` members of a group. Member `i` has process index `i`.
    pub fn new(size: usize) -> Vec<ThreadGroup> {
        let size = size.max(1);
        let shared = Arc::new(ThreadGroupShared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![None; size]),
        });
        (0..size)
            .map(|index| ThreadGroup {
                index,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("index", &self.index)
            .field("size", &self.size)
            .finish()
    }
}

impl ProcessGroup for ThreadGroup {
    fn process_index(&self) -> usize {
        self.index
    }

    fn process_count(&self) -> usize {
        self.size
    }

    fn sync_global_devices(&self, label: &str) -> Result<(), DistributedError> {
        let poisoned = || DistributedError::Poisoned {
            label: label.to_string(),
        };

        {
            let mut slots = self.shared.slots.lock().map_err(|_| poisoned())?;
            slots[self.index] = Some(label.to_string());
        }
        self.shared.barrier.wait();

        let observed: Vec<String> = {
            let slots = self.shared.slots.lock().map_err(|_| poisoned())?;
            slots.iter().map(|s| s.clone().unwrap_or_default()).collect()
        };
        // Nobody may overwrite a slot until every member has read them all.
        self.shared.barrier.wait();

        if observed.iter().any(|l| l != label) {
            tracing::error!(
                process = self.index,
                label,
                ?observed,
                "Mismatched barrier across processes"
            );
            return Err(DistributedError::BarrierMismatch {
                process: self.index,
                expected: label.to_string(),
                observed,
            });
        }
        tracing::trace!(process = self.index, label, "Barrier reached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_process_records_labels() {
        let group = SingleProcess::new();
        assert!(group.is_coordinator());
        assert_eq!(group.process_count(), 1);
        group.sync_global_devices("a").unwrap();
        group.sync_global_devices("b").unwrap();
        assert_eq!(group.barrier_labels(), vec!["a", "b"]);
    }

    #[test]
    fn test_thread_group_indices() {
        let members = ThreadGroup::new(3);
        let indices: Vec<usize> = members.iter().map(|m| m.process_index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(members[0].is_coordinator());
        assert!(!members[2].is_coordinator());
    }

    #[test]
    fn test_thread_group_matching_barriers() {
        let handles: Vec<_> = ThreadGroup::new(4)
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    member.sync_global_devices("first")?;
                    member.sync_global_devices("second")
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn test_thread_group_detects_mismatch() {
        let handles: Vec<_> = ThreadGroup::new(2)
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let label = if member.process_index() == 0 {
                        "cleanup_tmp_dirs"
                    } else {
                        "delete"
                    };
                    member.sync_global_devices(label)
                })
            })
            .collect();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err, DistributedError::BarrierMismatch { .. }));
        }
    }
}
