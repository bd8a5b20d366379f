//! Preemption signal shared between the signal handler and the training loop.
//!
//! A preemption request is turned into a single agreed "sync point" step. At
//! that step the checkpoint controller saves regardless of cadence. In a
//! multi-process job the runtime that agrees on the step calls
//! [`PreemptionSignal::set_sync_point`] on every process; a local request
//! without an agreed step adopts the first step that asks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const NO_SYNC_POINT: u64 = u64::MAX;

#[derive(Debug)]
struct Inner {
    requested: AtomicBool,
    sync_step: AtomicU64,
}

/// Cheaply cloneable handle to a shared preemption flag.
#[derive(Debug, Clone)]
pub struct PreemptionSignal {
    inner: Arc<Inner>,
}

impl Default for PreemptionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl PreemptionSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                sync_step: AtomicU64::new(NO_SYNC_POINT),
            }),
        }
    }

    /// Record that the job is about to be preempted.
    pub fn request(&self) {
        if !self.inner.requested.swap(true, Ordering::SeqCst) {
            tracing::warn!("Preemption requested; checkpoint will be forced at the next sync point");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Fix the step all processes agreed to checkpoint at.
    pub fn set_sync_point(&self, step: u64) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.sync_step.store(step, Ordering::SeqCst);
    }

    /// The agreed sync step, if one has been fixed.
    pub fn sync_point(&self) -> Option<u64> {
        match self.inner.sync_step.load(Ordering::SeqCst) {
            NO_SYNC_POINT => None,
            step => Some(step),
        }
    }

    /// Whether `step` is the preemption sync point.
    pub fn reached_sync_point(&self, step: u64) -> bool {
        match self.sync_point() {
            Some(sync) => sync == step,
            None if self.is_requested() => self
                .inner
                .sync_step
                .compare_exchange(NO_SYNC_POINT, step, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_requested() {
        let signal = PreemptionSignal::new();
        assert!(!signal.reached_sync_point(0));
        assert!(!signal.reached_sync_point(100));
        assert_eq!(signal.sync_point(), None);
    }

    #[test]
    fn test_request_adopts_first_step() {
        let signal = PreemptionSignal::new();
        signal.request();
        assert!(signal.reached_sync_point(7));
        assert_eq!(signal.sync_point(), Some(7));
        assert!(!signal.reached_sync_point(8));
        assert!(signal.reached_sync_point(7));
    }

    #[test]
    fn test_agreed_sync_point() {
        let signal = PreemptionSignal::new();
        let clone = signal.clone();
        clone.set_sync_point(40);
        assert!(!signal.reached_sync_point(39));
        assert!(signal.reached_sync_point(40));
        assert!(signal.is_requested());
    }
}
