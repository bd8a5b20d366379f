//! Scoped binding of trial decisions.
//!
//! Code that builds an experiment asks [`DecisionScope::decision`] for the
//! value of a decision point. The values come from the innermost scope
//! entered on the current thread; the scope is released when its guard is
//! dropped, including on early return and unwinding.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;

use super::search_space::{Dna, DnaSpec, Literal};
use trialkeep_core::Result;

thread_local! {
    static SCOPES: RefCell<Vec<BTreeMap<String, Literal>>> = const { RefCell::new(Vec::new()) };
}

/// Entry point for decision binding on the current thread.
pub struct DecisionScope;

impl DecisionScope {
    /// Bind the decisions of `dna` until the returned guard is dropped.
    pub fn enter(spec: &DnaSpec, dna: &Dna) -> Result<BindingGuard> {
        let bound = dna.bindings(spec)?;
        let depth = SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            scopes.push(bound);
            scopes.len()
        });
        tracing::trace!(depth, "Entered decision scope");
        Ok(BindingGuard {
            depth,
            _not_send: PhantomData,
        })
    }

    /// Value bound to `name` in the innermost scope.
    pub fn decision(name: &str) -> Option<Literal> {
        SCOPES.with(|scopes| scopes.borrow().last().and_then(|b| b.get(name).cloned()))
    }

    pub fn is_active() -> bool {
        Self::depth() > 0
    }

    pub fn depth() -> usize {
        SCOPES.with(|scopes| scopes.borrow().len())
    }
}

/// Releases its decision scope on drop.
#[must_use = "the scope is released as soon as the guard is dropped"]
pub struct BindingGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            debug_assert_eq!(scopes.len(), self.depth, "decision scopes released out of order");
            scopes.truncate(self.depth.saturating_sub(1));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::search_space::{Decision, DecisionPoint};

    fn spec() -> DnaSpec {
        DnaSpec::new(vec![
            DecisionPoint::choices("optimizer", vec!["adam".into(), "sgd".into()]),
            DecisionPoint::float("lr", 0.0, 1.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_scope_binds_and_releases() {
        let spec = spec();
        let dna = Dna::new(vec![Decision::Choice(1), Decision::Float(0.25)]);
        assert!(!DecisionScope::is_active());
        {
            let _guard = DecisionScope::enter(&spec, &dna).unwrap();
            assert_eq!(DecisionScope::decision("optimizer"), Some(Literal::Str("sgd".into())));
            assert_eq!(DecisionScope::decision("lr").and_then(|v| v.as_f64()), Some(0.25));
            assert_eq!(DecisionScope::decision("missing"), None);
        }
        assert!(!DecisionScope::is_active());
        assert_eq!(DecisionScope::decision("lr"), None);
    }

    #[test]
    fn test_nested_scopes_stack() {
        let spec = spec();
        let outer = Dna::new(vec![Decision::Choice(0), Decision::Float(0.1)]);
        let inner = Dna::new(vec![Decision::Choice(1), Decision::Float(0.9)]);
        let _outer = DecisionScope::enter(&spec, &outer).unwrap();
        {
            let _inner = DecisionScope::enter(&spec, &inner).unwrap();
            assert_eq!(DecisionScope::depth(), 2);
            assert_eq!(DecisionScope::decision("lr"), Some(Literal::Float(0.9)));
        }
        assert_eq!(DecisionScope::decision("lr"), Some(Literal::Float(0.1)));
    }

    #[test]
    fn test_scope_released_on_error_path() {
        fn failing(spec: &DnaSpec, dna: &Dna) -> Result<()> {
            let _guard = DecisionScope::enter(spec, dna)?;
            Err(trialkeep_core::TrialError::training("diverged", "loss exploded").into())
        }
        let spec = spec();
        let dna = Dna::new(vec![Decision::Choice(0), Decision::Float(0.5)]);
        assert!(failing(&spec, &dna).is_err());
        assert!(!DecisionScope::is_active());
    }

    #[test]
    fn test_invalid_dna_is_not_bound() {
        let spec = spec();
        let dna = Dna::new(vec![Decision::Choice(5), Decision::Float(0.5)]);
        assert!(DecisionScope::enter(&spec, &dna).is_err());
        assert!(!DecisionScope::is_active());
    }
}
