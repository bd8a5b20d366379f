//! Synthetic experiments runnable with `trialkeep tune`.
//!
//! They are registered lazily under the `demo.synthetic` module: the first
//! lookup of a `demo.synthetic.*` name runs the module loader.

use std::sync::Arc;

use trialkeep_core::Result;
use trialkeep_ml::metrics::{AverageMetricValues, Metrics};
use trialkeep_ml::tuning::{
    DecisionPoint, DnaSpec, Experiment, ExperimentRegistry, RandomSearch, SearchSettings,
    SingleObjective, SubExperiment,
};

pub const MODULE: &str = "demo.synthetic";

pub const LEARNING_RATE: &str = "learning_rate";
pub const OPTIMIZER: &str = "optimizer";
pub const NUM_LAYERS: &str = "num_layers";

/// Name of the evaluation dataset reported by the simulated trainer.
pub const EVAL_SET: &str = "synthetic";
/// Flattened key of the evaluation accuracy.
pub const ACCURACY_KEY: &str = "eval_test_synthetic/metrics/accuracy";

/// Training error kind raised when the simulated loss blows up.
pub const DIVERGED: &str = "diverged";

pub fn registry(seed: u64) -> ExperimentRegistry {
    let mut registry = ExperimentRegistry::new();
    registry.register_loader(MODULE, move |r: &mut ExperimentRegistry| {
        r.register("demo.synthetic.TinyLm", move || Arc::new(TinyLm { seed }));
        r.register("demo.synthetic.PretrainFinetune", move || {
            Arc::new(PretrainFinetune { seed })
        });
    });
    registry
}

fn search_space() -> Result<DnaSpec> {
    DnaSpec::new(vec![
        DecisionPoint::float(LEARNING_RATE, 1e-4, 1e-1),
        DecisionPoint::choices(OPTIMIZER, vec!["'adam'".into(), "<class 'optax.sgd'>".into()]),
        DecisionPoint::choices(NUM_LAYERS, vec![2.into(), 4.into(), 8.into()]),
    ])
}

/// Single-phase language model stand-in.
#[derive(Debug)]
struct TinyLm {
    seed: u64,
}

impl Experiment for TinyLm {
    fn name(&self) -> &str {
        "demo.synthetic.TinyLm"
    }

    fn search_space(&self) -> Result<DnaSpec> {
        search_space()
    }

    fn search(&self) -> SearchSettings {
        SearchSettings {
            algorithm: Box::new(RandomSearch::new(self.seed)),
            reward: Arc::new(SingleObjective::maximize(ACCURACY_KEY)),
            cross_step_metric_aggregator: Some(Arc::new(AverageMetricValues::new(3))),
            max_num_trials: Some(8),
            errors_to_skip: vec![DIVERGED.to_string()],
        }
    }
}

/// Two phases sharing one set of decisions. The reward prefers the
/// fine-tuning accuracy once it has been reported.
#[derive(Debug)]
struct PretrainFinetune {
    seed: u64,
}

fn phase_accuracy(metrics: &Metrics, _step: u64) -> f64 {
    ["finetune", "pretrain"]
        .iter()
        .find_map(|phase| metrics.get(&format!("{ACCURACY_KEY}:{phase}")).copied())
        .unwrap_or(f64::NAN)
}

impl Experiment for PretrainFinetune {
    fn name(&self) -> &str {
        "demo.synthetic.PretrainFinetune"
    }

    fn search_space(&self) -> Result<DnaSpec> {
        search_space()
    }

    fn search(&self) -> SearchSettings {
        SearchSettings {
            algorithm: Box::new(RandomSearch::new(self.seed)),
            reward: Arc::new(phase_accuracy),
            cross_step_metric_aggregator: None,
            max_num_trials: Some(4),
            errors_to_skip: vec![DIVERGED.to_string()],
        }
    }

    fn sub_experiments(&self) -> Vec<SubExperiment> {
        let seed = self.seed;
        vec![
            SubExperiment::new("pretrain", Arc::new(TinyLm { seed })),
            SubExperiment::new("finetune", Arc::new(TinyLm { seed })),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_loads_demo_module() {
        let mut registry = registry(0);
        assert!(registry.names().is_empty());
        let experiment = registry.get("demo.synthetic.PretrainFinetune").unwrap();
        assert_eq!(experiment.sub_experiments().len(), 2);
        assert_eq!(registry.names().len(), 2);
        assert!(registry.get("demo.synthetic.Missing").is_err());
    }

    #[test]
    fn test_phase_accuracy_prefers_finetune() {
        let pretrain = format!("{ACCURACY_KEY}:pretrain");
        let finetune = format!("{ACCURACY_KEY}:finetune");
        let mut metrics: Metrics = [(pretrain, 0.4)].into_iter().collect();
        assert_eq!(phase_accuracy(&metrics, 0), 0.4);
        metrics.insert(finetune, 0.7);
        assert_eq!(phase_accuracy(&metrics, 0), 0.7);
        assert!(phase_accuracy(&Metrics::new(), 0).is_nan());
    }

    #[test]
    fn test_search_space_is_tunable() {
        let space = search_space().unwrap();
        assert!(!space.is_constant());
        assert_eq!(space.len(), 3);
    }
}
