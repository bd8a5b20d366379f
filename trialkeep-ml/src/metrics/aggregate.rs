//! Merging of train, eval and decode metric streams into one flat mapping.
//!
//! Keys are namespaced `<dataset_type>_<dataset_name>/<category>/<metric>`
//! for per-dataset metrics, `train/<metric>` for training metrics and
//! `eval_train/metrics/<metric>` for evaluation on the training split.

use serde::{Deserialize, Serialize};
use trialkeep_core::{ConfigError, Result};

use super::Metrics;

/// Insert every entry of `source` into `target`, prefixed with `prefix/` when given.
pub fn update_float_dict(target: &mut Metrics, source: &Metrics, prefix: Option<&str>) {
    for (key, value) in source {
        let key = match prefix {
            Some(p) => format!("{p}/{key}"),
            None => key.clone(),
        };
        target.insert(key, *value);
    }
}

/// Flatten one metric list produced by several named input datasets.
///
/// `None` entries mean the dataset was not evaluated at this step and are
/// skipped.
pub fn flatten_dataset_metrics(
    input_names: &[String],
    metrics_list: &[Option<Metrics>],
    dataset_type: Option<&str>,
    category: Option<&str>,
) -> Result<Metrics> {
    if input_names.len() != metrics_list.len() {
        return Err(ConfigError::Invalid {
            message: format!(
                "{} input datasets but {} metric entries",
                input_names.len(),
                metrics_list.len()
            ),
        }
        .into());
    }

    let mut merged = Metrics::new();
    for (name, metrics) in input_names.iter().zip(metrics_list) {
        let Some(metrics) = metrics else { continue };
        let mut prefix = match dataset_type {
            Some(t) => format!("{t}_{name}"),
            None => name.clone(),
        };
        if let Some(c) = category {
            prefix = format!("{prefix}/{c}");
        }
        update_float_dict(&mut merged, metrics, Some(&prefix));
    }
    Ok(merged)
}

/// Metrics from evaluation datasets at one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub input_names: Vec<String>,
    pub metrics_list: Option<Vec<Option<Metrics>>>,
    pub scoring_metrics_list: Option<Vec<Option<Metrics>>>,
    pub steps_per_sec: Option<f64>,
}

/// Metrics from decoding datasets at one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodeMetrics {
    pub input_names: Vec<String>,
    pub metrics_list: Option<Vec<Option<Metrics>>>,
    pub processed_metrics_list: Option<Vec<Option<Metrics>>>,
    pub seqio_metrics_list: Option<Vec<Option<Metrics>>>,
    pub steps_per_sec: Option<f64>,
}

/// Already-flattened metric families, merged in a fixed order.
#[derive(Debug, Clone, Default)]
pub struct MetricFamilies {
    pub train: Option<Metrics>,
    pub eval_train: Option<Metrics>,
    pub eval: Option<Metrics>,
    pub decode: Option<Metrics>,
    pub scalars: Metrics,
}

impl MetricFamilies {
    /// Merge train → eval-train → eval → decode → scalars. A later family
    /// overwrites an earlier one on the same key.
    pub fn merge(&self) -> Metrics {
        let mut merged = Metrics::new();
        for family in [&self.train, &self.eval_train, &self.eval, &self.decode]
            .into_iter()
            .flatten()
        {
            update_float_dict(&mut merged, family, None);
        }
        update_float_dict(&mut merged, &self.scalars, None);
        merged
    }
}

/// Everything the training loop knows about metrics at one step.
#[derive(Debug, Clone, Default)]
pub struct TuningMetricsInput {
    pub train_metrics: Option<Metrics>,
    pub eval_train_metrics: Option<Metrics>,
    pub eval_metrics: Option<EvalMetrics>,
    pub decode_metrics: Option<DecodeMetrics>,
    pub num_params: Option<f64>,
    pub train_steps_per_sec: Option<f64>,
}

fn flatten_optional(
    input_names: &[String],
    metrics_list: Option<&Vec<Option<Metrics>>>,
    dataset_type: Option<&str>,
    category: Option<&str>,
    into: &mut Metrics,
) -> Result<()> {
    if let Some(list) = metrics_list {
        let flat = flatten_dataset_metrics(input_names, list, dataset_type, category)?;
        update_float_dict(into, &flat, None);
    }
    Ok(())
}

/// Aggregate metrics from training, evaluation and decoding for tuning.
pub fn aggregate_metrics(input: &TuningMetricsInput) -> Result<Metrics> {
    let mut families = MetricFamilies::default();

    if let Some(train) = &input.train_metrics {
        let mut prefixed = Metrics::new();
        update_float_dict(&mut prefixed, train, Some("train"));
        families.train = Some(prefixed);
    }

    if let Some(eval_train) = &input.eval_train_metrics {
        let mut prefixed = Metrics::new();
        update_float_dict(&mut prefixed, eval_train, Some("eval_train/metrics"));
        families.eval_train = Some(prefixed);
    }

    if let Some(eval) = &input.eval_metrics {
        let mut flat = Metrics::new();
        flatten_optional(
            &eval.input_names,
            eval.metrics_list.as_ref(),
            Some("eval_test"),
            Some("metrics"),
            &mut flat,
        )?;
        flatten_optional(
            &eval.input_names,
            eval.scoring_metrics_list.as_ref(),
            Some("eval_test"),
            Some("scoring_eval"),
            &mut flat,
        )?;
        families.eval = Some(flat);
    }

    if let Some(decode) = &input.decode_metrics {
        let mut flat = Metrics::new();
        for list in [
            decode.metrics_list.as_ref(),
            decode.processed_metrics_list.as_ref(),
            decode.seqio_metrics_list.as_ref(),
        ] {
            flatten_optional(&decode.input_names, list, Some("decode_test"), None, &mut flat)?;
        }
        families.decode = Some(flat);
    }

    if let Some(v) = input.train_steps_per_sec {
        families.scalars.insert("train_steps_per_sec".into(), v);
    }
    if let Some(v) = input.eval_metrics.as_ref().and_then(|e| e.steps_per_sec) {
        families.scalars.insert("eval_steps_per_sec".into(), v);
    }
    if let Some(v) = input.decode_metrics.as_ref().and_then(|d| d.steps_per_sec) {
        families.scalars.insert("decode_steps_per_sec".into(), v);
    }
    if let Some(v) = input.num_params {
        families.scalars.insert("num_params".into(), v);
    }

    Ok(families.merge())
}
