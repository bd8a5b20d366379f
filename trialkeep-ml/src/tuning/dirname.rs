//! Human-readable trial directory names.
//!
//! A trial of id 123 with decisions `x`, `y` and `z` lands in
//! `<root>/123/x=1|y=abc|z=(0)`. `(0)` is the choice index, used when a
//! literal is not path friendly. When the decision names are too long in
//! total, only the values are kept: `<root>/123/1|abc|(0)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use trialkeep_core::Result;

use super::search_space::{Decision, DecisionPoint, Dna, DnaSpec, Literal};

/// Default cap on the summed length of decision names.
pub const DEFAULT_NAME_LENGTH_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecisionFormat {
    Empty,
    Value,
    Literal,
}

#[derive(Debug)]
pub struct TrialDirectoryNamer {
    root: PathBuf,
    spec: DnaSpec,
    formats: Vec<DecisionFormat>,
    include_decision_names: bool,
    formatted_categorical: HashMap<String, String>,
}

impl TrialDirectoryNamer {
    pub fn new(root: impl Into<PathBuf>, spec: &DnaSpec, name_length_threshold: usize) -> Self {
        let mut formatted_categorical = HashMap::new();
        let mut formats = Vec::with_capacity(spec.len());
        let mut total_name_len = 0;

        for dp in spec.decision_points() {
            let format = match dp {
                DecisionPoint::Custom { .. } => DecisionFormat::Empty,
                DecisionPoint::Choices { literal_values, .. } => {
                    let all_friendly = literal_values.iter().all(|v| {
                        let formatted = format_literal_cached(v, &mut formatted_categorical);
                        PATH_FRIENDLY.is_match(&formatted)
                    });
                    if all_friendly {
                        DecisionFormat::Literal
                    } else {
                        DecisionFormat::Value
                    }
                }
                DecisionPoint::Float { .. } => DecisionFormat::Value,
            };
            formats.push(format);
            total_name_len += dp.name().len();
        }

        Self {
            root: root.into(),
            spec: spec.clone(),
            formats,
            include_decision_names: total_name_len < name_length_threshold,
            formatted_categorical,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of trial `trial_id` with decisions `dna`.
    pub fn dirname(&self, trial_id: u64, dna: &Dna) -> Result<PathBuf> {
        dna.validate(&self.spec)?;

        let mut items = Vec::with_capacity(self.formats.len());
        for ((dp, format), decision) in self
            .spec
            .decision_points()
            .iter()
            .zip(&self.formats)
            .zip(&dna.decisions)
        {
            let value = match (format, dp, decision) {
                (DecisionFormat::Empty, _, _) => "(CUSTOM)".to_string(),
                (
                    DecisionFormat::Literal,
                    DecisionPoint::Choices { literal_values, .. },
                    Decision::Choice(i),
                ) => self.format_literal(&literal_values[*i]),
                (_, _, Decision::Float(v)) => format_float(*v),
                (_, _, Decision::Choice(i)) => format!("({i})"),
                (_, _, Decision::Custom(_)) => "(CUSTOM)".to_string(),
            };
            if self.include_decision_names {
                items.push(format!("{}={value}", dp.name()));
            } else {
                items.push(value);
            }
        }

        Ok(self.root.join(trial_id.to_string()).join(items.join("|")))
    }

    /// Format a literal value the way it appears in directory names.
    pub fn format_literal(&self, literal: &Literal) -> String {
        match literal {
            Literal::Str(s) => self
                .formatted_categorical
                .get(s)
                .cloned()
                .unwrap_or_else(|| format_categorical(s)),
            other => format_scalar(other),
        }
    }
}

static PATH_FRIENDLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-_.]+$").expect("valid path pattern"));

fn format_literal_cached(literal: &Literal, cache: &mut HashMap<String, String>) -> String {
    match literal {
        Literal::Str(s) => cache
            .entry(s.clone())
            .or_insert_with(|| format_categorical(s))
            .clone(),
        other => format_scalar(other),
    }
}

fn format_scalar(literal: &Literal) -> String {
    match literal {
        Literal::Int(v) => v.to_string(),
        Literal::Float(v) => format_float(*v),
        Literal::Str(s) => s.clone(),
    }
}

/// Three significant digits in scientific notation with a signed, two-digit
/// exponent: `1.000e-03`.
pub fn format_float(v: f64) -> String {
    let formatted = format!("{v:.3e}");
    let Some((mantissa, exponent)) = formatted.split_once('e') else {
        return formatted;
    };
    match exponent.parse::<i32>() {
        Ok(exp) => {
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        Err(_) => formatted,
    }
}

/// Strip surrounding single quotes and reduce `<class 'a.b.C'>` to `C`.
fn format_categorical(literal: &str) -> String {
    if literal.starts_with('\'') && literal.ends_with('\'') {
        // A lone quote opens and closes an empty value.
        return literal.get(1..literal.len() - 1).unwrap_or_default().to_string();
    }
    if let Some(qual_name) = literal
        .strip_prefix("<class '")
        .and_then(|rest| rest.strip_suffix("'>"))
        && !qual_name.is_empty()
    {
        return qual_name.rsplit('.').next().unwrap_or(qual_name).to_string();
    }
    literal.to_string()
}
