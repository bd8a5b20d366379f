//! Search space description and concrete decision assignments.
//!
//! A [`DnaSpec`] is the fixed list of decision points derived from an
//! experiment. A [`Dna`] assigns one value to every decision point.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use trialkeep_core::{ConfigError, Result, TrialError};

/// Candidate value of a categorical decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Literal::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(v) => Some(*v as f64),
            Literal::Float(v) => Some(*v),
            Literal::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Int(v)
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Float(v)
    }
}

impl From<&str> for Literal {
    fn from(v: &str) -> Self {
        Literal::Str(v.to_string())
    }
}

/// One tunable axis of a search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionPoint {
    /// Pick one of a fixed list of literals.
    Choices {
        name: String,
        literal_values: Vec<Literal>,
    },
    /// A float in `[min, max]`.
    Float { name: String, min: f64, max: f64 },
    /// An opaque value produced by a custom search algorithm.
    Custom { name: String },
}

impl DecisionPoint {
    pub fn choices(name: impl Into<String>, literal_values: Vec<Literal>) -> Self {
        DecisionPoint::Choices {
            name: name.into(),
            literal_values,
        }
    }

    pub fn float(name: impl Into<String>, min: f64, max: f64) -> Self {
        DecisionPoint::Float {
            name: name.into(),
            min,
            max,
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        DecisionPoint::Custom { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            DecisionPoint::Choices { name, .. }
            | DecisionPoint::Float { name, .. }
            | DecisionPoint::Custom { name } => name,
        }
    }

    /// Whether this axis admits exactly one value.
    pub fn is_constant(&self) -> bool {
        match self {
            DecisionPoint::Choices { literal_values, .. } => literal_values.len() == 1,
            DecisionPoint::Float { min, max, .. } => min == max,
            DecisionPoint::Custom { .. } => false,
        }
    }
}

impl fmt::Display for DecisionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionPoint::Choices {
                name,
                literal_values,
            } => {
                let values: Vec<String> = literal_values.iter().map(ToString::to_string).collect();
                write!(f, "{name}: oneof([{}])", values.join(", "))
            }
            DecisionPoint::Float { name, min, max } => {
                write!(f, "{name}: floatv(min={min:?}, max={max:?})")
            }
            DecisionPoint::Custom { name } => write!(f, "{name}: custom"),
        }
    }
}

/// The fixed set of decision points of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnaSpec {
    decision_points: Vec<DecisionPoint>,
}

impl DnaSpec {
    /// Validate and build a search space.
    ///
    /// Names must be unique and non-empty, choice lists non-empty and float
    /// ranges ordered.
    pub fn new(decision_points: Vec<DecisionPoint>) -> Result<Self> {
        let mut seen = HashSet::new();
        for dp in &decision_points {
            let name = dp.name();
            if name.is_empty() {
                return Err(invalid("decision point names must not be empty"));
            }
            if !seen.insert(name.to_string()) {
                return Err(invalid(format!("duplicate decision point '{name}'")));
            }
            match dp {
                DecisionPoint::Choices { literal_values, .. } if literal_values.is_empty() => {
                    return Err(invalid(format!("decision point '{name}' has no choices")));
                }
                DecisionPoint::Float { min, max, .. }
                    if min > max || min.is_nan() || max.is_nan() =>
                {
                    return Err(invalid(format!(
                        "decision point '{name}' has an empty range [{min}, {max}]"
                    )));
                }
                _ => {}
            }
        }
        Ok(Self { decision_points })
    }

    pub fn decision_points(&self) -> &[DecisionPoint] {
        &self.decision_points
    }

    pub fn len(&self) -> usize {
        self.decision_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decision_points.is_empty()
    }

    /// A constant space has nothing to tune.
    pub fn is_constant(&self) -> bool {
        self.decision_points.iter().all(DecisionPoint::is_constant)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.decision_points.iter().position(|dp| dp.name() == name)
    }
}

impl fmt::Display for DnaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DnaSpec(")?;
        for dp in &self.decision_points {
            writeln!(f, "  {dp},")?;
        }
        write!(f, ")")
    }
}

fn invalid(message: impl Into<String>) -> trialkeep_core::TrialkeepError {
    ConfigError::Invalid {
        message: message.into(),
    }
    .into()
}

/// Value chosen for one decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Index into the choice list.
    Choice(usize),
    Float(f64),
    Custom(String),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Choice(i) => write!(f, "{i}"),
            Decision::Float(v) => write!(f, "{v:?}"),
            Decision::Custom(s) => write!(f, "'{s}'"),
        }
    }
}

/// One concrete assignment of the decision points of a [`DnaSpec`], in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dna {
    pub decisions: Vec<Decision>,
}

impl Dna {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self { decisions }
    }

    /// Check that every decision fits its decision point.
    pub fn validate(&self, spec: &DnaSpec) -> std::result::Result<(), TrialError> {
        if self.decisions.len() != spec.len() {
            return Err(TrialError::InvalidDna {
                message: format!(
                    "{} decisions for {} decision points",
                    self.decisions.len(),
                    spec.len()
                ),
            });
        }
        for (dp, decision) in spec.decision_points().iter().zip(&self.decisions) {
            let fits = match (dp, decision) {
                (DecisionPoint::Choices { literal_values, .. }, Decision::Choice(i)) => {
                    *i < literal_values.len()
                }
                (DecisionPoint::Float { min, max, .. }, Decision::Float(v)) => {
                    *min <= *v && *v <= *max
                }
                (DecisionPoint::Custom { .. }, Decision::Custom(_)) => true,
                _ => false,
            };
            if !fits {
                return Err(TrialError::InvalidDna {
                    message: format!("decision {decision} does not fit '{}'", dp.name()),
                });
            }
        }
        Ok(())
    }

    /// Resolved value of every decision point, keyed by name.
    pub fn bindings(&self, spec: &DnaSpec) -> std::result::Result<BTreeMap<String, Literal>, TrialError> {
        self.validate(spec)?;
        let mut bound = BTreeMap::new();
        for (dp, decision) in spec.decision_points().iter().zip(&self.decisions) {
            let value = match (dp, decision) {
                (DecisionPoint::Choices { literal_values, .. }, Decision::Choice(i)) => {
                    literal_values[*i].clone()
                }
                (_, Decision::Float(v)) => Literal::Float(*v),
                (_, Decision::Custom(s)) => Literal::Str(s.clone()),
                (_, Decision::Choice(i)) => Literal::Int(*i as i64),
            };
            bound.insert(dp.name().to_string(), value);
        }
        Ok(bound)
    }
}

impl fmt::Display for Dna {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.decisions.iter().map(ToString::to_string).collect();
        write!(f, "DNA([{}])", parts.join(", "))
    }
}
