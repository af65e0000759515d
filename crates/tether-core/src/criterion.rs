//! Natural-language quality criteria and verdict aggregation.
//!
//! Aggregation uses a strict rule: the overall score is the weighted
//! minimum over criteria, and acceptance needs every criterion's weighted
//! score to clear its own bar. A perfect score on one criterion never hides
//! a failing one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default acceptance score when an agent file omits one.
pub const DEFAULT_MIN_SCORE: f64 = 0.8;

/// Errors from criterion construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CriterionError {
    #[error("Criterion name must not be empty")]
    EmptyName,

    #[error("Criterion '{0}': description must not be empty")]
    EmptyDescription(String),

    #[error("Criterion '{name}': min_score {value} is outside [0, 1]")]
    ScoreOutOfRange { name: String, value: f64 },

    #[error("Criterion '{name}': weight {value} is outside (0, 1]")]
    WeightOutOfRange { name: String, value: f64 },
}

/// A natural-language quality bar judged by a backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Criterion {
    name: String,
    description: String,
    min_score: f64,
    weight: f64,
}

impl Criterion {
    /// Create a criterion with weight 1.0.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        min_score: f64,
    ) -> Result<Self, CriterionError> {
        let name = name.into();
        let description = description.into();

        if name.trim().is_empty() {
            return Err(CriterionError::EmptyName);
        }
        if description.trim().is_empty() {
            return Err(CriterionError::EmptyDescription(name));
        }
        if !(0.0..=1.0).contains(&min_score) {
            return Err(CriterionError::ScoreOutOfRange {
                name,
                value: min_score,
            });
        }

        Ok(Self {
            name,
            description,
            min_score,
            weight: 1.0,
        })
    }

    /// Set the weight, in (0, 1].
    pub fn with_weight(mut self, weight: f64) -> Result<Self, CriterionError> {
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(CriterionError::WeightOutOfRange {
                name: self.name,
                value: weight,
            });
        }
        self.weight = weight;
        Ok(self)
    }

    /// Build from the serde form used in agent files.
    pub fn from_spec(spec: &CriterionSpec) -> Result<Self, CriterionError> {
        Self::new(&spec.name, &spec.description, spec.min_score)?.with_weight(spec.weight)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn min_score(&self) -> f64 {
        self.min_score
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Score after weighting.
    ///
    /// The weight scales the shortfall from a perfect score, so a weight of
    /// 1.0 leaves the score unchanged and smaller weights soften it.
    pub fn weighted(&self, score: f64) -> f64 {
        let score = score.clamp(0.0, 1.0);
        if self.weight == 1.0 {
            return score;
        }
        1.0 - self.weight * (1.0 - score)
    }

    /// Whether the weighted score meets this criterion's minimum.
    pub fn is_satisfied(&self, score: f64) -> bool {
        self.weighted(score) >= self.min_score
    }
}

/// Serde form of a criterion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionSpec {
    pub name: String,
    pub description: String,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_min_score() -> f64 {
    DEFAULT_MIN_SCORE
}

fn default_weight() -> f64 {
    1.0
}

/// One judgment of an output against a criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// Criterion that was judged
    pub criterion: String,

    /// Score in [0, 1]
    pub score: f64,

    /// Free-text feedback from the judge
    pub feedback: String,

    /// Concrete improvement suggestions
    #[serde(default)]
    pub suggestions: Vec<String>,

    /// False when the judge response could not be parsed (score is then 0)
    pub parsed: bool,

    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn new(
        criterion: impl Into<String>,
        score: f64,
        feedback: impl Into<String>,
        suggestions: Vec<String>,
    ) -> Self {
        Self {
            criterion: criterion.into(),
            score: score.clamp(0.0, 1.0),
            feedback: feedback.into(),
            suggestions,
            parsed: true,
            evaluated_at: Utc::now(),
        }
    }

    /// Record for a judgment that could not be parsed. Counts as score 0.
    pub fn unparseable(criterion: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            criterion: criterion.into(),
            score: 0.0,
            feedback: format!("Evaluation response could not be parsed: {}", reason.into()),
            suggestions: Vec::new(),
            parsed: false,
            evaluated_at: Utc::now(),
        }
    }
}

/// Combined judgment over all criteria of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    /// Weighted minimum over criteria
    pub overall_score: f64,

    /// Every weighted score met its criterion's minimum and every judgment parsed
    pub accepted: bool,

    /// Per-criterion records, in criterion order
    pub records: Vec<EvaluationRecord>,
}

impl QualityVerdict {
    /// Aggregate per-criterion records.
    ///
    /// `records[i]` must be the judgment for `criteria[i]`. Missing records
    /// count as failures.
    pub fn aggregate(criteria: &[Criterion], records: Vec<EvaluationRecord>) -> Self {
        if criteria.is_empty() || records.len() < criteria.len() {
            return Self {
                overall_score: 0.0,
                accepted: false,
                records,
            };
        }

        let overall_score = criteria
            .iter()
            .zip(&records)
            .map(|(criterion, record)| criterion.weighted(record.score))
            .fold(f64::INFINITY, f64::min)
            .clamp(0.0, 1.0);

        let accepted = criteria
            .iter()
            .zip(&records)
            .all(|(criterion, record)| record.parsed && criterion.is_satisfied(record.score));

        Self {
            overall_score,
            accepted,
            records,
        }
    }

    /// Records for criteria that were not met.
    pub fn failing<'a>(&'a self, criteria: &'a [Criterion]) -> Vec<&'a EvaluationRecord> {
        criteria
            .iter()
            .zip(&self.records)
            .filter(|(criterion, record)| !record.parsed || !criterion.is_satisfied(record.score))
            .map(|(_, record)| record)
            .collect()
    }
}
