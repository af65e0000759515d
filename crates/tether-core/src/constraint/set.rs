//! Ordered constraint collections with an evaluation policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::rule::{Constraint, ConstraintError, ConstraintSpec, Rule, Violation};

/// Whether validation stops at the first violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPolicy {
    /// Stop at the first violation (cheap, used for input)
    #[default]
    FailFast,

    /// Report every violation (full diagnostic, used for output)
    CollectAll,
}

/// An ordered sequence of constraints applied to one value.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    constraints: Vec<Constraint>,
    policy: EvaluationPolicy,
}

impl ConstraintSet {
    /// Create an empty set with the given policy.
    pub fn new(policy: EvaluationPolicy) -> Self {
        Self {
            constraints: Vec::new(),
            policy,
        }
    }

    /// Empty fail-fast set, the input default.
    pub fn input() -> Self {
        Self::new(EvaluationPolicy::FailFast)
    }

    /// Empty collect-all set, the output default.
    pub fn output() -> Self {
        Self::new(EvaluationPolicy::CollectAll)
    }

    /// Build from agent-file specs. The first bad spec fails the whole set.
    pub fn from_specs(
        specs: &[ConstraintSpec],
        policy: EvaluationPolicy,
    ) -> Result<Self, ConstraintError> {
        let constraints = specs
            .iter()
            .map(Constraint::from_spec)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            constraints,
            policy,
        })
    }

    /// Append a constraint.
    pub fn with(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn policy(&self) -> EvaluationPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    /// Validate a value.
    ///
    /// Returns `Err` with a non-empty, ordered list of violations. Under
    /// `FailFast` the list has exactly one entry.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();

        for constraint in &self.constraints {
            if let Err(violation) = constraint.check(value) {
                tracing::debug!(
                    constraint = constraint.name(),
                    message = %violation.message,
                    "Constraint violated"
                );
                violations.push(violation);
                if self.policy == EvaluationPolicy::FailFast {
                    break;
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Validate generated text.
    ///
    /// See [`ConstraintSet::coerce`] for how text becomes a value.
    pub fn validate_text(&self, text: &str) -> Result<(), Vec<Violation>> {
        self.validate(&self.coerce(text))
    }

    /// Turn generated text into the value the constraints are checked on.
    ///
    /// When any constraint asks for a structured kind (integer, float,
    /// boolean, array, object), a numeric range, or a member of an object,
    /// and the trimmed text parses as JSON, the parsed value is used.
    /// Otherwise the text is checked as a string.
    pub fn coerce(&self, text: &str) -> Value {
        let wants_structured = self.constraints.iter().any(|c| {
            c.field().is_some()
                || matches!(c.rule(), Rule::Range { .. })
                || matches!(c.rule(), Rule::Type(kind) if kind.is_structured())
        });

        if wants_structured {
            if let Ok(parsed) = serde_json::from_str::<Value>(text.trim()) {
                return parsed;
            }
        }
        Value::String(text.to_string())
    }

    /// One line per constraint, for prompt construction.
    pub fn describe(&self) -> Vec<String> {
        self.constraints.iter().map(Constraint::describe).collect()
    }
}
