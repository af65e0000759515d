//! Constraint validation.
//!
//! Constraints are named rules over `serde_json::Value`. A `ConstraintSet`
//! applies them in order under a fail-fast or collect-all policy.

mod patterns;
mod rule;
mod set;

pub use patterns::{is_email, is_phone, is_url};
pub use rule::{Constraint, ConstraintError, ConstraintSpec, Predicate, Rule, RuleSpec, ValueKind, Violation};
pub use set::{ConstraintSet, EvaluationPolicy};
