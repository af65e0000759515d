//! Single named constraints and their serde form.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::patterns;

/// Configuration errors detected when a constraint is built.
///
/// These are never retried: an impossible constraint fails the same way
/// every time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("Constraint name must not be empty")]
    EmptyName,

    #[error("Constraint '{name}': minimum {min} is greater than maximum {max}")]
    InvertedBounds {
        name: String,
        min: String,
        max: String,
    },

    #[error("Constraint '{name}': bounds must be finite numbers")]
    NonFiniteBound { name: String },

    #[error("Constraint '{name}': at least one of min/max must be set")]
    Unbounded { name: String },

    #[error("Constraint '{name}': invalid pattern: {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("Constraint '{name}': allowed value set is empty")]
    EmptyAllowedSet { name: String },
}

/// One failed check, with a message meant for humans and for the next prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    /// Name of the constraint that failed
    pub constraint: String,

    /// Human-readable failure description
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.constraint, self.message)
    }
}

/// Kinds of values a `Type` rule can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    Url,
    Email,
    Phone,
}

impl ValueKind {
    /// Whether `value` is of this kind.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Float => value.is_number(),
            ValueKind::Boolean => value.is_boolean(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
            ValueKind::Url => value.as_str().is_some_and(patterns::is_url),
            ValueKind::Email => value.as_str().is_some_and(patterns::is_email),
            ValueKind::Phone => value.as_str().is_some_and(patterns::is_phone),
        }
    }

    /// Kinds that generated text has to be parsed as JSON to satisfy.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            ValueKind::Integer
                | ValueKind::Float
                | ValueKind::Boolean
                | ValueKind::Array
                | ValueKind::Object
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Boolean => "boolean",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Url => "url",
            ValueKind::Email => "email",
            ValueKind::Phone => "phone",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied check. `Err` carries the failure message.
pub type Predicate = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// The aspect of a value a constraint checks.
#[derive(Clone)]
pub enum Rule {
    /// Value must not be null
    Required,
    /// Value must be of the given kind
    Type(ValueKind),
    /// Character count (strings) or element count (arrays, objects)
    Length {
        min: Option<usize>,
        max: Option<usize>,
    },
    /// Numeric bounds, inclusive
    Range { min: Option<f64>, max: Option<f64> },
    /// Regex that must match somewhere in a string value
    Pattern(Regex),
    /// Value must equal one of these
    OneOf(Vec<Value>),
    /// Caller-supplied predicate
    Custom(Predicate),
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Required => write!(f, "Required"),
            Rule::Type(kind) => write!(f, "Type({})", kind),
            Rule::Length { min, max } => write!(f, "Length {{ min: {:?}, max: {:?} }}", min, max),
            Rule::Range { min, max } => write!(f, "Range {{ min: {:?}, max: {:?} }}", min, max),
            Rule::Pattern(re) => write!(f, "Pattern({})", re.as_str()),
            Rule::OneOf(values) => write!(f, "OneOf({:?})", values),
            Rule::Custom(_) => write!(f, "Custom(<predicate>)"),
        }
    }
}

static MISSING: Value = Value::Null;

/// A named validation rule.
///
/// Constraints are immutable once built. All configuration checks happen in
/// the constructors, so `check` only ever reports problems with the value.
///
/// A constraint with a `field` checks that member of an object value. A
/// missing member (or a value that is not an object) is checked as null.
#[derive(Debug, Clone)]
pub struct Constraint {
    name: String,
    rule: Rule,
    field: Option<String>,
    message: Option<String>,
}

impl Constraint {
    fn build(name: impl Into<String>, rule: Rule) -> Result<Self, ConstraintError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConstraintError::EmptyName);
        }
        Ok(Self {
            name,
            rule,
            field: None,
            message: None,
        })
    }

    /// Value must be present (not null).
    pub fn required(name: impl Into<String>) -> Result<Self, ConstraintError> {
        Self::build(name, Rule::Required)
    }

    /// Value must be of `kind`.
    pub fn of_type(name: impl Into<String>, kind: ValueKind) -> Result<Self, ConstraintError> {
        Self::build(name, Rule::Type(kind))
    }

    /// Length bounds, inclusive.
    pub fn length(
        name: impl Into<String>,
        min: Option<usize>,
        max: Option<usize>,
    ) -> Result<Self, ConstraintError> {
        let name = name.into();
        match (min, max) {
            (None, None) => return Err(ConstraintError::Unbounded { name }),
            (Some(lo), Some(hi)) if lo > hi => {
                return Err(ConstraintError::InvertedBounds {
                    name,
                    min: lo.to_string(),
                    max: hi.to_string(),
                })
            }
            _ => {}
        }
        Self::build(name, Rule::Length { min, max })
    }

    /// Numeric bounds, inclusive.
    pub fn range(
        name: impl Into<String>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Result<Self, ConstraintError> {
        let name = name.into();
        if min.is_some_and(|v| !v.is_finite()) || max.is_some_and(|v| !v.is_finite()) {
            return Err(ConstraintError::NonFiniteBound { name });
        }
        match (min, max) {
            (None, None) => return Err(ConstraintError::Unbounded { name }),
            (Some(lo), Some(hi)) if lo > hi => {
                return Err(ConstraintError::InvertedBounds {
                    name,
                    min: lo.to_string(),
                    max: hi.to_string(),
                })
            }
            _ => {}
        }
        Self::build(name, Rule::Range { min, max })
    }

    /// String values must match `pattern`. Use `^...$` to anchor.
    pub fn pattern(name: impl Into<String>, pattern: &str) -> Result<Self, ConstraintError> {
        let name = name.into();
        let re = Regex::new(pattern).map_err(|e| ConstraintError::InvalidPattern {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        Self::build(name, Rule::Pattern(re))
    }

    /// Value must be one of `values`.
    pub fn one_of(name: impl Into<String>, values: Vec<Value>) -> Result<Self, ConstraintError> {
        let name = name.into();
        if values.is_empty() {
            return Err(ConstraintError::EmptyAllowedSet { name });
        }
        Self::build(name, Rule::OneOf(values))
    }

    /// Caller-supplied predicate.
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Result<Self, ConstraintError>
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::build(name, Rule::Custom(Arc::new(predicate)))
    }

    /// Build from the serde form used in agent files.
    pub fn from_spec(spec: &ConstraintSpec) -> Result<Self, ConstraintError> {
        let constraint = match &spec.rule {
            RuleSpec::Required => Self::required(&spec.name),
            RuleSpec::Type { kind } => Self::of_type(&spec.name, *kind),
            RuleSpec::Length { min, max } => Self::length(&spec.name, *min, *max),
            RuleSpec::Range { min, max } => Self::range(&spec.name, *min, *max),
            RuleSpec::Pattern { pattern } => Self::pattern(&spec.name, pattern),
            RuleSpec::OneOf { values } => Self::one_of(&spec.name, values.clone()),
        }?;
        let constraint = match &spec.field {
            Some(field) => constraint.on_field(field.clone()),
            None => constraint,
        };
        Ok(match &spec.message {
            Some(message) => constraint.with_message(message.clone()),
            None => constraint,
        })
    }

    /// Check the named member of an object value instead of the whole value.
    pub fn on_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Replace the generated failure message with a fixed one.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    /// Check one value.
    pub fn check(&self, value: &Value) -> Result<(), Violation> {
        let target = match &self.field {
            Some(field) => value.get(field.as_str()).unwrap_or(&MISSING),
            None => value,
        };
        match self.failure(target) {
            None => Ok(()),
            Some(generated) => Err(Violation {
                constraint: self.name.clone(),
                message: self.message.clone().unwrap_or(generated),
            }),
        }
    }

    /// Short description of what the constraint requires, for prompts.
    pub fn describe(&self) -> String {
        let requirement = match &self.rule {
            Rule::Required => "required".to_string(),
            Rule::Type(kind) => format!("must be of type {}", kind),
            Rule::Length { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("length between {} and {}", lo, hi),
                (Some(lo), None) => format!("length at least {}", lo),
                (None, Some(hi)) => format!("length at most {}", hi),
                (None, None) => "any length".to_string(),
            },
            Rule::Range { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("value between {} and {}", lo, hi),
                (Some(lo), None) => format!("value at least {}", lo),
                (None, Some(hi)) => format!("value at most {}", hi),
                (None, None) => "any value".to_string(),
            },
            Rule::Pattern(re) => format!("must match pattern {}", re.as_str()),
            Rule::OneOf(values) => format!("one of: {}", join_values(values)),
            Rule::Custom(_) => "custom check".to_string(),
        };
        match &self.field {
            Some(field) => format!("{}: field '{}' {}", self.name, field, requirement),
            None => format!("{}: {}", self.name, requirement),
        }
    }

    fn failure(&self, value: &Value) -> Option<String> {
        if value.is_null() {
            return match &self.rule {
                Rule::Required => Some("value is required".to_string()),
                Rule::Type(kind) => Some(format!("expected {}, got null", kind)),
                _ => None,
            };
        }

        match &self.rule {
            Rule::Required => None,
            Rule::Type(kind) => {
                if kind.matches(value) {
                    None
                } else {
                    Some(format!("expected {}, got {}", kind, describe_kind(value)))
                }
            }
            Rule::Length { min, max } => {
                let length = value_length(value)?;
                if let Some(lo) = min {
                    if length < *lo {
                        return Some(format!(
                            "length {} is below the minimum of {}",
                            length, lo
                        ));
                    }
                }
                if let Some(hi) = max {
                    if length > *hi {
                        return Some(format!("length {} exceeds the maximum of {}", length, hi));
                    }
                }
                None
            }
            Rule::Range { min, max } => {
                let Some(number) = value.as_f64() else {
                    return Some(format!("expected a number, got {}", describe_kind(value)));
                };
                if let Some(lo) = min {
                    if number < *lo {
                        return Some(format!("value {} is below the minimum of {}", number, lo));
                    }
                }
                if let Some(hi) = max {
                    if number > *hi {
                        return Some(format!("value {} exceeds the maximum of {}", number, hi));
                    }
                }
                None
            }
            Rule::Pattern(re) => {
                let text = value.as_str()?;
                if re.is_match(text) {
                    None
                } else {
                    Some(format!("does not match pattern {}", re.as_str()))
                }
            }
            Rule::OneOf(values) => {
                if values.contains(value) {
                    None
                } else {
                    Some(format!("must be one of: {}", join_values(values)))
                }
            }
            Rule::Custom(predicate) => predicate(value).err(),
        }
    }
}

fn value_length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn describe_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Serde form of a constraint, as written in agent files.
///
/// ```yaml
/// - name: topic_length
///   rule: length
///   min: 1
///   max: 50
/// - name: count_range
///   field: count
///   rule: range
///   min: 1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstraintSpec {
    pub name: String,

    #[serde(flatten)]
    pub rule: RuleSpec,

    /// Object member to check instead of the whole value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    /// Optional fixed failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Serde form of a rule. Custom predicates have no file form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleSpec {
    Required,
    Type {
        kind: ValueKind,
    },
    Length {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Pattern {
        pattern: String,
    },
    OneOf {
        values: Vec<Value>,
    },
}
