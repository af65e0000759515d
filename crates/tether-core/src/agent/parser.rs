//! Agent parsing from YAML/JSON and programmatic construction.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::schema::validate_agent_schema;
use crate::constraint::{
    Constraint, ConstraintError, ConstraintSet, ConstraintSpec, EvaluationPolicy,
};
use crate::criterion::{Criterion, CriterionError, CriterionSpec};

/// Default attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when loading or building an agent.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read agent file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Agent does not match schema: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Invalid constraint: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("Invalid criterion: {0}")]
    Criterion(#[from] CriterionError),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Agent validation failed: {0}")]
    Invalid(String),
}

/// Sampling defaults applied to every generation of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stop: Vec::new(),
        }
    }
}

/// Serde form of an agent file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,

    pub description: String,

    #[serde(default)]
    pub input_constraints: Vec<ConstraintSpec>,

    #[serde(default)]
    pub output_constraints: Vec<ConstraintSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_policy: Option<EvaluationPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_policy: Option<EvaluationPolicy>,

    pub criteria: Vec<CriterionSpec>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_timeout", with = "crate::duration")]
    pub timeout: Duration,

    #[serde(default)]
    pub sampling: Sampling,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// A validated agent: what to do, what to accept, and how hard to try.
///
/// Construction checks everything up front, so a built `AgentConfig` always
/// has a name, at least one criterion, satisfiable constraints and
/// `max_attempts >= 1`.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    name: String,
    description: String,
    input_constraints: ConstraintSet,
    output_constraints: ConstraintSet,
    criteria: Vec<Criterion>,
    max_attempts: u32,
    timeout: Duration,
    sampling: Sampling,
}

impl AgentConfig {
    /// Start building an agent programmatically.
    pub fn builder(name: impl Into<String>) -> AgentConfigBuilder {
        AgentConfigBuilder::new(name)
    }

    /// Parse an agent from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let raw: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(raw)
    }

    /// Parse an agent from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(raw)
    }

    /// Parse an agent from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse an agent from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Schema-check a raw document, then build from it.
    pub fn from_value(raw: serde_json::Value) -> Result<Self, ConfigError> {
        validate_agent_schema(&raw).map_err(ConfigError::Schema)?;
        let spec: AgentSpec = serde_json::from_value(raw)?;
        Self::from_spec(&spec)
    }

    /// Build from the serde form.
    pub fn from_spec(spec: &AgentSpec) -> Result<Self, ConfigError> {
        let input_constraints = ConstraintSet::from_specs(
            &spec.input_constraints,
            spec.input_policy.unwrap_or(EvaluationPolicy::FailFast),
        )?;
        let output_constraints = ConstraintSet::from_specs(
            &spec.output_constraints,
            spec.output_policy.unwrap_or(EvaluationPolicy::CollectAll),
        )?;
        let criteria = spec
            .criteria
            .iter()
            .map(Criterion::from_spec)
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            input_constraints,
            output_constraints,
            criteria,
            max_attempts: spec.max_attempts,
            timeout: spec.timeout,
            sampling: spec.sampling.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name".to_string()));
        }
        if self.description.trim().is_empty() {
            return Err(ConfigError::MissingField("description".to_string()));
        }
        if self.criteria.is_empty() {
            return Err(ConfigError::MissingField("criteria".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be positive".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for criterion in &self.criteria {
            if !seen.insert(criterion.name()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate criterion name: {}",
                    criterion.name()
                )));
            }
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_constraints(&self) -> &ConstraintSet {
        &self.input_constraints
    }

    pub fn output_constraints(&self) -> &ConstraintSet {
        &self.output_constraints
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sampling(&self) -> &Sampling {
        &self.sampling
    }
}

/// Programmatic construction of an [`AgentConfig`].
///
/// ```rust,ignore
/// let agent = AgentConfig::builder("writer")
///     .description("Write a short article about the topic")
///     .input_constraint(Constraint::length("topic_length", Some(1), Some(50))?)
///     .criterion(Criterion::new("quality", "Detailed and accurate", 0.7)?)
///     .max_attempts(3)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct AgentConfigBuilder {
    name: String,
    description: String,
    input_constraints: ConstraintSet,
    output_constraints: ConstraintSet,
    criteria: Vec<Criterion>,
    max_attempts: u32,
    timeout: Duration,
    sampling: Sampling,
}

impl AgentConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_constraints: ConstraintSet::input(),
            output_constraints: ConstraintSet::output(),
            criteria: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_TIMEOUT,
            sampling: Sampling::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input_constraint(mut self, constraint: Constraint) -> Self {
        self.input_constraints = self.input_constraints.with(constraint);
        self
    }

    pub fn output_constraint(mut self, constraint: Constraint) -> Self {
        self.output_constraints = self.output_constraints.with(constraint);
        self
    }

    /// Replace the input set wholesale (keeps its policy).
    pub fn input_constraints(mut self, set: ConstraintSet) -> Self {
        self.input_constraints = set;
        self
    }

    /// Replace the output set wholesale (keeps its policy).
    pub fn output_constraints(mut self, set: ConstraintSet) -> Self {
        self.output_constraints = set;
        self
    }

    pub fn criterion(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        let config = AgentConfig {
            name: self.name,
            description: self.description,
            input_constraints: self.input_constraints,
            output_constraints: self.output_constraints,
            criteria: self.criteria,
            max_attempts: self.max_attempts,
            timeout: self.timeout,
            sampling: self.sampling,
        };
        config.validate()?;
        Ok(config)
    }
}
