//! Agent definitions.
//!
//! An agent is a task description plus input/output constraint sets, quality
//! criteria and a retry budget. Agent files are YAML or JSON, validated
//! against an embedded JSON Schema before they are built.

mod parser;
mod schema;

pub use parser::{
    AgentConfig, AgentConfigBuilder, AgentSpec, ConfigError, Sampling, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_TIMEOUT,
};
pub use schema::validate_agent_schema;
