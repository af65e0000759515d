//! # tether-core
//!
//! Deterministic model for constrained LLM execution.
//!
//! This crate holds everything about an execution that does not talk to a
//! backend:
//! - what an agent is and how it is loaded from YAML/JSON
//! - how inputs and outputs are checked against constraints
//! - how per-criterion judgments combine into a verdict
//! - how the prompt is refined from earlier failures
//! - what gets recorded for every attempt
//!
//! ## Key Guarantees
//!
//! 1. **No I/O beyond reading agent files**: no network, no LLM calls
//! 2. **Eager validation**: unsatisfiable constraints and bad criteria fail at load time
//! 3. **Strict acceptance**: one failing criterion is never averaged away
//! 4. **Append-only history**: attempts are recorded in order and never rewritten
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_core::{AgentConfig, build_task_prompt};
//!
//! let agent = AgentConfig::from_yaml_file("agent.yaml")?;
//! let input = serde_json::json!("AI in healthcare");
//!
//! if let Err(violations) = agent.input_constraints().validate(&input) {
//!     for v in violations {
//!         eprintln!("{}", v);
//!     }
//! }
//! let prompt = build_task_prompt(&agent, &input);
//! ```

pub mod agent;
pub mod constraint;
pub mod criterion;
pub mod duration;
pub mod history;
pub mod outcome;
pub mod prompt;
pub mod usage;

// Re-export main types at crate root
pub use agent::{AgentConfig, AgentConfigBuilder, AgentSpec, ConfigError, Sampling};
pub use constraint::{
    Constraint, ConstraintError, ConstraintSet, ConstraintSpec, EvaluationPolicy, Rule, RuleSpec,
    ValueKind, Violation,
};
pub use criterion::{Criterion, CriterionError, CriterionSpec, EvaluationRecord, QualityVerdict};
pub use history::{
    AttemptFailure, ConstraintCheck, ExecutionAttempt, ExecutionHistory, FinishReason,
    GenerationSummary,
};
pub use outcome::{ExecutionOutcome, ExecutionStatus, FailureKind};
pub use prompt::{build_task_prompt, refine_prompt, summarize_prompt, AttemptDiagnostic};
pub use usage::{LlmUsage, TokenUsage};
