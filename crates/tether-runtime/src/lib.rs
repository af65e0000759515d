//! # tether-runtime
//!
//! Runs tether agents against real LLM backends.
//!
//! This crate connects the deterministic model in `tether-core` to
//! backends:
//! - [`backends`]: the [`Backend`] trait plus Ollama (local) and
//!   OpenAI-compatible (cloud) implementations
//! - [`BackendSelector`]: picks local or cloud and fails over
//! - [`CriterionEvaluator`]: LLM-judged quality scores
//! - [`ExecutionCore`]: the retrying generate/validate/judge loop, with
//!   per-agent [`ExecutionStats`]
//!
//! ## Important
//!
//! `execute` never returns an error. Every failure, including no backend
//! being reachable, is an [`ExecutionOutcome`](tether_core::ExecutionOutcome)
//! with `Failed` status and the history of what was tried.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_core::AgentConfig;
//! use tether_runtime::RuntimeConfig;
//!
//! let agent = AgentConfig::from_yaml_file("agent.yaml")?;
//! let core = RuntimeConfig::from_yaml_file("runtime.yaml")?.build_core()?;
//!
//! let outcome = core.execute(&agent, &serde_json::json!("AI in healthcare")).await;
//! println!("{}", outcome.to_json_pretty()?);
//! ```

pub mod backends;
pub mod config;
pub mod evaluator;
pub mod executor;
pub mod prompts;
pub mod selector;
pub mod stats;

pub use backends::{
    Backend, BackendError, BackendFactory, BackendKind, BackendRegistry, ChatMessage,
    GenerationRequest, GenerationResult, Role, SamplingParams, TextStream, ToolCall,
    ToolGeneration, ToolSpec,
};
pub use config::{BackendSection, RuntimeConfig, RuntimeConfigError};
pub use evaluator::{
    parse_judgment, CriterionEvaluator, Evaluation, EvaluationError, EvaluatorConfig, Judgment,
};
pub use executor::{CancelHandle, ExecutionCore, ExecutionState};
pub use selector::{
    next_step, BackendDescriptor, BackendLease, BackendSelector, LoadOutcome, LoadState,
    SelectionMode, SelectionStep, SelectorConfig, SelectorError,
};
pub use stats::{AgentStats, ExecutionStats};
