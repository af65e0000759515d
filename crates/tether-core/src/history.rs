//! Append-only record of an execution.
//!
//! Every attempt is kept in order with its prompt, generation summary,
//! constraint outcomes, quality verdict and failure cause. The history is the
//! audit trail serialized with the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constraint::Violation;
use crate::criterion::QualityVerdict;
use crate::prompt::summarize_prompt;
use crate::usage::{LlmUsage, TokenUsage};

/// Why a backend stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of output
    Completed,

    /// Hit the token limit
    LengthTruncated,

    /// Hit a caller-supplied stop sequence
    StoppedByCaller,

    /// Backend reported an error or refused (content filter)
    Error,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishReason::Completed => "completed",
            FinishReason::LengthTruncated => "length_truncated",
            FinishReason::StoppedByCaller => "stopped_by_caller",
            FinishReason::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a generation produced, without the text itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    /// Backend name that served the call
    pub backend: String,

    /// Model id reported by the backend
    pub model: String,

    pub finish_reason: FinishReason,

    pub usage: TokenUsage,

    /// Length of the generated text in characters
    pub output_chars: usize,
}

/// Outcome of one constraint-set validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintCheck {
    pub passed: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl ConstraintCheck {
    pub fn passed() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    pub fn failed(violations: Vec<Violation>) -> Self {
        Self {
            passed: false,
            violations,
        }
    }
}

impl From<Result<(), Vec<Violation>>> for ConstraintCheck {
    fn from(result: Result<(), Vec<Violation>>) -> Self {
        match result {
            Ok(()) => Self::passed(),
            Err(violations) => Self::failed(violations),
        }
    }
}

/// Why an attempt did not produce an accepted output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// The backend could not be reached mid-attempt
    BackendUnavailable { message: String },

    /// The backend returned an error for the generation
    Generation { message: String },

    /// The call exceeded the agent timeout
    Timeout { after_ms: u64 },

    /// Output failed one or more output constraints
    OutputConstraintViolation { violations: Vec<Violation> },

    /// Output passed constraints but missed the quality bar
    BelowQualityBar { overall_score: f64 },

    /// The judge could not be called
    EvaluationFailed { message: String },

    /// The caller cancelled the execution
    Cancelled,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::BackendUnavailable { message } => {
                write!(f, "backend unavailable: {}", message)
            }
            AttemptFailure::Generation { message } => write!(f, "generation failed: {}", message),
            AttemptFailure::Timeout { after_ms } => {
                write!(f, "generation timed out after {}ms", after_ms)
            }
            AttemptFailure::OutputConstraintViolation { violations } => {
                write!(f, "{} output constraint violation(s)", violations.len())
            }
            AttemptFailure::BelowQualityBar { overall_score } => {
                write!(f, "quality score {:.2} below the bar", overall_score)
            }
            AttemptFailure::EvaluationFailed { message } => {
                write!(f, "evaluation failed: {}", message)
            }
            AttemptFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One pass through generate, validate and evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// 1-based attempt number
    pub number: u32,

    /// Full prompt sent to the backend
    pub prompt: String,

    /// Short form of the prompt for logs and summaries
    pub prompt_summary: String,

    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationSummary>,

    /// Generated text, when generation succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_check: Option<ConstraintCheck>,

    /// Present only when the output passed its constraints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<QualityVerdict>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<AttemptFailure>,
}

impl ExecutionAttempt {
    /// Start an attempt now.
    pub fn begin(number: u32, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            number,
            prompt_summary: summarize_prompt(&prompt),
            prompt,
            started_at: Utc::now(),
            duration_ms: 0,
            generation: None,
            output: None,
            output_check: None,
            verdict: None,
            failure: None,
        }
    }

    /// Stamp the duration from `started_at` to now.
    pub fn finish(mut self) -> Self {
        let elapsed = Utc::now() - self.started_at;
        self.duration_ms = u64::try_from(elapsed.num_milliseconds()).unwrap_or(0);
        self
    }

    /// The attempt produced an output that was accepted.
    pub fn is_accepted(&self) -> bool {
        self.failure.is_none() && self.verdict.as_ref().is_some_and(|v| v.accepted)
    }
}

/// Ordered, append-only record of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    agent: String,
    started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input_check: Option<ConstraintCheck>,
    attempts: Vec<ExecutionAttempt>,
    usage: LlmUsage,
}

impl ExecutionHistory {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            started_at: Utc::now(),
            input_check: None,
            attempts: Vec::new(),
            usage: LlmUsage::default(),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Record the input validation outcome. Only the first call sticks.
    pub fn record_input_check(&mut self, check: ConstraintCheck) {
        if self.input_check.is_none() {
            self.input_check = Some(check);
        }
    }

    pub fn input_check(&self) -> Option<&ConstraintCheck> {
        self.input_check.as_ref()
    }

    /// Append an attempt.
    pub fn push(&mut self, attempt: ExecutionAttempt) {
        debug_assert_eq!(attempt.number as usize, self.attempts.len() + 1);
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[ExecutionAttempt] {
        &self.attempts
    }

    pub fn last(&self) -> Option<&ExecutionAttempt> {
        self.attempts.last()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn record_generation_usage(&mut self, usage: &TokenUsage) {
        self.usage.add_generation(usage);
    }

    pub fn record_evaluation_usage(&mut self, usage: &TokenUsage) {
        self.usage.add_evaluation(usage);
    }

    pub fn usage(&self) -> &LlmUsage {
        &self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn violation(name: &str) -> Violation {
        Violation {
            constraint: name.to_string(),
            message: "too short".to_string(),
        }
    }

    #[test]
    fn test_attempt_begin_summarizes_prompt() {
        let attempt = ExecutionAttempt::begin(1, "Write about AI in healthcare");
        assert_eq!(attempt.number, 1);
        assert_eq!(attempt.prompt_summary, "Write about AI in healthcare");
        assert!(!attempt.is_accepted());
    }

    #[test]
    fn test_history_is_append_only_in_order() {
        let mut history = ExecutionHistory::new("summarizer");
        assert!(history.is_empty());

        history.push(ExecutionAttempt::begin(1, "first").finish());
        history.push(ExecutionAttempt::begin(2, "second").finish());

        assert_eq!(history.len(), 2);
        let numbers: Vec<u32> = history.attempts().iter().map(|a| a.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(history.last().map(|a| a.prompt.as_str()), Some("second"));
    }

    #[test]
    fn test_input_check_recorded_once() {
        let mut history = ExecutionHistory::new("agent");
        history.record_input_check(ConstraintCheck::failed(vec![violation("topic")]));
        history.record_input_check(ConstraintCheck::passed());
        assert!(!history.input_check().unwrap().passed);
    }

    #[test]
    fn test_usage_accumulates() {
        let mut history = ExecutionHistory::new("agent");
        history.record_generation_usage(&TokenUsage::new(10, 20));
        history.record_evaluation_usage(&TokenUsage::new(5, 5));
        assert_eq!(history.usage().total_tokens, 40);
        assert_eq!(history.usage().generation_calls, 1);
        assert_eq!(history.usage().evaluation_calls, 1);
    }

    #[test]
    fn test_failure_serializes_with_cause_tag() {
        let failure = AttemptFailure::OutputConstraintViolation {
            violations: vec![violation("length")],
        };
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["cause"], json!("output_constraint_violation"));
        assert_eq!(value["violations"][0]["constraint"], json!("length"));

        let value = serde_json::to_value(AttemptFailure::Timeout { after_ms: 30_000 }).unwrap();
        assert_eq!(value, json!({"cause": "timeout", "after_ms": 30000}));
    }

    #[test]
    fn test_constraint_check_from_result() {
        assert!(ConstraintCheck::from(Ok(())).passed);
        let check = ConstraintCheck::from(Err(vec![violation("a"), violation("b")]));
        assert!(!check.passed);
        assert_eq!(check.violations.len(), 2);
    }

    #[test]
    fn test_failure_display() {
        let failure = AttemptFailure::BelowQualityBar { overall_score: 0.55 };
        assert_eq!(failure.to_string(), "quality score 0.55 below the bar");
    }
}
