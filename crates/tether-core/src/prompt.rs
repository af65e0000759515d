//! Prompt construction and refinement.
//!
//! All functions here are pure: the prompt for attempt k depends only on the
//! base prompt and the diagnostics of attempts 1..k.

use serde_json::Value;

use crate::agent::AgentConfig;
use crate::constraint::Violation;
use crate::criterion::EvaluationRecord;
use crate::history::{AttemptFailure, ExecutionAttempt};

/// Maximum characters kept by [`summarize_prompt`].
pub const PROMPT_SUMMARY_CHARS: usize = 80;

/// What went wrong in a previous attempt, fed into the next prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptDiagnostic {
    /// Output broke one or more output constraints
    OutputViolations {
        attempt: u32,
        violations: Vec<Violation>,
    },

    /// Output missed the quality bar
    BelowQualityBar {
        attempt: u32,
        overall_score: f64,
        records: Vec<EvaluationRecord>,
    },

    /// Generation or evaluation did not complete
    GenerationFailed { attempt: u32, message: String },
}

impl AttemptDiagnostic {
    /// Diagnostic for a failed attempt. `None` for accepted or cancelled attempts.
    pub fn from_attempt(attempt: &ExecutionAttempt) -> Option<Self> {
        let number = attempt.number;
        match attempt.failure.as_ref()? {
            AttemptFailure::OutputConstraintViolation { violations } => {
                Some(Self::OutputViolations {
                    attempt: number,
                    violations: violations.clone(),
                })
            }
            AttemptFailure::BelowQualityBar { overall_score } => Some(Self::BelowQualityBar {
                attempt: number,
                overall_score: *overall_score,
                records: attempt
                    .verdict
                    .as_ref()
                    .map(|v| v.records.clone())
                    .unwrap_or_default(),
            }),
            AttemptFailure::Cancelled => None,
            other => Some(Self::GenerationFailed {
                attempt: number,
                message: other.to_string(),
            }),
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            Self::OutputViolations { attempt, .. }
            | Self::BelowQualityBar { attempt, .. }
            | Self::GenerationFailed { attempt, .. } => *attempt,
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            Self::OutputViolations {
                attempt,
                violations,
            } => {
                out.push_str(&format!(
                    "Attempt {} broke these output constraints:\n",
                    attempt
                ));
                for v in violations {
                    out.push_str(&format!("- {}\n", v));
                }
            }
            Self::BelowQualityBar {
                attempt,
                overall_score,
                records,
            } => {
                out.push_str(&format!(
                    "Attempt {} scored {:.2}, below the quality bar:\n",
                    attempt, overall_score
                ));
                for record in records {
                    out.push_str(&format!(
                        "- {} ({:.2}): {}\n",
                        record.criterion, record.score, record.feedback
                    ));
                    for suggestion in &record.suggestions {
                        out.push_str(&format!("  - suggestion: {}\n", suggestion));
                    }
                }
            }
            Self::GenerationFailed { attempt, message } => {
                out.push_str(&format!("Attempt {} failed: {}\n", attempt, message));
            }
        }
    }
}

/// Build the task prompt for an agent and its input.
pub fn build_task_prompt(agent: &AgentConfig, input: &Value) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("Task description: {}\n\n", agent.description()));
    prompt.push_str(&format!("Input data: {}\n\n", render_input(input)));

    prompt.push_str("Output requirements:\n");
    for criterion in agent.criteria() {
        prompt.push_str(&format!("- {}\n", criterion.description()));
    }
    prompt.push('\n');
    prompt.push_str(
        "Produce an output for the input data that follows the task description and meets the requirements.\n",
    );

    let input_rules = agent.input_constraints().describe();
    if !input_rules.is_empty() {
        prompt.push_str("\nInput constraints:\n");
        for line in input_rules {
            prompt.push_str(&format!("- {}\n", line));
        }
    }

    let output_rules = agent.output_constraints().describe();
    if !output_rules.is_empty() {
        prompt.push_str("\nOutput constraints:\n");
        for line in output_rules {
            prompt.push_str(&format!("- {}\n", line));
        }
    }

    prompt
}

/// Extend the base prompt with what went wrong in earlier attempts.
///
/// With no diagnostics the base prompt is returned unchanged.
pub fn refine_prompt(base: &str, diagnostics: &[AttemptDiagnostic]) -> String {
    if diagnostics.is_empty() {
        return base.to_string();
    }

    let mut prompt = String::with_capacity(base.len() + 256 * diagnostics.len());
    prompt.push_str(base.trim_end());
    prompt.push_str("\n\n## Previous attempts\n\n");
    for diagnostic in diagnostics {
        diagnostic.render(&mut prompt);
        prompt.push('\n');
    }
    prompt.push_str("Write a new output that resolves every issue listed above.\n");
    prompt
}

/// Collapse whitespace and cut to [`PROMPT_SUMMARY_CHARS`] characters.
pub fn summarize_prompt(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= PROMPT_SUMMARY_CHARS {
        return collapsed;
    }
    let mut summary: String = collapsed.chars().take(PROMPT_SUMMARY_CHARS).collect();
    summary.push_str("...");
    summary
}

fn render_input(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
