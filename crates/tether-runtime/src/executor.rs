//! The constrained execution loop.
//!
//! One call to [`ExecutionCore::execute`] validates the input once, then
//! runs up to `max_attempts` attempts of generate, validate output and
//! judge quality. Each attempt after the first is prompted with what went
//! wrong before. Every attempt is recorded in the returned history.
//!
//! # State machine
//! ```text
//! Idle -> InputValidating -> Generating -> OutputValidating -> QualityEvaluating
//!                 |               |               |                   |
//!               Failed         Retrying        Retrying        Accepted | Retrying
//! ```
//! `Retrying` loops back to `Generating` while budget remains, otherwise the
//! execution ends `Failed`.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

use tether_core::{
    build_task_prompt, refine_prompt, AgentConfig, AttemptDiagnostic, AttemptFailure,
    ConstraintCheck, ExecutionAttempt, ExecutionHistory, ExecutionOutcome, FailureKind,
    GenerationSummary, TokenUsage, Violation,
};

use crate::backends::{Backend, BackendError, GenerationRequest, SamplingParams};
use crate::evaluator::{CriterionEvaluator, EvaluationError};
use crate::selector::BackendSelector;
use crate::stats::{AgentStats, ExecutionStats};

/// States of one execution, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    InputValidating,
    Generating,
    OutputValidating,
    QualityEvaluating,
    Retrying,
    Accepted,
    Failed,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::InputValidating => "input_validating",
            ExecutionState::Generating => "generating",
            ExecutionState::OutputValidating => "output_validating",
            ExecutionState::QualityEvaluating => "quality_evaluating",
            ExecutionState::Retrying => "retrying",
            ExecutionState::Accepted => "accepted",
            ExecutionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn transition(attempt: u32, state: ExecutionState) {
    tracing::debug!(attempt, state = %state, "State transition");
}

/// Cancels an execution from another task.
///
/// Clones share the same signal. Cancelling aborts the in-flight backend
/// call; that attempt is recorded and the execution ends `Cancelled`.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
        }
    }

    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in self, so this only ends by cancellation
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// How one attempt ended.
enum AttemptStep {
    Accepted(String),
    Retry,
    /// Retry after the selector drops the active backend
    BackendLost,
    Cancelled,
}

/// Runs agents against the selected backend until accepted or out of budget.
pub struct ExecutionCore {
    selector: Arc<BackendSelector>,
    evaluator: CriterionEvaluator,
    stats: ExecutionStats,
}

impl ExecutionCore {
    pub fn new(selector: Arc<BackendSelector>) -> Self {
        Self {
            selector,
            evaluator: CriterionEvaluator::default(),
            stats: ExecutionStats::new(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: CriterionEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn selector(&self) -> &Arc<BackendSelector> {
        &self.selector
    }

    pub fn evaluator(&self) -> &CriterionEvaluator {
        &self.evaluator
    }

    /// Per-agent totals over every execution run by this core.
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Totals for one agent, if it has run on this core.
    pub fn agent_stats(&self, agent: &str) -> Option<AgentStats> {
        self.stats.agent(agent)
    }

    /// Execute `agent` on `input`.
    ///
    /// Never errors: every failure is a `Failed` outcome with its history.
    pub async fn execute(&self, agent: &AgentConfig, input: &Value) -> ExecutionOutcome {
        self.execute_with_cancel(agent, input, &CancelHandle::new())
            .await
    }

    /// [`execute`](Self::execute) that stops when `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        agent: &AgentConfig,
        input: &Value,
        cancel: &CancelHandle,
    ) -> ExecutionOutcome {
        let span = tracing::info_span!("execute", agent = %agent.name());
        let started = tokio::time::Instant::now();
        let outcome = self.run(agent, input, cancel).instrument(span).await;
        self.stats.record(agent.name(), &outcome, started.elapsed());

        match outcome.failure_kind() {
            None => tracing::info!(
                agent = %agent.name(),
                attempts = outcome.attempts(),
                "Execution accepted"
            ),
            Some(kind) => tracing::info!(
                agent = %agent.name(),
                attempts = outcome.attempts(),
                kind = %kind,
                "Execution failed"
            ),
        }
        outcome
    }

    async fn run(
        &self,
        agent: &AgentConfig,
        input: &Value,
        cancel: &CancelHandle,
    ) -> ExecutionOutcome {
        let mut history = ExecutionHistory::new(agent.name());
        transition(0, ExecutionState::Idle);

        transition(0, ExecutionState::InputValidating);
        let input_check = ConstraintCheck::from(agent.input_constraints().validate(input));
        let input_passed = input_check.passed;
        let input_detail = describe_violations("input rejected", &input_check.violations);
        history.record_input_check(input_check);
        if !input_passed {
            transition(0, ExecutionState::Failed);
            return ExecutionOutcome::failed(
                FailureKind::InputConstraintViolation,
                input_detail,
                history,
            );
        }

        let base_prompt = build_task_prompt(agent, input);
        let max_attempts = agent.max_attempts();

        for number in 1..=max_attempts {
            if cancel.is_cancelled() {
                return ExecutionOutcome::failed(
                    FailureKind::Cancelled,
                    format!("cancelled before attempt {}", number),
                    history,
                );
            }

            let diagnostics: Vec<AttemptDiagnostic> = history
                .attempts()
                .iter()
                .filter_map(AttemptDiagnostic::from_attempt)
                .collect();
            let prompt = refine_prompt(&base_prompt, &diagnostics);

            let lease = match self.selector.acquire().await {
                Ok(lease) => lease,
                Err(e) => {
                    transition(number, ExecutionState::Failed);
                    return ExecutionOutcome::failed(
                        FailureKind::NoBackendAvailable,
                        e.to_string(),
                        history,
                    );
                }
            };

            let mut attempt = ExecutionAttempt::begin(number, prompt);
            let step = self
                .run_attempt(&*lease, agent, &mut attempt, &mut history, cancel)
                .await;
            // The lease must be gone before invalidation takes the write lock
            drop(lease);

            let failure = attempt.failure.clone();
            history.push(attempt.finish());

            match step {
                AttemptStep::Accepted(output) => {
                    transition(number, ExecutionState::Accepted);
                    return ExecutionOutcome::accepted(output, history);
                }
                AttemptStep::Cancelled => {
                    transition(number, ExecutionState::Failed);
                    return ExecutionOutcome::failed(
                        FailureKind::Cancelled,
                        format!("cancelled during attempt {}", number),
                        history,
                    );
                }
                AttemptStep::BackendLost => self.selector.invalidate().await,
                AttemptStep::Retry => {}
            }

            if number < max_attempts {
                transition(number, ExecutionState::Retrying);
                if let Some(failure) = &failure {
                    tracing::warn!(attempt = number, failure = %failure, "Attempt failed, retrying");
                }
            }
        }

        transition(max_attempts, ExecutionState::Failed);
        let last_failure = history.last().and_then(|a| a.failure.clone());
        let kind = match last_failure {
            Some(AttemptFailure::OutputConstraintViolation { .. }) => {
                FailureKind::OutputConstraintViolation
            }
            _ => FailureKind::ExhaustedRetries,
        };
        let detail = match &last_failure {
            Some(failure) => format!("{} attempt(s) used; last: {}", max_attempts, failure),
            None => format!("{} attempt(s) used", max_attempts),
        };
        ExecutionOutcome::failed(kind, detail, history)
    }

    async fn run_attempt(
        &self,
        backend: &dyn Backend,
        agent: &AgentConfig,
        attempt: &mut ExecutionAttempt,
        history: &mut ExecutionHistory,
        cancel: &CancelHandle,
    ) -> AttemptStep {
        let number = attempt.number;
        transition(number, ExecutionState::Generating);

        let request = GenerationRequest::new(attempt.prompt.clone())
            .with_sampling(SamplingParams::for_agent(agent));
        let timeout = agent.timeout();

        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                attempt.failure = Some(AttemptFailure::Cancelled);
                return AttemptStep::Cancelled;
            }
            result = tokio::time::timeout(timeout, backend.generate(&request)) => result,
        };

        let result = match generated {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                let lost = matches!(error, BackendError::Unavailable(_));
                attempt.failure = Some(generation_failure(error));
                return if lost {
                    AttemptStep::BackendLost
                } else {
                    AttemptStep::Retry
                };
            }
            Err(_) => {
                attempt.failure = Some(AttemptFailure::Timeout {
                    after_ms: millis(timeout),
                });
                return AttemptStep::Retry;
            }
        };

        let usage = usage_or_estimate(result.usage, &attempt.prompt, &result.text, |text| {
            backend.estimate_tokens(text)
        });
        history.record_generation_usage(&usage);
        attempt.generation = Some(GenerationSummary {
            backend: backend.name().to_string(),
            model: if result.model.is_empty() {
                backend.model().to_string()
            } else {
                result.model.clone()
            },
            finish_reason: result.finish_reason,
            usage,
            output_chars: result.text.chars().count(),
        });
        let text = result.text;
        attempt.output = Some(text.clone());

        transition(number, ExecutionState::OutputValidating);
        let output_check =
            ConstraintCheck::from(agent.output_constraints().validate_text(&text));
        attempt.output_check = Some(output_check.clone());
        if !output_check.passed {
            attempt.failure = Some(AttemptFailure::OutputConstraintViolation {
                violations: output_check.violations,
            });
            return AttemptStep::Retry;
        }

        transition(number, ExecutionState::QualityEvaluating);
        let evaluation = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                attempt.failure = Some(AttemptFailure::Cancelled);
                return AttemptStep::Cancelled;
            }
            evaluation = self.evaluator.evaluate(backend, agent.criteria(), &text) => evaluation,
        };

        match evaluation {
            Ok(evaluation) => {
                for usage in &evaluation.judge_calls {
                    history.record_evaluation_usage(usage);
                }
                let verdict = evaluation.verdict;
                tracing::debug!(attempt = number, score = verdict.overall_score, "Verdict");
                let accepted = verdict.accepted;
                let overall_score = verdict.overall_score;
                attempt.verdict = Some(verdict);

                if accepted {
                    AttemptStep::Accepted(text)
                } else {
                    attempt.failure = Some(AttemptFailure::BelowQualityBar { overall_score });
                    AttemptStep::Retry
                }
            }
            Err(error) => {
                let lost = matches!(
                    error,
                    EvaluationError::Backend(BackendError::Unavailable(_))
                );
                attempt.failure = Some(AttemptFailure::EvaluationFailed {
                    message: error.to_string(),
                });
                if lost {
                    AttemptStep::BackendLost
                } else {
                    AttemptStep::Retry
                }
            }
        }
    }
}

impl fmt::Debug for ExecutionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionCore")
            .field("selector", &self.selector)
            .field("evaluator", self.evaluator.config())
            .finish()
    }
}

fn generation_failure(error: BackendError) -> AttemptFailure {
    match error {
        BackendError::Unavailable(message) => AttemptFailure::BackendUnavailable { message },
        BackendError::Timeout(after) => AttemptFailure::Timeout {
            after_ms: millis(after),
        },
        other => AttemptFailure::Generation {
            message: other.to_string(),
        },
    }
}

/// Servers that omit usage report zeros; fall back to the backend's estimate.
fn usage_or_estimate(
    reported: TokenUsage,
    prompt: &str,
    output: &str,
    estimate: impl Fn(&str) -> u32,
) -> TokenUsage {
    if reported.total() > 0 {
        return reported;
    }
    TokenUsage::new(estimate(prompt), estimate(output))
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn describe_violations(prefix: &str, violations: &[Violation]) -> String {
    let listed: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
    format!("{}: {}", prefix, listed.join("; "))
}
