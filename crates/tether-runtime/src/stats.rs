//! Per-agent execution statistics.
//!
//! Aggregates survive across executions for the lifetime of an
//! [`ExecutionCore`](crate::ExecutionCore). They are kept in memory only.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tether_core::ExecutionOutcome;

/// Running totals for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    /// Executions finished, accepted or not
    pub total_executions: u64,

    /// Executions that ended accepted
    pub successful_executions: u64,

    /// Attempts over all executions
    pub total_attempts: u64,

    /// Executions that reached a quality verdict
    pub scored_executions: u64,

    /// Mean of the last verdict's overall score over scored executions
    pub average_score: f64,

    /// Mean wall-clock time per execution
    pub average_response_ms: f64,

    /// Generation and judge tokens
    pub total_tokens: u64,

    /// Failed executions by failure kind
    #[serde(default)]
    pub failures: BTreeMap<String, u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl AgentStats {
    /// Fold one finished execution into the totals.
    pub fn record(&mut self, outcome: &ExecutionOutcome, elapsed: Duration) {
        self.total_executions += 1;
        let n = self.total_executions as f64;

        match outcome.failure_kind() {
            None => self.successful_executions += 1,
            Some(kind) => *self.failures.entry(kind.to_string()).or_insert(0) += 1,
        }

        self.total_attempts += outcome.attempts() as u64;
        self.total_tokens += outcome.history.usage().total_tokens;

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.average_response_ms += (elapsed_ms - self.average_response_ms) / n;

        let last_score = outcome
            .history
            .attempts()
            .iter()
            .rev()
            .find_map(|a| a.verdict.as_ref().map(|v| v.overall_score));
        if let Some(score) = last_score {
            self.scored_executions += 1;
            let scored = self.scored_executions as f64;
            self.average_score += (score - self.average_score) / scored;
        }

        self.last_execution_at = Some(Utc::now());
    }

    /// Fraction of executions accepted, 0 when nothing ran.
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.successful_executions as f64 / self.total_executions as f64
    }

    pub fn average_tokens(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.total_tokens as f64 / self.total_executions as f64
    }
}

/// Statistics keyed by agent name.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    agents: RwLock<HashMap<String, AgentStats>>,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, agent: &str, outcome: &ExecutionOutcome, elapsed: Duration) {
        self.agents
            .write()
            .entry(agent.to_string())
            .or_default()
            .record(outcome, elapsed);
    }

    /// Totals for one agent, if it has run.
    pub fn agent(&self, agent: &str) -> Option<AgentStats> {
        self.agents.read().get(agent).cloned()
    }

    /// Totals for every agent, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, AgentStats> {
        self.agents
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect()
    }

    /// Forget one agent's totals.
    pub fn reset(&self, agent: &str) {
        self.agents.write().remove(agent);
    }

    pub fn clear(&self) {
        self.agents.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{
        AttemptFailure, EvaluationRecord, ExecutionAttempt, ExecutionHistory, FailureKind,
        QualityVerdict, TokenUsage,
    };

    fn attempt_with_score(number: u32, score: f64) -> ExecutionAttempt {
        let mut attempt = ExecutionAttempt::begin(number, "prompt");
        attempt.verdict = Some(QualityVerdict {
            overall_score: score,
            accepted: score >= 0.8,
            records: vec![EvaluationRecord::new("quality", score, "ok", vec![])],
        });
        attempt
    }

    fn accepted(score: f64) -> ExecutionOutcome {
        let mut history = ExecutionHistory::new("writer");
        history.record_generation_usage(&TokenUsage::new(100, 50));
        history.push(attempt_with_score(1, score).finish());
        ExecutionOutcome::accepted("text", history)
    }

    fn exhausted(score: f64) -> ExecutionOutcome {
        let mut history = ExecutionHistory::new("writer");
        history.record_generation_usage(&TokenUsage::new(40, 10));
        let mut first = attempt_with_score(1, 0.1);
        first.failure = Some(AttemptFailure::BelowQualityBar { overall_score: 0.1 });
        history.push(first.finish());
        let mut second = attempt_with_score(2, score);
        second.failure = Some(AttemptFailure::BelowQualityBar {
            overall_score: score,
        });
        history.push(second.finish());
        ExecutionOutcome::failed(FailureKind::ExhaustedRetries, "out of attempts", history)
    }

    #[test]
    fn test_record_accumulates() {
        let mut stats = AgentStats::default();
        stats.record(&accepted(0.9), Duration::from_millis(100));
        stats.record(&exhausted(0.5), Duration::from_millis(300));

        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.scored_executions, 2);
        // Last verdict of each execution: 0.9 and 0.5
        assert!((stats.average_score - 0.7).abs() < 1e-9);
        assert!((stats.average_response_ms - 200.0).abs() < 1e-6);
        assert_eq!(stats.total_tokens, 200);
        assert!((stats.average_tokens() - 100.0).abs() < 1e-9);
        assert!((stats.success_rate() - 0.5).abs() < 1e-9);
        assert_eq!(stats.failures.get("exhausted_retries").copied(), Some(1));
        assert!(stats.last_execution_at.is_some());
    }

    #[test]
    fn test_unscored_execution_leaves_average_score() {
        let mut stats = AgentStats::default();
        stats.record(&accepted(1.0), Duration::from_millis(10));

        let mut history = ExecutionHistory::new("writer");
        history.record_input_check(tether_core::ConstraintCheck::passed());
        let rejected = ExecutionOutcome::failed(FailureKind::InputConstraintViolation, "bad", history);
        stats.record(&rejected, Duration::from_millis(10));

        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.scored_executions, 1);
        assert!((stats.average_score - 1.0).abs() < 1e-9);
        assert_eq!(stats.success_rate(), 0.5);
    }

    #[test]
    fn test_empty_stats() {
        let stats = AgentStats::default();
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.average_tokens(), 0.0);
    }

    #[test]
    fn test_registry_keyed_by_agent() {
        let stats = ExecutionStats::new();
        stats.record("writer", &accepted(0.9), Duration::from_millis(5));
        stats.record("writer", &accepted(0.8), Duration::from_millis(5));
        stats.record("reviewer", &exhausted(0.2), Duration::from_millis(5));

        assert_eq!(stats.agent("writer").unwrap().total_executions, 2);
        assert_eq!(stats.agent("reviewer").unwrap().successful_executions, 0);
        assert!(stats.agent("nobody").is_none());

        let names: Vec<String> = stats.snapshot().into_keys().collect();
        assert_eq!(names, vec!["reviewer", "writer"]);

        stats.reset("writer");
        assert!(stats.agent("writer").is_none());
        stats.clear();
        assert!(stats.snapshot().is_empty());
    }
}
