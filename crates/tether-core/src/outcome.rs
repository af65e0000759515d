//! Terminal result of an execution.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::history::ExecutionHistory;

/// Why an execution ended without an accepted output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Input was rejected before any attempt
    InputConstraintViolation,

    /// The last attempt's output failed its constraints
    OutputConstraintViolation,

    /// The attempt budget ran out
    ExhaustedRetries,

    /// No backend could be selected
    NoBackendAvailable,

    /// The caller cancelled the execution
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::InputConstraintViolation => "input_constraint_violation",
            FailureKind::OutputConstraintViolation => "output_constraint_violation",
            FailureKind::ExhaustedRetries => "exhausted_retries",
            FailureKind::NoBackendAvailable => "no_backend_available",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Final status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Accepted,
    Failed { kind: FailureKind },
}

/// What `execute` returns: the status, the accepted output and the full
/// history of attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    #[serde(flatten)]
    pub status: ExecutionStatus,

    /// Accepted output, present only on `Accepted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Human-readable reason for a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub history: ExecutionHistory,
}

impl ExecutionOutcome {
    pub fn accepted(output: impl Into<String>, history: ExecutionHistory) -> Self {
        Self {
            status: ExecutionStatus::Accepted,
            output: Some(output.into()),
            detail: None,
            history,
        }
    }

    pub fn failed(kind: FailureKind, detail: impl Into<String>, history: ExecutionHistory) -> Self {
        Self {
            status: ExecutionStatus::Failed { kind },
            output: None,
            detail: Some(detail.into()),
            history,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == ExecutionStatus::Accepted
    }

    /// Failure kind, or `None` when accepted.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.status {
            ExecutionStatus::Accepted => None,
            ExecutionStatus::Failed { kind } => Some(kind),
        }
    }

    /// Number of attempts made.
    pub fn attempts(&self) -> usize {
        self.history.len()
    }

    /// Pretty JSON audit trail.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
