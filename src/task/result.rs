//! Execution Results
//!
//! Every attempt of every task, whether run by the scheduler or by the
//! parallel executor, produces exactly one [`ExecutionResult`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single attempt did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskError {
    /// The unit returned an error
    #[error("{0}")]
    Execution(String),

    /// The unit did not finish within its timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The unit panicked
    #[error("panicked: {0}")]
    Panicked(String),

    /// The attempt was withdrawn before it started
    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Immutable record of one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_name: String,
    pub success: bool,
    /// Attempt number, starting at 1
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Builds a successful record.
    pub fn succeeded(
        task_name: impl Into<String>,
        attempt: u32,
        value: serde_json::Value,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            success: true,
            attempt,
            result: Some(value),
            error: None,
            duration,
            started_at,
            ended_at: end_of(started_at, duration),
        }
    }

    /// Builds a failed record.
    pub fn failed(
        task_name: impl Into<String>,
        attempt: u32,
        error: TaskError,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            success: false,
            attempt,
            result: None,
            error: Some(error),
            duration,
            started_at,
            ended_at: end_of(started_at, duration),
        }
    }

    /// Record for an invocation that was withdrawn before it started.
    pub fn cancelled(task_name: impl Into<String>) -> Self {
        Self::failed(task_name, 0, TaskError::Cancelled, Utc::now(), Duration::ZERO)
    }

    /// Returns true if the attempt failed by exceeding its timeout.
    pub fn timed_out(&self) -> bool {
        self.error.as_ref().is_some_and(TaskError::is_timeout)
    }

    /// Human-readable error text, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

fn end_of(started_at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| started_at.checked_add_signed(d))
        .unwrap_or(started_at)
}
