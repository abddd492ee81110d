//! Task Model
//!
//! A [`Task`] is the caller-facing definition of a unit of work: what to
//! run, how urgent it is, what it waits for, and how hard to try. Runtime
//! state (status, timestamps, attempts) is owned by the scheduler and
//! exposed read-only through [`TaskSnapshot`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::invoke::TaskFn;
use super::result::{ExecutionResult, TaskError};

/// Identifier assigned to a task by the scheduler that accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Wraps a raw identifier value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task priority. Higher priorities are always dispatched first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a scheduled task.
///
/// Legal transitions: `Waiting -> Pending` (dependencies met),
/// `Pending -> Running`, `Running -> Completed | Failed`,
/// `Running -> Pending` (retry), and `Pending | Waiting -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Ready (or backing off before a retry), not yet dispatched
    Pending,
    /// Pending, but at least one dependency has not completed
    Waiting,
    /// Currently executing on a worker
    Running,
    /// Finished successfully
    Completed,
    /// Exhausted its retry budget
    Failed,
    /// Withdrawn before it ever ran
    Cancelled,
}

impl TaskStatus {
    /// Returns true for states a task never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// A unit of work submitted to the scheduler.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskforge::task::{unit, Priority, Task};
///
/// let task = Task::new("resolve-hosts", unit(|_ctx| Ok(serde_json::json!(["10.0.0.1"]))))
///     .with_priority(Priority::High)
///     .with_timeout(Duration::from_secs(30))
///     .with_retries(2);
/// assert_eq!(task.retries, 2);
/// ```
#[derive(Clone)]
pub struct Task {
    /// Display name (used as the result key by the executor)
    pub name: String,
    /// The invocable unit
    pub unit: TaskFn,
    /// Dispatch priority
    pub priority: Priority,
    /// Tasks that must reach `Completed` before this one may run
    pub dependencies: Vec<TaskId>,
    /// Per-attempt timeout
    pub timeout: Option<Duration>,
    /// Maximum number of attempts (values below 1 are treated as 1)
    pub retries: u32,
}

impl Task {
    /// Creates a task with normal priority, no dependencies, no timeout
    /// and a single attempt.
    pub fn new(name: impl Into<String>, unit: TaskFn) -> Self {
        Self {
            name: name.into().trim().to_string(),
            unit,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            timeout: None,
            retries: 1,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a dependency on a previously submitted task.
    pub fn depends_on(mut self, id: TaskId) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Attempt budget, never less than one.
    pub fn attempt_budget(&self) -> u32 {
        self.retries.max(1)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a task's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Attempts started so far
    pub attempts: u32,
    /// Return value of the successful attempt
    pub result: Option<serde_json::Value>,
    /// Error of the most recent failed attempt
    pub error: Option<TaskError>,
    /// One record per finished attempt, oldest first
    pub history: Vec<ExecutionResult>,
}
