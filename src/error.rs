//! Error Types
//!
//! Errors surfaced synchronously to callers: submission/validation
//! problems, configuration problems, and fatal workflow conditions.
//!
//! Failures of individual tasks are not errors in this sense. They are
//! captured as [`TaskError`](crate::task::TaskError) values inside each
//! task's [`ExecutionResult`](crate::task::ExecutionResult).

use thiserror::Error;

use crate::task::TaskId;

/// Errors returned by the task scheduler at submission or lookup time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    DependencyNotFound { task: String, dependency: TaskId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Scheduler has been shut down")]
    ShutDown,
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid threshold '{field}': {value} (expected a percentage in (0, 100])")]
    InvalidThreshold { field: &'static str, value: f32 },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal workflow errors. Any of these moves a run to `FAILED`.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid workflow transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Phase '{phase}' could not be prepared: {message}")]
    Module { phase: String, message: String },

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("A workflow run is already in progress")]
    AlreadyRunning,

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}
