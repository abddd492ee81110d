//! Taskforge - Task Scheduling and Phased Workflow Orchestration
//!
//! A thread-based execution core for operational pipelines: a
//! resource-aware task scheduler with dependencies, priorities and
//! retries, a batch executor for independent work, and an orchestrator
//! that walks a target through ordered, authorization-gated phases.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`task`]: Task model, invocable units and execution results
//! - [`scheduler`]: Priority/dependency scheduler with retry backoff
//! - [`execution`]: Batch executor and shell command units
//! - [`monitoring`]: Resource sampling, admission limits and phase timeline
//! - [`workflow`]: Phase state machine, modules, plans and the orchestrator
//! - [`config`]: YAML configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskforge::config::Config;
//! use taskforge::workflow::{ScopeList, WorkflowOrchestrator, WorkflowPlan};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("taskforge.yaml")?;
//!     let scope = ScopeList::new(config.authorized_targets.clone());
//!
//!     let mut orchestrator = WorkflowOrchestrator::from_config(config, Arc::new(scope))?;
//!     WorkflowPlan::load("plan.yaml")?.register(&mut orchestrator, false);
//!
//!     let report = orchestrator.run("app.example.com")?;
//!     println!("{}", report.timeline.chart());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod scheduler;
pub mod task;
pub mod workflow;

// Re-export commonly used types
pub use config::Config;
pub use error::{ConfigError, SchedulerError, WorkflowError};
pub use execution::{ExecutionMode, ParallelExecutor};
pub use monitoring::{ResourceManager, ResourceThresholds};
pub use scheduler::TaskScheduler;
pub use task::{unit, ExecutionResult, Priority, Task, TaskId, TaskStatus};
pub use workflow::{Phase, WorkflowOrchestrator, WorkflowReport, WorkflowState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "taskforge";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "taskforge");
    }

    #[test]
    fn test_module_exports_task() {
        let task = Task::new("lookup", unit(|_| Ok(json!(null)))).with_priority(Priority::High);
        assert_eq!(task.name, "lookup");
        assert_eq!(task.priority, Priority::High);
    }

    #[test]
    fn test_module_exports_phase_order() {
        assert!(Phase::Recon < Phase::Reporting);
        assert!(WorkflowState::Complete.is_terminal());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
