//! Phase Modules
//!
//! Domain collaborators plug into a phase by building task descriptors
//! for a target. The orchestrator makes no assumption about what the
//! tasks do beyond "returns a result or fails".

use std::collections::BTreeMap;
use std::time::Duration;

use crate::task::{Priority, TaskFn};

use super::phase::Phase;
use super::report::PhaseResult;

/// Committed results of earlier phases.
pub type PriorResults = BTreeMap<Phase, PhaseResult>;

/// One unit of work a module contributes to a phase.
#[derive(Clone)]
pub struct TaskDescriptor {
    /// Unique within the phase
    pub name: String,
    pub unit: TaskFn,
    pub priority: Priority,
    /// Names of tasks in the same phase that must complete first
    pub depends_on: Vec<String>,
    pub timeout: Option<Duration>,
    /// Attempt budget; the configured default when unset
    pub retries: Option<u32>,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, unit: TaskFn) -> Self {
        Self {
            name: name.into(),
            unit,
            priority: Priority::Normal,
            depends_on: Vec::new(),
            timeout: None,
            retries: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.depends_on.contains(&name) {
            self.depends_on.push(name);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

impl std::fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("depends_on", &self.depends_on)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

/// A collaborator that contributes tasks to a phase.
pub trait PhaseModule: Send + Sync {
    fn name(&self) -> &str;

    /// Builds this module's tasks for `target`.
    ///
    /// An error aborts the workflow.
    fn tasks(&self, target: &str, prior: &PriorResults) -> Result<Vec<TaskDescriptor>, String>;
}

/// A module with a fixed task list.
#[derive(Debug, Clone)]
pub struct TaskList {
    name: String,
    tasks: Vec<TaskDescriptor>,
}

impl TaskList {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskDescriptor>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }
}

impl PhaseModule for TaskList {
    fn name(&self) -> &str {
        &self.name
    }

    fn tasks(&self, _target: &str, _prior: &PriorResults) -> Result<Vec<TaskDescriptor>, String> {
        Ok(self.tasks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::unit;
    use serde_json::json;

    #[test]
    fn test_descriptor_builders() {
        let desc = TaskDescriptor::new("scan", unit(|_| Ok(json!(null))))
            .with_priority(Priority::High)
            .depends_on("resolve")
            .depends_on("resolve")
            .with_timeout(Duration::from_secs(30))
            .with_retries(2);

        assert_eq!(desc.priority, Priority::High);
        assert_eq!(desc.depends_on, vec!["resolve".to_string()]);
        assert_eq!(desc.timeout, Some(Duration::from_secs(30)));
        assert_eq!(desc.retries, Some(2));
        assert!(format!("{:?}", desc).contains("scan"));
    }

    #[test]
    fn test_task_list_returns_copies() {
        let module = TaskList::new(
            "dns",
            vec![TaskDescriptor::new("lookup", unit(|_| Ok(json!("ok"))))],
        );
        let prior = PriorResults::new();

        assert_eq!(module.name(), "dns");
        assert_eq!(module.tasks("a.test", &prior).unwrap().len(), 1);
        assert_eq!(module.tasks("b.test", &prior).unwrap()[0].name, "lookup");
    }
}
