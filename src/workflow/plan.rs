//! Workflow Plans
//!
//! Loads phase task lists from YAML and turns them into shell-command
//! modules.
//!
//! # Example YAML Format
//!
//! ```yaml
//! working_dir: /tmp/engagement
//! phases:
//!   recon:
//!     - name: resolve
//!       command: dig +short {target}
//!     - name: portscan
//!       command: nmap -Pn {target}
//!       depends_on: resolve
//!       priority: high
//!       timeout_secs: 600
//!
//!   vulnerability:
//!     - name: headers
//!       command: curl -sI https://{target}
//!       retries: 2
//! ```
//!
//! `depends_on` names tasks in the same phase. `{target}` is replaced
//! with the run's target when the phase starts.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::execution::CommandUnit;
use crate::task::Priority;

use super::module::{PhaseModule, PriorResults, TaskDescriptor};
use super::orchestrator::WorkflowOrchestrator;
use super::phase::Phase;

/// One shell command in a plan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanTask {
    /// Unique within its phase
    pub name: String,

    /// Command template; `{target}` is substituted
    pub command: String,

    /// Names of tasks in the same phase that must succeed first
    #[serde(deserialize_with = "single_or_vec", default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub priority: Priority,

    pub timeout_secs: Option<u64>,

    /// Attempt budget; the configured default when unset
    pub retries: Option<u32>,
}

/// Accepts a single string or a list of strings.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    phases: BTreeMap<String, Vec<PlanTask>>,
}

/// Shell commands to run per phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowPlan {
    pub working_dir: Option<PathBuf>,
    pub phases: BTreeMap<Phase, Vec<PlanTask>>,
}

impl WorkflowPlan {
    /// Loads and validates a plan file.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use taskforge::workflow::WorkflowPlan;
    ///
    /// fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let plan = WorkflowPlan::load("plan.yaml")?;
    ///     println!("Loaded {} tasks", plan.task_count());
    ///     Ok(())
    /// }
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading workflow plan from: {}", path.display());

        let content = fs::read_to_string(path)?;
        debug!("Plan YAML loaded ({} bytes)", content.len());
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawPlan = serde_yaml::from_str(content)?;

        let mut phases = BTreeMap::new();
        for (key, tasks) in raw.phases {
            let phase: Phase = key.parse().map_err(ConfigError::Invalid)?;
            if phases.insert(phase, tasks).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "phase '{}' is listed more than once",
                    phase
                )));
            }
        }

        let plan = Self {
            working_dir: raw.working_dir,
            phases,
        };
        plan.validate()?;

        info!(
            "Parsed {} tasks across {} phases",
            plan.task_count(),
            plan.phases.len()
        );
        Ok(plan)
    }

    /// Checks names, commands and intra-phase dependency references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (phase, tasks) in &self.phases {
            let mut names = HashSet::new();
            for task in tasks {
                if task.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "phase '{}' has a task without a name",
                        phase
                    )));
                }
                if task.command.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "task '{}' in phase '{}' has an empty command",
                        task.name, phase
                    )));
                }
                if !names.insert(task.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate task '{}' in phase '{}'",
                        task.name, phase
                    )));
                }
            }

            for task in tasks {
                for dep in &task.depends_on {
                    if !names.contains(dep.as_str()) {
                        return Err(ConfigError::Invalid(format!(
                            "task '{}' in phase '{}' depends on unknown task '{}'",
                            task.name, phase, dep
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn task_count(&self) -> usize {
        self.phases.values().map(Vec::len).sum()
    }

    /// One command module per phase with tasks.
    pub fn modules(&self, dry_run: bool) -> Vec<(Phase, CommandModule)> {
        self.phases
            .iter()
            .filter(|(_, tasks)| !tasks.is_empty())
            .map(|(phase, tasks)| {
                let module = CommandModule {
                    name: format!("{}-plan", phase),
                    tasks: tasks.clone(),
                    working_dir: self.working_dir.clone(),
                    dry_run,
                };
                (*phase, module)
            })
            .collect()
    }

    /// Registers the plan's modules. Returns the number registered.
    pub fn register(&self, orchestrator: &mut WorkflowOrchestrator, dry_run: bool) -> usize {
        let modules = self.modules(dry_run);
        let count = modules.len();
        for (phase, module) in modules {
            orchestrator.register_module(phase, module);
        }
        count
    }
}

/// Runs a phase's plan tasks as shell commands.
#[derive(Debug, Clone)]
pub struct CommandModule {
    name: String,
    tasks: Vec<PlanTask>,
    working_dir: Option<PathBuf>,
    dry_run: bool,
}

impl PhaseModule for CommandModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn tasks(&self, target: &str, _prior: &PriorResults) -> Result<Vec<TaskDescriptor>, String> {
        let descriptors = self
            .tasks
            .iter()
            .map(|task| {
                let mut command = CommandUnit::new(&task.command).dry_run(self.dry_run);
                if let Some(dir) = &self.working_dir {
                    command = command.with_working_dir(dir);
                }

                let mut descriptor = TaskDescriptor::new(&task.name, command.for_target(target))
                    .with_priority(task.priority);
                for dep in &task.depends_on {
                    descriptor = descriptor.depends_on(dep);
                }
                if let Some(secs) = task.timeout_secs {
                    descriptor = descriptor.with_timeout(Duration::from_secs(secs));
                }
                if let Some(retries) = task.retries {
                    descriptor = descriptor.with_retries(retries);
                }
                descriptor
            })
            .collect();
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use serde_json::json;

    const PLAN: &str = r#"
phases:
  recon:
    - name: resolve
      command: dig +short {target}
    - name: portscan
      command: nmap -Pn {target}
      depends_on: resolve
      priority: high
      timeout_secs: 600
  vuln:
    - name: headers
      command: curl -sI https://{target}
      retries: 2
"#;

    #[test]
    fn test_parse_plan() {
        let plan = WorkflowPlan::from_yaml(PLAN).unwrap();

        assert_eq!(plan.task_count(), 3);
        assert_eq!(plan.working_dir, None);

        let recon = &plan.phases[&Phase::Recon];
        assert_eq!(recon[1].depends_on, vec!["resolve".to_string()]);
        assert_eq!(recon[1].priority, Priority::High);
        assert_eq!(recon[1].timeout_secs, Some(600));
        assert_eq!(recon[0].priority, Priority::Normal);

        assert_eq!(plan.phases[&Phase::Vulnerability][0].retries, Some(2));
    }

    #[test]
    fn test_unknown_phase_is_rejected() {
        let err = WorkflowPlan::from_yaml("phases:\n  lunch:\n    - name: a\n      command: ls\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let yaml = r#"
phases:
  recon:
    - name: scan
      command: nmap {target}
      depends_on: [resolve]
"#;
        let err = WorkflowPlan::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown task 'resolve'"));
    }

    #[test]
    fn test_duplicate_task_is_rejected() {
        let yaml = r#"
phases:
  recon:
    - name: scan
      command: nmap {target}
    - name: scan
      command: masscan {target}
"#;
        let err = WorkflowPlan::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate task 'scan'"));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let err = WorkflowPlan::from_yaml("phases:\n  recon:\n    - name: a\n      command: '  '\n")
            .unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn test_command_module_builds_descriptors() {
        let plan = WorkflowPlan::from_yaml(PLAN).unwrap();
        let modules = plan.modules(true);
        assert_eq!(modules.len(), 2);

        let (phase, module) = &modules[0];
        assert_eq!(*phase, Phase::Recon);
        assert_eq!(module.name(), "recon-plan");

        let tasks = module.tasks("10.0.0.5", &PriorResults::new()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].depends_on, vec!["resolve".to_string()]);
        assert_eq!(tasks[1].timeout, Some(Duration::from_secs(600)));
        assert_eq!(tasks[0].retries, None);

        let output = (tasks[1].unit)(&TaskContext::new("portscan", 1)).unwrap();
        assert_eq!(output["command"], json!("nmap -Pn 10.0.0.5"));
        assert_eq!(output["dry_run"], json!(true));
    }

    #[test]
    fn test_load_missing_file() {
        let err = WorkflowPlan::load("/nonexistent/plan.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
