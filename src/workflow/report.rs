//! Phase and Run Reports
//!
//! Results of a phase are committed as one [`PhaseResult`] once every
//! task in the phase has returned. A [`WorkflowReport`] gathers the
//! committed phases, skipped phases and state history of a whole run.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::execution::ExecutorStats;
use crate::monitoring::PhaseTimeline;
use crate::task::ExecutionResult;

use super::phase::Phase;
use super::state::{StateChange, WorkflowState};

/// All task outcomes of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    /// Final result per task name
    pub results: BTreeMap<String, ExecutionResult>,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when the phase had tasks and none succeeded
    pub all_failed: bool,
    /// Tasks that never ran because a dependency failed or the phase timed out
    pub blocked: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PhaseResult {
    pub fn new(
        phase: Phase,
        results: BTreeMap<String, ExecutionResult>,
        blocked: Vec<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let succeeded = results.values().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        let all_failed = succeeded == 0 && (failed > 0 || !blocked.is_empty());

        if all_failed {
            warn!("Every task in phase '{}' failed", phase);
        }

        Self {
            phase,
            results,
            succeeded,
            failed,
            all_failed,
            blocked,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// A phase with no tasks.
    pub fn empty(phase: Phase) -> Self {
        Self::new(phase, BTreeMap::new(), Vec::new(), Utc::now())
    }

    pub fn get(&self, task: &str) -> Option<&ExecutionResult> {
        self.results.get(task)
    }

    /// Payload of a successful task.
    pub fn value(&self, task: &str) -> Option<&serde_json::Value> {
        self.results
            .get(task)
            .filter(|r| r.success)
            .and_then(|r| r.result.as_ref())
    }

    pub fn task_count(&self) -> usize {
        self.results.len() + self.blocked.len()
    }
}

/// Why a phase did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Turned off in configuration
    Disabled,
    /// The authorization check denied the target
    Unauthorized,
    /// Depends on a phase that did not run
    PrerequisiteSkipped,
    /// Already committed by a checkpoint
    Committed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Disabled => "disabled",
            Self::Unauthorized => "not authorized",
            Self::PrerequisiteSkipped => "prerequisite skipped",
            Self::Committed => "already committed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPhase {
    pub phase: Phase,
    pub reason: SkipReason,
}

/// Outcome of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub target: String,
    pub state: WorkflowState,
    /// Committed phases in execution order
    pub phases: Vec<PhaseResult>,
    pub skipped: Vec<SkippedPhase>,
    pub transitions: Vec<StateChange>,
    pub timeline: PhaseTimeline,
    pub elapsed: Duration,
    pub executor: ExecutorStats,
    pub resource_summary: String,
}

impl WorkflowReport {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.phase.name()).collect()
    }

    pub fn skip_reason(&self, phase: Phase) -> Option<SkipReason> {
        self.skipped
            .iter()
            .find(|s| s.phase == phase)
            .map(|s| s.reason)
    }

    pub fn is_complete(&self) -> bool {
        self.state == WorkflowState::Complete
    }

    pub fn total_failed(&self) -> usize {
        self.phases.iter().map(|p| p.failed).sum()
    }

    pub fn total_succeeded(&self) -> usize {
        self.phases.iter().map(|p| p.succeeded).sum()
    }

    /// True if the run passed directly from `from` to `to`.
    pub fn transitioned(&self, from: WorkflowState, to: WorkflowState) -> bool {
        self.transitions.iter().any(|c| c.from == from && c.to == to)
    }
}
