//! Workflow State Machine
//!
//! The states a workflow run moves through and the transitions allowed
//! between them:
//!
//! ```text
//! INITIALIZED -> RECON_RUNNING -> RECON_COMPLETE -> VULN_RUNNING -> VULN_COMPLETE
//!   -> EXPLOIT_PENDING -> EXPLOIT_RUNNING -> EXPLOIT_COMPLETE
//!   -> POST_EXPLOIT_RUNNING -> POST_EXPLOIT_COMPLETE
//!   -> REPORTING -> COMPLETE
//! ```
//!
//! Disabled or unauthorized phases are skipped by moving from a settled
//! state (INITIALIZED or any `*_COMPLETE`) straight to a later phase.
//! FAILED and PAUSED are reachable from every non-terminal state; a
//! paused run resumes into the settled state of its last committed phase.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

use super::phase::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Initialized,
    ReconRunning,
    ReconComplete,
    VulnRunning,
    VulnComplete,
    ExploitPending,
    ExploitRunning,
    ExploitComplete,
    PostExploitRunning,
    PostExploitComplete,
    Reporting,
    Complete,
    Failed,
    Paused,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Between phases: nothing running, nothing pending.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Initialized
                | Self::ReconComplete
                | Self::VulnComplete
                | Self::ExploitComplete
                | Self::PostExploitComplete
        )
    }

    /// The phase whose tasks are running in this state.
    pub fn running_phase(&self) -> Option<Phase> {
        match self {
            Self::ReconRunning => Some(Phase::Recon),
            Self::VulnRunning => Some(Phase::Vulnerability),
            Self::ExploitPending | Self::ExploitRunning => Some(Phase::Exploitation),
            Self::PostExploitRunning => Some(Phase::PostExploitation),
            Self::Reporting => Some(Phase::Reporting),
            _ => None,
        }
    }

    /// The last phase committed when this state was reached.
    pub fn committed_phase(&self) -> Option<Phase> {
        match self {
            Self::ReconComplete => Some(Phase::Recon),
            Self::VulnComplete => Some(Phase::Vulnerability),
            Self::ExploitComplete => Some(Phase::Exploitation),
            Self::PostExploitComplete => Some(Phase::PostExploitation),
            _ => None,
        }
    }

    /// Settled state matching the furthest committed phase.
    pub fn settled_after(last: Option<Phase>) -> Self {
        last.map_or(Self::Initialized, |phase| phase.complete_state())
    }

    /// Returns true if moving from `self` to `target` is allowed.
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(target, Failed) {
            return true;
        }
        if matches!(target, Paused) {
            return *self != Paused;
        }
        if *self == Paused {
            return target.is_settled();
        }

        match (*self, target) {
            (ExploitPending, ExploitRunning) => true,
            (ReconRunning, ReconComplete)
            | (VulnRunning, VulnComplete)
            | (ExploitRunning, ExploitComplete)
            | (PostExploitRunning, PostExploitComplete)
            | (Reporting, Complete) => true,
            (from, to) if from.is_settled() => {
                let after = from.committed_phase();
                let later = |phase: Phase| after.map_or(true, |done| phase > done);
                match to {
                    ExploitPending => later(Phase::Exploitation),
                    PostExploitRunning => from == ExploitComplete,
                    Complete => true,
                    _ => match to.running_phase() {
                        Some(Phase::Exploitation) | None => false,
                        Some(phase) => later(phase),
                    },
                }
            }
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "INITIALIZED",
            Self::ReconRunning => "RECON_RUNNING",
            Self::ReconComplete => "RECON_COMPLETE",
            Self::VulnRunning => "VULN_RUNNING",
            Self::VulnComplete => "VULN_COMPLETE",
            Self::ExploitPending => "EXPLOIT_PENDING",
            Self::ExploitRunning => "EXPLOIT_RUNNING",
            Self::ExploitComplete => "EXPLOIT_COMPLETE",
            Self::PostExploitRunning => "POST_EXPLOIT_RUNNING",
            Self::PostExploitComplete => "POST_EXPLOIT_COMPLETE",
            Self::Reporting => "REPORTING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Paused => "PAUSED",
        };
        f.write_str(name)
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub at: DateTime<Utc>,
}

/// Current state plus the history of how it was reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    current: WorkflowState,
    history: Vec<StateChange>,
}

impl StateMachine {
    pub fn new(initial: WorkflowState) -> Self {
        Self {
            current: initial,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> WorkflowState {
        self.current
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Moves to `target`, rejecting transitions the machine doesn't allow.
    pub fn transition(&mut self, target: WorkflowState) -> Result<(), WorkflowError> {
        if !self.current.can_transition_to(target) {
            return Err(WorkflowError::InvalidTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }
        self.record(target);
        Ok(())
    }

    /// Moves to FAILED unless already terminal.
    pub fn fail(&mut self) {
        if !self.current.is_terminal() {
            self.record(WorkflowState::Failed);
        }
    }

    fn record(&mut self, target: WorkflowState) {
        self.history.push(StateChange {
            from: self.current,
            to: target,
            at: Utc::now(),
        });
        self.current = target;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(WorkflowState::Initialized)
    }
}
