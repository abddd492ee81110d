//! Workflow Checkpoints
//!
//! A checkpoint records which phases of a run were committed, with
//! their results, so an interrupted run can continue from the last
//! committed phase. Phases commit atomically: a phase is either in the
//! checkpoint with all of its results or not at all.
//!
//! Checkpoints are plain JSON files.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

use super::phase::Phase;
use super::report::PhaseResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub target: String,
    /// Committed phases in execution order
    pub phases: Vec<PhaseResult>,
    pub saved_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    /// A checkpoint with nothing committed.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            phases: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    pub fn is_committed(&self, phase: Phase) -> bool {
        self.phases.iter().any(|p| p.phase == phase)
    }

    /// Furthest phase in the total order that has been committed.
    pub fn last_committed(&self) -> Option<Phase> {
        self.phases.iter().map(|p| p.phase).max()
    }

    /// Adds or replaces a phase's results, keeping execution order.
    pub fn commit(&mut self, result: PhaseResult) {
        self.phases.retain(|p| p.phase != result.phase);
        self.phases.push(result);
        self.phases.sort_by_key(|p| p.phase);
        self.saved_at = Utc::now();
    }

    /// Writes the checkpoint as pretty-printed JSON, creating parent
    /// directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WorkflowError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| checkpoint_error(path, e))?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| checkpoint_error(path, e))?;
        fs::write(path, json).map_err(|e| checkpoint_error(path, e))?;

        info!("Saved workflow checkpoint to {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WorkflowError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| checkpoint_error(path, e))?;
        let checkpoint: Self =
            serde_json::from_str(&content).map_err(|e| checkpoint_error(path, e))?;

        info!(
            "Loaded workflow checkpoint from {} (committed: {:?})",
            path.display(),
            checkpoint.phases.iter().map(|p| p.phase.name()).collect::<Vec<_>>()
        );
        Ok(checkpoint)
    }

    /// Loads the checkpoint if the file exists, otherwise starts fresh.
    pub fn load_or_new<P: AsRef<Path>>(path: P, target: &str) -> Result<Self, WorkflowError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new(target))
        }
    }
}

fn checkpoint_error(path: &Path, err: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Checkpoint(format!("{}: {}", path.display(), err))
}
