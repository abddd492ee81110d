//! Phased Workflow Module
//!
//! Sequences a run through recon, vulnerability assessment, exploitation,
//! post-exploitation and reporting for a single target.
//!
//! # Structure
//!
//! - [`phase`]: The phases and their order
//! - [`state`]: Workflow state machine and legal transitions
//! - [`auth`]: Authorization gate for sensitive phases
//! - [`module`]: Task descriptors and the phase module trait
//! - [`plan`]: YAML plans of shell commands per phase
//! - [`report`]: Phase results and run reports
//! - [`checkpoint`]: Committed-phase persistence for resuming runs
//! - [`orchestrator`]: Drives a run from start to finish

pub mod auth;
pub mod checkpoint;
pub mod module;
pub mod orchestrator;
pub mod phase;
pub mod plan;
pub mod report;
pub mod state;

pub use auth::{AllowAll, Authorizer, DenyAll, ScopeList};
pub use checkpoint::WorkflowCheckpoint;
pub use module::{PhaseModule, PriorResults, TaskDescriptor, TaskList};
pub use orchestrator::{WorkflowOrchestrator, WorkflowStatus};
pub use phase::Phase;
pub use plan::{CommandModule, PlanTask, WorkflowPlan};
pub use report::{PhaseResult, SkipReason, SkippedPhase, WorkflowReport};
pub use state::{StateChange, StateMachine, WorkflowState};
