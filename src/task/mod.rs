//! Task Definitions
//!
//! The units of work shared by the scheduler, the parallel executor and
//! the workflow orchestrator.
//!
//! # Components
//!
//! - [`model`]: Task definitions, identifiers, priorities and status
//! - [`result`]: The uniform per-attempt completion record
//! - [`invoke`]: The invocable-unit contract and the wrapper that runs it

pub mod invoke;
pub mod model;
pub mod result;

pub use invoke::{invoke, unit, CancellationToken, TaskContext, TaskFn, UnitResult};
pub use model::{Priority, Task, TaskId, TaskSnapshot, TaskStatus};
pub use result::{ExecutionResult, TaskError};
