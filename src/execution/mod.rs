//! Execution Module
//!
//! Runs independent task invocations with bounded, resource-aware
//! concurrency.
//!
//! # Architecture
//!
//! - [`executor`]: Batch-oriented worker pool with statistics
//! - [`command`]: Shell command units used by YAML phase plans

pub mod command;
pub mod executor;

pub use command::CommandUnit;
pub use executor::{ExecutionMode, ExecutorStats, ParallelExecutor, TaskInvocation};
