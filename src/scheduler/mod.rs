//! Task Scheduling Module
//!
//! Dependency-aware dispatch of tasks onto a bounded worker pool.
//!
//! # Architecture
//!
//! - [`scheduler`]: The scheduler, its worker loop and task bookkeeping
//! - [`queue`]: Priority-ordered ready queue
//! - [`retry`]: Exponential backoff policy and sleep injection

pub mod queue;
pub mod retry;
pub mod scheduler;

pub use queue::ReadyQueue;
pub use retry::{RecordingSleeper, RetryPolicy, Sleeper, ThreadSleeper};
pub use scheduler::{SchedulerConfig, SchedulerStats, TaskScheduler};
