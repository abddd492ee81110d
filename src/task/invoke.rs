//! Invocable Units
//!
//! A task body is any `Fn(&TaskContext) -> UnitResult` that is safe to call
//! from any worker thread. Arguments are bound when the closure is built.
//!
//! # Cancellation contract
//!
//! Running units are never preempted. When a timeout fires, or the
//! executor is asked to cancel outstanding work, the unit's
//! [`CancellationToken`] is set and its eventual result is discarded.
//! Units that need to stop promptly must poll
//! [`TaskContext::is_cancelled`] themselves.

use std::any::Any;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, warn};

use super::result::{ExecutionResult, TaskError};

/// What a unit returns: a JSON payload or any error.
pub type UnitResult = Result<serde_json::Value, Box<dyn Error + Send + Sync>>;

/// Shared, thread-safe reference to a task body.
pub type TaskFn = Arc<dyn Fn(&TaskContext) -> UnitResult + Send + Sync>;

/// Wraps a closure as a [`TaskFn`].
pub fn unit<F>(f: F) -> TaskFn
where
    F: Fn(&TaskContext) -> UnitResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Cooperative cancellation flag shared between a unit and its runner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-attempt context handed to a unit.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_name: String,
    /// Attempt number, starting at 1
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            task_name: task_name.into(),
            attempt,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses an externally owned token instead of a fresh one.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs one attempt of a unit and records the outcome.
///
/// Without a timeout the unit runs on the calling thread. With a timeout
/// it runs on a helper thread raced against `recv_timeout`; on expiry the
/// context's token is cancelled and the helper is left to finish on its
/// own, its late result dropped.
pub fn invoke(unit: &TaskFn, ctx: TaskContext, timeout: Option<Duration>) -> ExecutionResult {
    let started_at = Utc::now();
    let clock = Instant::now();
    let name = ctx.task_name.clone();
    let attempt = ctx.attempt;

    let outcome = match timeout {
        None => run_guarded(unit, &ctx),
        Some(limit) => run_with_timeout(unit, ctx, limit),
    };

    let elapsed = clock.elapsed();
    match outcome {
        Ok(value) => {
            debug!("Task '{}' attempt {} succeeded in {:.2?}", name, attempt, elapsed);
            ExecutionResult::succeeded(name, attempt, value, started_at, elapsed)
        }
        Err(error) => {
            debug!("Task '{}' attempt {} failed: {}", name, attempt, error);
            ExecutionResult::failed(name, attempt, error, started_at, elapsed)
        }
    }
}

/// Calls the unit, converting errors and panics into [`TaskError`].
fn run_guarded(unit: &TaskFn, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
    match panic::catch_unwind(AssertUnwindSafe(|| unit(ctx))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::Execution(e.to_string())),
        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn run_with_timeout(
    unit: &TaskFn,
    ctx: TaskContext,
    limit: Duration,
) -> Result<serde_json::Value, TaskError> {
    let (tx, rx) = mpsc::channel();
    let token = ctx.cancel.clone();
    let worker_unit = Arc::clone(unit);
    let thread_name = format!("unit-{}", ctx.task_name);

    let spawned = thread::Builder::new().name(thread_name).spawn(move || {
        let outcome = run_guarded(&worker_unit, &ctx);
        // Receiver is gone once the attempt has timed out
        let _ = tx.send(outcome);
    });

    if let Err(e) = spawned {
        return Err(TaskError::Execution(format!("failed to spawn unit thread: {}", e)));
    }

    match rx.recv_timeout(limit) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => {
            token.cancel();
            warn!("Unit exceeded its {:?} timeout; abandoning it", limit);
            Err(TaskError::Timeout(limit))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(TaskError::Panicked("unit thread exited without a result".to_string()))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
