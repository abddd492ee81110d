//! Retry Backoff
//!
//! Backoff between attempts grows exponentially up to a cap:
//! `delay(attempt) = min(unit * base^attempt, cap)`.
//!
//! Waiting goes through the [`Sleeper`] trait so tests can observe the
//! requested delays without actually sleeping.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Growth factor per attempt
    pub base: f64,
    /// Delay unit the power is multiplied by
    pub unit: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: f64, unit: Duration, cap: Duration) -> Self {
        Self { base, unit, cap }
    }

    /// Delay to wait after `attempt` failed attempts.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.unit.as_secs_f64() * self.base.powi(exponent);

        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    /// `min(2^attempt, 60)` seconds.
    fn default() -> Self {
        Self {
            base: 2.0,
            unit: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

/// Blocking wait abstraction.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);

    /// Registers a delay the caller waits out without blocking a thread.
    /// Returns how long the caller should actually wait.
    fn defer(&self, duration: Duration) -> Duration {
        duration
    }
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// All delays requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        match self.delays.lock() {
            Ok(mut guard) => guard.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
    }

    fn defer(&self, duration: Duration) -> Duration {
        self.sleep(duration);
        Duration::ZERO
    }
}
