//! Dependency-Aware Task Scheduler
//!
//! Owns a graph of tasks and dispatches them to a fixed pool of worker
//! threads:
//! - Tasks with unmet dependencies wait in `WAITING`
//! - Ready tasks are served strictly by priority, FIFO within a priority
//! - Failed attempts are retried with exponential backoff; a task
//!   backing off holds a deadline, not a worker
//! - Every completion promotes the waiting tasks it unblocked
//!
//! All bookkeeping (task map, ready queue, completed store) lives behind
//! a single mutex per scheduler. Units always run outside that lock.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::SchedulerError;
use crate::monitoring::ResourceManager;
use crate::task::{
    invoke, ExecutionResult, Priority, Task, TaskContext, TaskError, TaskFn, TaskId,
    TaskSnapshot, TaskStatus,
};

use super::queue::ReadyQueue;
use super::retry::{RetryPolicy, Sleeper, ThreadSleeper};

/// How long an idle worker waits before re-checking admission.
const ADMISSION_RECHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Scheduler construction parameters.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads (the concurrency ceiling)
    pub workers: usize,
    /// Backoff between failed attempts
    pub retry: RetryPolicy,
    /// Maximum number of terminal tasks kept in the completed store
    pub completed_retention: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            completed_retention: 10_000,
        }
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub waiting: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl SchedulerStats {
    fn count(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Waiting => self.waiting += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// A task plus the runtime state the scheduler tracks for it.
struct TaskRecord {
    id: TaskId,
    task: Task,
    sequence: u64,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    attempts: u32,
    result: Option<serde_json::Value>,
    error: Option<TaskError>,
    history: Vec<ExecutionResult>,
}

impl TaskRecord {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.task.name.clone(),
            priority: self.task.priority,
            dependencies: self.task.dependencies.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            attempts: self.attempts,
            result: self.result.clone(),
            error: self.error.clone(),
            history: self.history.clone(),
        }
    }
}

/// Work claimed by a worker for one attempt.
struct Job {
    id: TaskId,
    name: String,
    unit: TaskFn,
    timeout: Option<Duration>,
    attempt: u32,
    budget: u32,
}

#[derive(Default)]
struct SchedulerState {
    /// Non-terminal tasks
    active: HashMap<TaskId, TaskRecord>,
    ready: ReadyQueue,
    /// Terminal tasks, read-only
    finished: HashMap<TaskId, TaskRecord>,
    finished_order: VecDeque<TaskId>,
    /// Terminal status of tasks dropped from the completed store
    evicted: HashMap<TaskId, TaskStatus>,
    /// Retries waiting out their backoff, earliest deadline first
    backoff: BinaryHeap<Reverse<(Instant, TaskId)>>,
    next_id: u64,
    running: usize,
    started: bool,
    shutdown: bool,
}

impl SchedulerState {
    fn status_of(&self, id: TaskId) -> Option<TaskStatus> {
        self.active
            .get(&id)
            .or_else(|| self.finished.get(&id))
            .map(|record| record.status)
            .or_else(|| self.evicted.get(&id).copied())
    }

    fn record(&self, id: TaskId) -> Option<&TaskRecord> {
        self.active.get(&id).or_else(|| self.finished.get(&id))
    }

    fn dependencies_met(&self, dependencies: &[TaskId]) -> bool {
        dependencies
            .iter()
            .all(|dep| self.status_of(*dep) == Some(TaskStatus::Completed))
    }

    /// Moves a task into the completed store, evicting the oldest entries
    /// beyond `retention`.
    fn retire(&mut self, id: TaskId, retention: usize) {
        let Some(record) = self.active.remove(&id) else {
            return;
        };
        self.finished.insert(id, record);
        self.finished_order.push_back(id);

        while self.finished.len() > retention {
            let Some(oldest) = self.finished_order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.finished.remove(&oldest) {
                debug!("Evicting {} from completed store", oldest);
                self.evicted.insert(oldest, evicted.status);
            }
        }
    }

    /// Queues every waiting task whose dependencies have all completed.
    fn promote_waiting(&mut self) -> usize {
        let promotable: Vec<(TaskId, Priority, u64)> = self
            .active
            .values()
            .filter(|r| r.status == TaskStatus::Waiting)
            .filter(|r| self.dependencies_met(&r.task.dependencies))
            .map(|r| (r.id, r.task.priority, r.sequence))
            .collect();

        for (id, priority, sequence) in &promotable {
            if let Some(record) = self.active.get_mut(id) {
                record.status = TaskStatus::Pending;
                debug!("Dependencies met for '{}' ({}); queued", record.task.name, id);
            }
            self.ready.push(*id, *priority, *sequence);
        }
        promotable.len()
    }

    /// Queues retries whose backoff has elapsed and returns the next
    /// deadline still pending.
    fn release_backoffs(&mut self, now: Instant) -> Option<Instant> {
        while let Some(Reverse((due, id))) = self.backoff.peek().copied() {
            if due > now {
                return Some(due);
            }
            self.backoff.pop();

            let entry = self
                .active
                .get(&id)
                .filter(|record| record.status == TaskStatus::Pending)
                .map(|record| (record.task.priority, record.sequence));
            if let Some((priority, sequence)) = entry {
                debug!("Backoff elapsed for {}; queued", id);
                self.ready.push(id, priority, sequence);
            }
        }
        None
    }

    /// True once no awaited task can make further progress. Before
    /// `start()` nothing runs, so queued tasks count as stuck too.
    fn is_stalled(&self) -> bool {
        let idle = self.running == 0 && (self.backoff.is_empty() || self.shutdown);
        idle && (self.ready.is_empty() || self.shutdown || !self.started)
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    work_available: Condvar,
    state_changed: Condvar,
    retry: RetryPolicy,
    retention: usize,
    worker_count: usize,
    sleeper: Arc<dyn Sleeper>,
    resources: Option<Arc<ResourceManager>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Concurrency currently admitted: the full pool, or half of it while
    /// the resource manager reports pressure.
    fn admitted_concurrency(&self) -> usize {
        match &self.resources {
            Some(resources) if !resources.latest_within_limits() => {
                (self.worker_count / 2).max(1)
            }
            _ => self.worker_count,
        }
    }
}

/// Dependency-aware scheduler backed by a pool of worker threads.
///
/// # Example
///
/// ```rust
/// use taskforge::scheduler::{SchedulerConfig, TaskScheduler};
/// use taskforge::task::{unit, Priority, Task};
///
/// let scheduler = TaskScheduler::new(SchedulerConfig::default());
/// let fetch = scheduler
///     .submit(Task::new("fetch", unit(|_| Ok(serde_json::json!("page")))).with_priority(Priority::High))
///     .unwrap();
/// let parse = scheduler
///     .submit(Task::new("parse", unit(|_| Ok(serde_json::json!(3)))).depends_on(fetch))
///     .unwrap();
///
/// scheduler.start();
/// assert!(scheduler.await_completion(Some(&[fetch, parse]), None));
/// scheduler.shutdown();
/// ```
pub struct TaskScheduler {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Creates a scheduler that sleeps real time between retries.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_sleeper(config, Arc::new(ThreadSleeper))
    }

    /// Creates a scheduler with an injected backoff sleeper.
    pub fn with_sleeper(config: SchedulerConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self::build(config, sleeper, None)
    }

    /// Creates a scheduler that halves its admitted concurrency while the
    /// resource manager's latest reading breaches its thresholds.
    pub fn with_resources(
        config: SchedulerConfig,
        sleeper: Arc<dyn Sleeper>,
        resources: Arc<ResourceManager>,
    ) -> Self {
        Self::build(config, sleeper, Some(resources))
    }

    fn build(
        config: SchedulerConfig,
        sleeper: Arc<dyn Sleeper>,
        resources: Option<Arc<ResourceManager>>,
    ) -> Self {
        let shared = Shared {
            state: Mutex::new(SchedulerState::default()),
            work_available: Condvar::new(),
            state_changed: Condvar::new(),
            retry: config.retry,
            retention: config.completed_retention.max(1),
            worker_count: config.workers.max(1),
            sleeper,
            resources,
        };

        Self {
            shared: Arc::new(shared),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads in the pool.
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// Spawns the worker pool. Calling it again has no effect.
    ///
    /// Returns the number of workers running.
    pub fn start(&self) -> usize {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.shared.lock();
            if state.started || state.shutdown {
                return handles.len();
            }
            state.started = true;
        }

        for index in 0..self.shared.worker_count {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("scheduler-worker-{}", index))
                .spawn(move || worker_loop(shared));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Failed to spawn scheduler worker {}: {}", index, e),
            }
        }

        info!("Scheduler started with {} workers", handles.len());
        handles.len()
    }

    /// Submits a task.
    ///
    /// Every dependency must name a task this scheduler already knows,
    /// whether still pending or already finished. A task whose
    /// dependencies are all completed is queued at once; otherwise it
    /// waits.
    pub fn submit(&self, task: Task) -> Result<TaskId, SchedulerError> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(SchedulerError::ShutDown);
        }

        for dep in &task.dependencies {
            if state.status_of(*dep).is_none() {
                return Err(SchedulerError::DependencyNotFound {
                    task: task.name.clone(),
                    dependency: *dep,
                });
            }
        }

        state.next_id += 1;
        let sequence = state.next_id;
        let id = TaskId::from_raw(sequence);

        let ready = state.dependencies_met(&task.dependencies);
        let status = if ready {
            TaskStatus::Pending
        } else {
            TaskStatus::Waiting
        };

        debug!(
            "Submitted '{}' as {} (priority: {}, status: {})",
            task.name, id, task.priority, status
        );

        if ready {
            state.ready.push(id, task.priority, sequence);
        }
        state.active.insert(
            id,
            TaskRecord {
                id,
                task,
                sequence,
                status,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                attempts: 0,
                result: None,
                error: None,
                history: Vec::new(),
            },
        );
        drop(state);

        if ready {
            self.shared.work_available.notify_one();
        }
        self.shared.state_changed.notify_all();
        Ok(id)
    }

    /// Cancels a task that has not started running.
    ///
    /// Returns false (and changes nothing) if the task is running, already
    /// finished, or unknown.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        let Some(record) = state.active.get_mut(&id) else {
            return false;
        };
        if !matches!(record.status, TaskStatus::Pending | TaskStatus::Waiting) {
            debug!("Cannot cancel {} while {}", id, record.status);
            return false;
        }

        record.status = TaskStatus::Cancelled;
        record.completed_at = Some(Utc::now());
        info!("Cancelled task '{}' ({})", record.task.name, id);

        state.ready.remove(id);
        state.backoff.retain(|Reverse((_, pending))| *pending != id);
        state.retire(id, self.shared.retention);
        drop(guard);

        self.shared.state_changed.notify_all();
        true
    }

    /// Blocks until the given tasks (or every known task) are terminal.
    ///
    /// Returns false if `timeout` elapses first, if an id is unknown, or
    /// as soon as the remaining tasks can no longer progress (for example
    /// dependents of a failed task, which stay `WAITING`, or queued tasks
    /// of a scheduler that was never started).
    pub fn await_completion(&self, ids: Option<&[TaskId]>, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();

        loop {
            let done = match ids {
                Some(ids) => {
                    let mut all_terminal = true;
                    for id in ids {
                        match state.status_of(*id) {
                            None => {
                                warn!("Awaiting unknown task {}", id);
                                return false;
                            }
                            Some(status) if !status.is_terminal() => all_terminal = false,
                            Some(_) => {}
                        }
                    }
                    all_terminal
                }
                None => state.active.is_empty(),
            };

            if done {
                return true;
            }
            if state.is_stalled() {
                debug!("Awaited tasks cannot progress further");
                return false;
            }

            state = match deadline {
                None => self
                    .shared
                    .state_changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.shared
                        .state_changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Current status of a task.
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.shared.lock().status_of(id)
    }

    /// Snapshot of a task's runtime state.
    pub fn task(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.shared.lock().record(id).map(TaskRecord::snapshot)
    }

    /// Like [`task`](Self::task), but an unknown or evicted id is an error.
    pub fn lookup(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.task(id).ok_or(SchedulerError::TaskNotFound(id))
    }

    /// Every recorded attempt of a task, oldest first.
    pub fn history(&self, id: TaskId) -> Vec<ExecutionResult> {
        self.shared
            .lock()
            .record(id)
            .map(|record| record.history.clone())
            .unwrap_or_default()
    }

    /// The most recent attempt of a task.
    pub fn result(&self, id: TaskId) -> Option<ExecutionResult> {
        self.shared
            .lock()
            .record(id)
            .and_then(|record| record.history.last().cloned())
    }

    /// Counts of tasks by status, including evicted ones.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        let mut stats = SchedulerStats::default();

        for record in state.active.values().chain(state.finished.values()) {
            stats.count(record.status);
        }
        for status in state.evicted.values() {
            stats.count(*status);
        }
        stats
    }

    /// Snapshots of the completed store, in completion order.
    pub fn export_completed(&self) -> Vec<TaskSnapshot> {
        let state = self.shared.lock();
        state
            .finished_order
            .iter()
            .filter_map(|id| state.finished.get(id))
            .map(TaskRecord::snapshot)
            .collect()
    }

    /// Stops accepting work and joins the workers.
    ///
    /// Running attempts finish first; queued and backing-off tasks stay
    /// `PENDING`.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            if !state.backoff.is_empty() {
                debug!("Dropping {} pending retries", state.backoff.len());
                state.backoff.clear();
            }
        }
        self.shared.work_available.notify_all();
        self.shared.state_changed.notify_all();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for handle in handles {
            if handle.join().is_err() {
                error!("Scheduler worker panicked");
            }
        }
        info!("Scheduler shut down");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    while let Some(job) = next_job(&shared) {
        let ctx = TaskContext::new(job.name.clone(), job.attempt);
        let result = invoke(&job.unit, ctx, job.timeout);
        finish_job(&shared, job, result);
    }
}

/// Blocks until a task can be claimed or the scheduler shuts down.
fn next_job(shared: &Shared) -> Option<Job> {
    loop {
        let admitted = shared.admitted_concurrency();
        let mut guard = shared.lock();

        if guard.shutdown {
            return None;
        }
        let next_due = guard.release_backoffs(Instant::now());

        if guard.running < admitted {
            let state = &mut *guard;
            while let Some(id) = state.ready.pop() {
                let Some(record) = state.active.get_mut(&id) else {
                    continue;
                };
                if record.status != TaskStatus::Pending {
                    continue;
                }

                record.status = TaskStatus::Running;
                record.attempts += 1;
                record.started_at.get_or_insert_with(Utc::now);

                let job = Job {
                    id,
                    name: record.task.name.clone(),
                    unit: Arc::clone(&record.task.unit),
                    timeout: record.task.timeout,
                    attempt: record.attempts,
                    budget: record.task.attempt_budget(),
                };
                state.running += 1;
                drop(guard);

                info!("Running '{}' ({}, attempt {}/{})", job.name, id, job.attempt, job.budget);
                shared.state_changed.notify_all();
                return Some(job);
            }
        } else {
            debug!("Admission limited to {} concurrent tasks", admitted);
        }

        let wait = next_due
            .map(|due| due.saturating_duration_since(Instant::now()))
            .map_or(ADMISSION_RECHECK_INTERVAL, |d| d.min(ADMISSION_RECHECK_INTERVAL));
        let _ = shared
            .work_available
            .wait_timeout(guard, wait)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Records an attempt's outcome and advances the task's state machine.
fn finish_job(shared: &Shared, job: Job, result: ExecutionResult) {
    let mut guard = shared.lock();
    let state = &mut *guard;
    state.running = state.running.saturating_sub(1);

    let Some(record) = state.active.get_mut(&job.id) else {
        warn!("Ignoring late result for {}", job.id);
        return;
    };

    let success = result.success;
    record.error = result.error.clone();
    record.history.push(result);

    if success {
        record.status = TaskStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.result = record.history.last().and_then(|r| r.result.clone());
        info!("Task '{}' completed", job.name);

        state.retire(job.id, shared.retention);
        let promoted = state.promote_waiting();
        drop(guard);

        for _ in 0..promoted {
            shared.work_available.notify_one();
        }
        // A freed slot may admit already-queued work
        shared.work_available.notify_one();
        shared.state_changed.notify_all();
        return;
    }

    if job.attempt < job.budget {
        record.status = TaskStatus::Pending;
        let delay = shared.retry.delay(job.attempt);
        warn!(
            "Task '{}' failed attempt {}/{}: {}; retrying in {:.2?}",
            job.name,
            job.attempt,
            job.budget,
            record.error.as_ref().map(ToString::to_string).unwrap_or_default(),
            delay
        );

        let due = Instant::now() + shared.sleeper.defer(delay);
        state.backoff.push(Reverse((due, job.id)));
        drop(guard);

        // Idle workers recompute when to wake
        shared.work_available.notify_all();
        shared.state_changed.notify_all();
        return;
    }

    record.status = TaskStatus::Failed;
    record.completed_at = Some(Utc::now());
    error!(
        "Task '{}' failed after {} attempts: {}",
        job.name,
        job.attempt,
        record.error.as_ref().map(ToString::to_string).unwrap_or_default()
    );

    state.retire(job.id, shared.retention);
    drop(guard);
    shared.work_available.notify_one();
    shared.state_changed.notify_all();
}
