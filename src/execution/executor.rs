//! Parallel Executor
//!
//! Runs a flat list of independent task invocations across a bounded
//! pool of worker threads. There is no dependency resolution here; use
//! the [`TaskScheduler`](crate::scheduler::TaskScheduler) when ordering
//! matters.
//!
//! Before each call the [`ResourceManager`] is consulted. A constrained
//! host halves the worker count for that call only. With batching, the
//! check is repeated between batches and a short pause is inserted while
//! the host stays constrained.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::monitoring::ResourceManager;
use crate::scheduler::{Sleeper, ThreadSleeper};
use crate::task::{invoke, CancellationToken, ExecutionResult, TaskContext, TaskFn};

/// Default pause between batches while the host is constrained.
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_secs(2);

/// How invocations are spread over workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Up to the configured worker count
    #[default]
    Threaded,
    /// Additionally capped at the number of CPU cores
    CpuBound,
}

/// One named unit of work for [`ParallelExecutor::execute_all`].
#[derive(Clone)]
pub struct TaskInvocation {
    pub name: String,
    pub unit: TaskFn,
    pub timeout: Option<Duration>,
}

impl TaskInvocation {
    pub fn new(name: impl Into<String>, unit: TaskFn) -> Self {
        Self {
            name: name.into(),
            unit,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for TaskInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskInvocation")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Running totals across all calls since construction or the last reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub completed: u64,
    pub failed: u64,
    /// Invocations skipped by [`ParallelExecutor::cancel_all`]
    pub cancelled: u64,
    /// Sum of invocation durations
    pub total_time: Duration,
    /// Completed over completed plus failed, 0.0 when nothing has run
    pub success_rate: f64,
    pub average_duration: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    total_time: Duration,
}

/// Bounded-concurrency runner for independent invocations.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use serde_json::json;
/// use taskforge::execution::{ExecutionMode, ParallelExecutor, TaskInvocation};
/// use taskforge::monitoring::{ResourceManager, ResourceThresholds, StaticProbe};
/// use taskforge::task::unit;
///
/// let resources = Arc::new(ResourceManager::with_probe(
///     ResourceThresholds::default(),
///     4,
///     Arc::new(StaticProbe::idle()),
/// ));
/// let executor = ParallelExecutor::new(4, resources);
///
/// let tasks = vec![
///     TaskInvocation::new("ping", unit(|_| Ok(json!("pong")))),
///     TaskInvocation::new("fail", unit(|_| Err("unreachable".into()))),
/// ];
/// let results = executor.execute_all(tasks, ExecutionMode::Threaded, None);
///
/// assert!(results["ping"].success);
/// assert!(!results["fail"].success);
/// ```
pub struct ParallelExecutor {
    max_workers: usize,
    cpu_count: usize,
    resources: Arc<ResourceManager>,
    sleeper: Arc<dyn Sleeper>,
    batch_pause: Duration,
    default_timeout: Option<Duration>,
    counters: Mutex<Counters>,
    generation: AtomicU64,
    last_workers: AtomicUsize,
    next_slot: AtomicU64,
    in_flight: Mutex<HashMap<u64, CancellationToken>>,
}

impl ParallelExecutor {
    pub fn new(max_workers: usize, resources: Arc<ResourceManager>) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            cpu_count: num_cpus::get().max(1),
            resources,
            sleeper: Arc::new(ThreadSleeper),
            batch_pause: DEFAULT_BATCH_PAUSE,
            default_timeout: None,
            counters: Mutex::new(Counters::default()),
            generation: AtomicU64::new(0),
            last_workers: AtomicUsize::new(max_workers),
            next_slot: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Builds an executor from the worker ceiling and executor settings.
    pub fn from_config(config: &Config, resources: Arc<ResourceManager>) -> Self {
        Self::new(config.max_concurrent_tasks, resources)
            .with_batch_pause(config.batch_pause())
            .with_default_timeout(config.default_timeout())
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_batch_pause(mut self, pause: Duration) -> Self {
        self.batch_pause = pause;
        self
    }

    /// Timeout applied to invocations that don't carry their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Overrides the detected core count used by [`ExecutionMode::CpuBound`].
    pub fn with_cpu_count(mut self, cpus: usize) -> Self {
        self.cpu_count = cpus.max(1);
        self
    }

    /// Configured worker ceiling. Never changed by resource pressure.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Worker count used by the most recent batch.
    pub fn last_worker_count(&self) -> usize {
        self.last_workers.load(Ordering::SeqCst)
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn workers_for(&self, mode: ExecutionMode, constrained: bool) -> usize {
        let ceiling = match mode {
            ExecutionMode::Threaded => self.max_workers,
            ExecutionMode::CpuBound => self.max_workers.min(self.cpu_count),
        };
        if constrained {
            (ceiling / 2).max(1)
        } else {
            ceiling
        }
    }

    /// Runs every invocation and returns one result per name.
    ///
    /// Failures, timeouts and panics are captured in the results; this
    /// never fails as a whole. Invocations sharing a name overwrite each
    /// other's entry.
    pub fn execute_all(
        &self,
        tasks: Vec<TaskInvocation>,
        mode: ExecutionMode,
        batch_size: Option<usize>,
    ) -> HashMap<String, ExecutionResult> {
        let mut results = HashMap::with_capacity(tasks.len());
        if tasks.is_empty() {
            return results;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let total = tasks.len();

        let batches: Vec<Vec<TaskInvocation>> = match batch_size {
            Some(size) if size > 0 && total > size => {
                let mut remaining = tasks.into_iter();
                let mut batches = Vec::with_capacity(total.div_ceil(size));
                loop {
                    let batch: Vec<_> = remaining.by_ref().take(size).collect();
                    if batch.is_empty() {
                        break;
                    }
                    batches.push(batch);
                }
                batches
            }
            _ => vec![tasks],
        };
        let batch_count = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let constrained = !self.resources.check_resources();
            if constrained {
                if index == 0 {
                    warn!("Resources constrained; halving workers for this call");
                } else {
                    warn!(
                        "Resources constrained before batch {}/{}; pausing {:?}",
                        index + 1,
                        batch_count,
                        self.batch_pause
                    );
                    self.sleeper.sleep(self.batch_pause);
                }
            }

            let workers = self.workers_for(mode, constrained).min(batch.len());
            self.last_workers.store(workers, Ordering::SeqCst);

            info!(
                "Executing batch {}/{} ({} tasks, {} workers)",
                index + 1,
                batch_count,
                batch.len(),
                workers
            );

            for (name, result) in self.run_batch(batch, workers, generation) {
                if results.insert(name.clone(), result).is_some() {
                    warn!("Duplicate task name '{}'; keeping the latest result", name);
                }
            }
        }

        results
    }

    fn run_batch(
        &self,
        batch: Vec<TaskInvocation>,
        workers: usize,
        generation: u64,
    ) -> Vec<(String, ExecutionResult)> {
        let queue = Mutex::new(VecDeque::from(batch));
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(invocation) = next else {
                        break;
                    };
                    let result = self.run_one(&invocation, generation);
                    if tx.send((invocation.name, result)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);
            rx.into_iter().collect()
        })
    }

    fn run_one(&self, invocation: &TaskInvocation, generation: u64) -> ExecutionResult {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Skipping '{}': executor cancelled", invocation.name);
            self.counters().cancelled += 1;
            return ExecutionResult::cancelled(&invocation.name);
        }

        let token = CancellationToken::new();
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        self.in_flight().insert(slot, token.clone());

        let ctx = TaskContext::new(&invocation.name, 1).with_token(token);
        let timeout = invocation.timeout.or(self.default_timeout);
        let result = invoke(&invocation.unit, ctx, timeout);

        self.in_flight().remove(&slot);

        let mut counters = self.counters();
        counters.total_time += result.duration;
        if result.success {
            counters.completed += 1;
            debug!("Task '{}' completed in {:?}", invocation.name, result.duration);
        } else {
            counters.failed += 1;
            warn!(
                "Task '{}' failed: {}",
                invocation.name,
                result.error_message().unwrap_or_default()
            );
        }
        result
    }

    /// Success rate and timing totals.
    pub fn get_stats(&self) -> ExecutorStats {
        let counters = self.counters();
        let finished = counters.completed + counters.failed;
        let (success_rate, average_duration) = if finished == 0 {
            (0.0, Duration::ZERO)
        } else {
            (
                counters.completed as f64 / finished as f64,
                average(counters.total_time, finished),
            )
        };

        ExecutorStats {
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            total_time: counters.total_time,
            success_rate,
            average_duration,
        }
    }

    pub fn reset_stats(&self) {
        *self.counters() = Counters::default();
    }

    /// Abandons outstanding work.
    ///
    /// Invocations not yet started by a call in progress are skipped and
    /// reported as cancelled. Running invocations have their token
    /// cancelled and stop only if they poll it. Returns how many running
    /// invocations were signalled.
    pub fn cancel_all(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let tokens: Vec<_> = self.in_flight().drain().map(|(_, token)| token).collect();
        for token in &tokens {
            token.cancel();
        }
        info!("Cancelled executor work ({} running)", tokens.len());
        tokens.len()
    }
}

/// Mean of `count` durations summing to `total`, for counts past `u32`.
fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(total.as_secs_f64() / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{ResourceSnapshot, ResourceThresholds, StaticProbe};
    use crate::scheduler::RecordingSleeper;
    use crate::task::{unit, TaskError};
    use serde_json::json;
    use std::time::Instant;

    fn resources(probe: Arc<StaticProbe>) -> Arc<ResourceManager> {
        Arc::new(ResourceManager::with_probe(
            ResourceThresholds::default(),
            8,
            probe,
        ))
    }

    fn idle_executor(workers: usize) -> ParallelExecutor {
        ParallelExecutor::new(workers, resources(Arc::new(StaticProbe::idle())))
    }

    /// Invocations that sleep and record the peak number running at once.
    fn tracked(count: usize, peak: &Arc<AtomicUsize>) -> Vec<TaskInvocation> {
        let current = Arc::new(AtomicUsize::new(0));
        (0..count)
            .map(|i| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(peak);
                TaskInvocation::new(
                    format!("t{}", i),
                    unit(move |_| {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(30));
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(i))
                    }),
                )
            })
            .collect()
    }

    #[test]
    fn test_results_keyed_by_name() {
        let executor = idle_executor(4);
        let tasks = vec![
            TaskInvocation::new("a", unit(|_| Ok(json!(1)))),
            TaskInvocation::new("b", unit(|_| Err("boom".into()))),
            TaskInvocation::new("c", unit(|_| panic!("kaboom"))),
        ];

        let results = executor.execute_all(tasks, ExecutionMode::Threaded, None);
        assert_eq!(results.len(), 3);
        assert_eq!(results["a"].result, Some(json!(1)));
        assert_eq!(results["b"].error, Some(TaskError::Execution("boom".to_string())));
        assert!(matches!(results["c"].error, Some(TaskError::Panicked(_))));
    }

    #[test]
    fn test_empty_input() {
        let executor = idle_executor(2);
        assert!(executor
            .execute_all(Vec::new(), ExecutionMode::Threaded, Some(3))
            .is_empty());
    }

    #[test]
    fn test_concurrency_bounded_by_workers() {
        let executor = idle_executor(3);
        let peak = Arc::new(AtomicUsize::new(0));

        let results = executor.execute_all(tracked(9, &peak), ExecutionMode::Threaded, None);
        assert_eq!(results.len(), 9);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(executor.last_worker_count(), 3);
    }

    #[test]
    fn test_constraint_halves_workers_for_one_call() {
        let probe = Arc::new(StaticProbe::new(ResourceSnapshot::idle().with_cpu(95.0)));
        let executor = ParallelExecutor::new(4, resources(probe.clone()));
        let peak = Arc::new(AtomicUsize::new(0));

        executor.execute_all(tracked(6, &peak), ExecutionMode::Threaded, None);
        assert_eq!(executor.last_worker_count(), 2);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.max_workers(), 4);

        probe.set(ResourceSnapshot::idle());
        executor.execute_all(tracked(6, &Arc::new(AtomicUsize::new(0))), ExecutionMode::Threaded, None);
        assert_eq!(executor.last_worker_count(), 4);
    }

    #[test]
    fn test_halving_never_below_one() {
        let probe = Arc::new(StaticProbe::new(ResourceSnapshot::degraded()));
        let executor = ParallelExecutor::new(1, resources(probe));

        let results = executor.execute_all(
            vec![TaskInvocation::new("only", unit(|_| Ok(json!(null))))],
            ExecutionMode::Threaded,
            None,
        );
        assert!(results["only"].success);
        assert_eq!(executor.last_worker_count(), 1);
    }

    #[test]
    fn test_cpu_bound_capped_at_cores() {
        let executor = idle_executor(8).with_cpu_count(2);
        let peak = Arc::new(AtomicUsize::new(0));

        executor.execute_all(tracked(6, &peak), ExecutionMode::CpuBound, None);
        assert_eq!(executor.last_worker_count(), 2);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_batches_pause_only_when_constrained() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let probe = Arc::new(StaticProbe::idle());
        let executor = ParallelExecutor::new(2, resources(probe.clone()))
            .with_sleeper(sleeper.clone())
            .with_batch_pause(Duration::from_millis(2000));

        let results = executor.execute_all(
            tracked(5, &Arc::new(AtomicUsize::new(0))),
            ExecutionMode::Threaded,
            Some(2),
        );
        assert_eq!(results.len(), 5);
        assert!(sleeper.delays().is_empty());

        probe.set(ResourceSnapshot::idle().with_memory(95.0));
        let results = executor.execute_all(
            tracked(5, &Arc::new(AtomicUsize::new(0))),
            ExecutionMode::Threaded,
            Some(2),
        );
        assert_eq!(results.len(), 5);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(2000), Duration::from_millis(2000)]
        );
    }

    #[test]
    fn test_timeout_is_reported() {
        let executor = idle_executor(2);
        let tasks = vec![
            TaskInvocation::new(
                "slow",
                unit(|_| {
                    thread::sleep(Duration::from_millis(500));
                    Ok(json!("late"))
                }),
            )
            .with_timeout(Duration::from_millis(50)),
            TaskInvocation::new("fast", unit(|_| Ok(json!("ok")))),
        ];

        let started = Instant::now();
        let results = executor.execute_all(tasks, ExecutionMode::Threaded, None);
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(results["slow"].timed_out());
        assert!(results["fast"].success);
    }

    #[test]
    fn test_default_timeout_applies() {
        let executor = idle_executor(1).with_default_timeout(Some(Duration::from_millis(20)));
        let results = executor.execute_all(
            vec![TaskInvocation::new(
                "slow",
                unit(|_| {
                    thread::sleep(Duration::from_millis(300));
                    Ok(json!(null))
                }),
            )],
            ExecutionMode::Threaded,
            None,
        );
        assert!(results["slow"].timed_out());
    }

    #[test]
    fn test_stats_accumulate_and_reset() {
        let executor = idle_executor(2);
        let tasks = vec![
            TaskInvocation::new("ok1", unit(|_| Ok(json!(1)))),
            TaskInvocation::new("ok2", unit(|_| Ok(json!(2)))),
            TaskInvocation::new("ok3", unit(|_| Ok(json!(3)))),
            TaskInvocation::new("bad", unit(|_| Err("nope".into()))),
        ];
        executor.execute_all(tasks, ExecutionMode::Threaded, None);

        let stats = executor.get_stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.average_duration, stats.total_time / 4);

        executor.reset_stats();
        assert_eq!(executor.get_stats(), ExecutorStats::default());
    }

    #[test]
    fn test_average_duration_handles_large_counts() {
        assert_eq!(average(Duration::from_secs(3), 2), Duration::from_millis(1500));
        assert_eq!(average(Duration::from_secs(5), 0), Duration::ZERO);

        // Would wrap to zero as a u32 divisor
        let count = u64::from(u32::MAX) + 1;
        assert_eq!(average(Duration::from_secs(1 << 33), count), Duration::from_secs(2));
    }

    #[test]
    fn test_cancel_all_skips_unstarted_work() {
        let executor = Arc::new(idle_executor(1));
        let handle = Arc::clone(&executor);

        let tasks = vec![
            TaskInvocation::new(
                "first",
                unit(move |ctx| {
                    handle.cancel_all();
                    Ok(json!(ctx.is_cancelled()))
                }),
            ),
            TaskInvocation::new("second", unit(|_| Ok(json!("ran")))),
            TaskInvocation::new("third", unit(|_| Ok(json!("ran")))),
        ];

        let results = executor.execute_all(tasks, ExecutionMode::Threaded, None);
        assert!(results["first"].success);
        assert_eq!(results["first"].result, Some(json!(true)));
        assert_eq!(results["second"].error, Some(TaskError::Cancelled));
        assert_eq!(results["third"].error, Some(TaskError::Cancelled));
        assert_eq!(executor.get_stats().cancelled, 2);

        // Later calls are unaffected
        let results = executor.execute_all(
            vec![TaskInvocation::new("again", unit(|_| Ok(json!("ran"))))],
            ExecutionMode::Threaded,
            None,
        );
        assert!(results["again"].success);
    }

    #[test]
    fn test_duplicate_names_keep_latest() {
        let executor = idle_executor(1);
        let tasks = vec![
            TaskInvocation::new("dup", unit(|_| Ok(json!(1)))),
            TaskInvocation::new("dup", unit(|_| Ok(json!(2)))),
        ];
        let results = executor.execute_all(tasks, ExecutionMode::Threaded, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results["dup"].result, Some(json!(2)));
    }
}
