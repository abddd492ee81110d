//! Workflow Orchestrator
//!
//! Walks the phase state machine for one target at a time:
//!
//! 1. Skips phases that are disabled, already committed, or unauthorized
//! 2. Collects task descriptors from the phase's registered modules
//! 3. Runs them on the [`ParallelExecutor`], or on the [`TaskScheduler`]
//!    when any descriptor declares intra-phase dependencies
//! 4. Commits the phase's results once every task has returned
//!
//! Failed tasks never abort a run; a phase in which every task failed is
//! flagged in its [`PhaseResult`]. Only module errors, invalid state
//! transitions and checkpoint I/O failures move the run to FAILED.
//!
//! Pausing takes effect at the next phase boundary. A pause flag file,
//! when configured, pauses the run for as long as the file exists.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::config::Config;
use crate::error::{ConfigError, WorkflowError};
use crate::execution::{ExecutionMode, ExecutorStats, ParallelExecutor, TaskInvocation};
use crate::monitoring::{PhaseEvent, PhaseTimeline, ResourceManager, ResourceSnapshot};
use crate::scheduler::{SchedulerStats, TaskScheduler, ThreadSleeper};
use crate::task::{Task, TaskId, TaskStatus};

use super::auth::Authorizer;
use super::checkpoint::WorkflowCheckpoint;
use super::module::{PhaseModule, TaskDescriptor};
use super::phase::Phase;
use super::report::{PhaseResult, SkipReason, SkippedPhase, WorkflowReport};
use super::state::{StateMachine, WorkflowState};

/// How often a paused run re-checks the pause flag file.
const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub state: WorkflowState,
    pub target: Option<String>,
    pub elapsed: Duration,
    /// Names of committed phases, in execution order
    pub phases: Vec<String>,
    pub paused: bool,
    pub resources: Option<ResourceSnapshot>,
    pub average_cpu: f32,
    pub peak_memory: f32,
    pub executor: ExecutorStats,
    pub scheduler: SchedulerStats,
}

#[derive(Default)]
struct RunState {
    machine: StateMachine,
    target: Option<String>,
    started: Option<Instant>,
    /// Frozen once the run ends
    elapsed: Option<Duration>,
    committed: BTreeMap<Phase, PhaseResult>,
    skipped: Vec<SkippedPhase>,
    timeline: PhaseTimeline,
}

impl RunState {
    fn resume(checkpoint: &WorkflowCheckpoint) -> Self {
        let committed: BTreeMap<_, _> = checkpoint
            .phases
            .iter()
            .map(|p| (p.phase, p.clone()))
            .collect();
        let last = committed.keys().next_back().copied();

        Self {
            machine: StateMachine::new(WorkflowState::settled_after(last)),
            target: Some(checkpoint.target.clone()),
            started: Some(Instant::now()),
            elapsed: None,
            committed,
            skipped: Vec::new(),
            timeline: PhaseTimeline::new(),
        }
    }

    fn last_committed(&self) -> Option<Phase> {
        self.committed.keys().next_back().copied()
    }

    fn elapsed(&self) -> Duration {
        self.elapsed
            .or_else(|| self.started.map(|s| s.elapsed()))
            .unwrap_or_default()
    }
}

/// Resets the in-progress flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sequences workflow phases for a target.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use serde_json::json;
/// use taskforge::config::Config;
/// use taskforge::monitoring::{ResourceManager, StaticProbe};
/// use taskforge::task::unit;
/// use taskforge::workflow::{DenyAll, Phase, TaskDescriptor, TaskList, WorkflowOrchestrator};
///
/// let mut config = Config::default();
/// config.monitoring.enabled = false;
/// let resources = Arc::new(ResourceManager::with_probe(
///     config.thresholds.clone(),
///     config.max_concurrent_tasks,
///     Arc::new(StaticProbe::idle()),
/// ));
///
/// let mut orchestrator =
///     WorkflowOrchestrator::with_resources(config, resources, Arc::new(DenyAll)).unwrap();
/// orchestrator.register_module(
///     Phase::Recon,
///     TaskList::new("dns", vec![TaskDescriptor::new("lookup", unit(|_| Ok(json!("10.0.0.5"))))]),
/// );
///
/// let report = orchestrator.run("app.example").unwrap();
/// assert!(report.is_complete());
/// assert_eq!(report.phase_names(), vec!["recon", "vulnerability", "reporting"]);
/// ```
pub struct WorkflowOrchestrator {
    config: Config,
    executor: Arc<ParallelExecutor>,
    scheduler: Arc<TaskScheduler>,
    resources: Arc<ResourceManager>,
    authorizer: Arc<dyn Authorizer>,
    modules: BTreeMap<Phase, Vec<Arc<dyn PhaseModule>>>,
    pause_flag: Option<PathBuf>,
    checkpoint_path: Option<PathBuf>,
    run: Mutex<RunState>,
    pause_requested: Mutex<bool>,
    resumed: Condvar,
    running: AtomicBool,
}

impl WorkflowOrchestrator {
    /// Assembles an orchestrator from explicitly constructed parts.
    pub fn new(
        config: Config,
        executor: Arc<ParallelExecutor>,
        scheduler: Arc<TaskScheduler>,
        resources: Arc<ResourceManager>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            config,
            executor,
            scheduler,
            resources,
            authorizer,
            modules: BTreeMap::new(),
            pause_flag: None,
            checkpoint_path: None,
            run: Mutex::new(RunState::default()),
            pause_requested: Mutex::new(false),
            resumed: Condvar::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Builds the resource manager, executor and scheduler from `config`.
    pub fn from_config(config: Config, authorizer: Arc<dyn Authorizer>) -> Result<Self, ConfigError> {
        config.validate()?;
        let resources = Arc::new(
            ResourceManager::new(config.thresholds.clone(), config.max_concurrent_tasks)
                .with_history_size(config.monitoring.history_size),
        );
        Self::with_resources(config, resources, authorizer)
    }

    /// Builds the executor and scheduler from `config` around an existing
    /// resource manager.
    pub fn with_resources(
        config: Config,
        resources: Arc<ResourceManager>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let executor = Arc::new(ParallelExecutor::from_config(&config, Arc::clone(&resources)));
        let scheduler = Arc::new(TaskScheduler::with_resources(
            config.scheduler_config(),
            Arc::new(ThreadSleeper),
            Arc::clone(&resources),
        ));
        Ok(Self::new(config, executor, scheduler, resources, authorizer))
    }

    /// Adds a module contributing tasks to `phase`.
    pub fn register_module<M>(&mut self, phase: Phase, module: M) -> &mut Self
    where
        M: PhaseModule + 'static,
    {
        debug!("Registered module '{}' for phase '{}'", module.name(), phase);
        self.modules.entry(phase).or_default().push(Arc::new(module));
        self
    }

    /// Pause while this file exists.
    pub fn with_pause_flag(mut self, path: impl Into<PathBuf>) -> Self {
        self.pause_flag = Some(path.into());
        self
    }

    /// Save a checkpoint after every committed phase.
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &Arc<ParallelExecutor> {
        &self.executor
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    fn run_state(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pause_lock(&self) -> MutexGuard<'_, bool> {
        self.pause_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs every phase for `target`.
    pub fn run(&self, target: &str) -> Result<WorkflowReport, WorkflowError> {
        self.run_from_checkpoint(WorkflowCheckpoint::new(target))
    }

    /// Runs the phases a checkpoint has not committed yet.
    pub fn run_from_checkpoint(
        &self,
        checkpoint: WorkflowCheckpoint,
    ) -> Result<WorkflowReport, WorkflowError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WorkflowError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let target = checkpoint.target.clone();
        *self.run_state() = RunState::resume(&checkpoint);

        match checkpoint.last_committed() {
            Some(last) => info!("Resuming workflow for '{}' after phase '{}'", target, last),
            None => info!("Starting workflow for '{}'", target),
        }

        let monitoring = self.config.monitoring.enabled
            && self.resources.start_monitoring(self.config.monitor_interval());
        self.scheduler.start();

        let outcome = self.drive(&target);

        if monitoring {
            self.resources.stop_monitoring();
        }

        let mut run = self.run_state();
        run.elapsed = Some(run.elapsed());

        match outcome {
            Ok(()) => {
                info!(
                    "Workflow for '{}' finished in {:.2?}",
                    target,
                    run.elapsed()
                );
                Ok(self.report(&run, target))
            }
            Err(e) => {
                error!("Workflow for '{}' failed: {}", target, e);
                run.machine.fail();
                Err(e)
            }
        }
    }

    fn drive(&self, target: &str) -> Result<(), WorkflowError> {
        for phase in Phase::ALL {
            self.wait_if_paused()?;

            if self.run_state().committed.contains_key(&phase) {
                debug!("Phase '{}' already committed", phase);
                self.skip(phase, SkipReason::Committed);
                continue;
            }
            if !self.config.phases.is_enabled(phase) {
                self.skip(phase, SkipReason::Disabled);
                continue;
            }
            if phase == Phase::PostExploitation
                && !self.run_state().committed.contains_key(&Phase::Exploitation)
            {
                self.skip(phase, SkipReason::PrerequisiteSkipped);
                continue;
            }
            if phase.is_sensitive() && !self.authorizer.verify(target, Some(phase.name())) {
                info!("Authorization denied for '{}' on '{}'", phase, target);
                self.skip(phase, SkipReason::Unauthorized);
                continue;
            }

            if phase == Phase::Exploitation {
                self.transition(WorkflowState::ExploitPending)?;
            }
            self.transition(phase.running_state())?;
            self.run_state().timeline.record(phase.name(), PhaseEvent::Started);
            info!("Phase '{}' started", phase);

            let result = match self.execute_phase(phase, target, Utc::now()) {
                Ok(result) => result,
                Err(e) => {
                    self.run_state().timeline.record(phase.name(), PhaseEvent::Failed);
                    return Err(e);
                }
            };
            self.commit(result)?;
        }

        if self.state() != WorkflowState::Complete {
            self.transition(WorkflowState::Complete)?;
        }
        Ok(())
    }

    /// Records a phase's results and moves to its completed state.
    fn commit(&self, result: PhaseResult) -> Result<(), WorkflowError> {
        let phase = result.phase;
        info!(
            "Phase '{}' complete: {} succeeded, {} failed, {} blocked",
            phase,
            result.succeeded,
            result.failed,
            result.blocked.len()
        );

        {
            let mut run = self.run_state();
            let event = if result.all_failed {
                PhaseEvent::Failed
            } else {
                PhaseEvent::Completed
            };
            run.timeline.record(phase.name(), event);
            run.committed.insert(phase, result);
            run.machine.transition(phase.complete_state())?;
        }

        if let Some(path) = &self.checkpoint_path {
            self.checkpoint().save(path)?;
        }
        Ok(())
    }

    fn skip(&self, phase: Phase, reason: SkipReason) {
        info!("Skipping phase '{}': {}", phase, reason);
        let mut run = self.run_state();
        run.skipped.push(SkippedPhase { phase, reason });
        if reason != SkipReason::Committed {
            run.timeline.record(phase.name(), PhaseEvent::Skipped);
        }
    }

    fn transition(&self, target: WorkflowState) -> Result<(), WorkflowError> {
        let mut run = self.run_state();
        debug!("Workflow state {} -> {}", run.machine.current(), target);
        run.machine.transition(target)
    }

    fn execute_phase(
        &self,
        phase: Phase,
        target: &str,
        started_at: DateTime<Utc>,
    ) -> Result<PhaseResult, WorkflowError> {
        let prior = self.run_state().committed.clone();

        let mut descriptors = Vec::new();
        for module in self.modules.get(&phase).into_iter().flatten() {
            let tasks = module
                .tasks(target, &prior)
                .map_err(|e| module_error(phase, format!("module '{}': {}", module.name(), e)))?;
            debug!(
                "Module '{}' contributed {} tasks to '{}'",
                module.name(),
                tasks.len(),
                phase
            );
            descriptors.extend(tasks);
        }

        if descriptors.is_empty() {
            info!("Phase '{}' has no tasks", phase);
            return Ok(PhaseResult::new(phase, BTreeMap::new(), Vec::new(), started_at));
        }

        let mut names = HashSet::new();
        for descriptor in &descriptors {
            if !names.insert(descriptor.name.as_str()) {
                return Err(module_error(
                    phase,
                    format!("duplicate task name '{}'", descriptor.name),
                ));
            }
        }

        if descriptors.iter().any(|d| !d.depends_on.is_empty()) {
            self.run_scheduled(phase, descriptors, started_at)
        } else {
            Ok(self.run_parallel(phase, descriptors, started_at))
        }
    }

    fn run_parallel(
        &self,
        phase: Phase,
        descriptors: Vec<TaskDescriptor>,
        started_at: DateTime<Utc>,
    ) -> PhaseResult {
        debug!("Phase '{}': {} independent tasks", phase, descriptors.len());
        let invocations = descriptors
            .into_iter()
            .map(|d| TaskInvocation {
                name: d.name,
                unit: d.unit,
                timeout: d.timeout,
            })
            .collect();

        let results = self.executor.execute_all(
            invocations,
            ExecutionMode::Threaded,
            self.config.executor.batch_size,
        );
        PhaseResult::new(phase, results.into_iter().collect(), Vec::new(), started_at)
    }

    fn run_scheduled(
        &self,
        phase: Phase,
        descriptors: Vec<TaskDescriptor>,
        started_at: DateTime<Utc>,
    ) -> Result<PhaseResult, WorkflowError> {
        let order = submission_order(phase, &descriptors)?;
        debug!("Phase '{}': {} tasks with dependencies", phase, descriptors.len());

        let default_timeout = self.config.default_timeout();
        let mut submitted: Vec<(String, TaskId)> = Vec::with_capacity(descriptors.len());
        let mut ids: HashMap<&str, TaskId> = HashMap::new();

        for index in order {
            let descriptor = &descriptors[index];
            let mut task = Task::new(&descriptor.name, Arc::clone(&descriptor.unit))
                .with_priority(descriptor.priority)
                .with_retries(
                    descriptor
                        .retries
                        .unwrap_or(self.config.retry.default_retries),
                );
            if let Some(timeout) = descriptor.timeout.or(default_timeout) {
                task = task.with_timeout(timeout);
            }
            for dep in &descriptor.depends_on {
                if let Some(id) = ids.get(dep.as_str()) {
                    task = task.depends_on(*id);
                }
            }

            match self.scheduler.submit(task) {
                Ok(id) => {
                    ids.insert(descriptor.name.as_str(), id);
                    submitted.push((descriptor.name.clone(), id));
                }
                Err(e) => {
                    for (_, id) in &submitted {
                        self.scheduler.cancel(*id);
                    }
                    return Err(e.into());
                }
            }
        }

        let task_ids: Vec<TaskId> = submitted.iter().map(|(_, id)| *id).collect();
        if !self
            .scheduler
            .await_completion(Some(&task_ids), self.config.phase_timeout())
        {
            warn!("Phase '{}' has tasks that cannot finish", phase);
        }

        let mut results = BTreeMap::new();
        let mut blocked = Vec::new();
        for (name, id) in submitted {
            let snapshot = match self.scheduler.lookup(id) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Task '{}' has no record: {}", name, e);
                    blocked.push(name);
                    continue;
                }
            };

            match snapshot.status {
                TaskStatus::Completed | TaskStatus::Failed => {
                    if let Some(result) = snapshot.history.last() {
                        results.insert(name, result.clone());
                    }
                }
                status => {
                    // Running tasks can't be cancelled; their late results are dropped
                    self.scheduler.cancel(id);
                    debug!("Task '{}' blocked ({})", name, status);
                    blocked.push(name);
                }
            }
        }

        Ok(PhaseResult::new(phase, results, blocked, started_at))
    }

    /// Blocks at a phase boundary while a pause is requested.
    fn wait_if_paused(&self) -> Result<(), WorkflowError> {
        if !self.pause_signalled(*self.pause_lock()) {
            return Ok(());
        }

        self.transition(WorkflowState::Paused)?;
        info!("Workflow paused");

        let mut requested = self.pause_lock();
        while self.pause_signalled(*requested) {
            requested = self
                .resumed
                .wait_timeout(requested, PAUSE_CHECK_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(requested);

        let last = self.run_state().last_committed();
        self.transition(WorkflowState::settled_after(last))?;
        info!("Workflow resumed");
        Ok(())
    }

    fn pause_signalled(&self, requested: bool) -> bool {
        requested || self.pause_flag.as_ref().is_some_and(|p| p.exists())
    }

    /// Requests a pause at the next phase boundary.
    ///
    /// A phase already running finishes first, so `PAUSED` is only ever
    /// entered from the settled state between two phases. The state
    /// machine itself also accepts `PAUSED` from the running states, for
    /// callers driving a [`StateMachine`](super::StateMachine) directly.
    pub fn pause(&self) {
        *self.pause_lock() = true;
        info!("Pause requested");
    }

    /// Clears a pause request. A pause flag file still holds the run.
    pub fn resume(&self) {
        *self.pause_lock() = false;
        self.resumed.notify_all();
        info!("Resume requested");
    }

    pub fn is_paused(&self) -> bool {
        self.state() == WorkflowState::Paused
    }

    pub fn state(&self) -> WorkflowState {
        self.run_state().machine.current()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_status(&self) -> WorkflowStatus {
        let run = self.run_state();
        WorkflowStatus {
            state: run.machine.current(),
            target: run.target.clone(),
            elapsed: run.elapsed(),
            phases: run.committed.keys().map(|p| p.name().to_string()).collect(),
            paused: run.machine.current() == WorkflowState::Paused
                || self.pause_signalled(*self.pause_lock()),
            resources: self.resources.latest(),
            average_cpu: self.resources.average_cpu(),
            peak_memory: self.resources.peak_memory_usage(),
            executor: self.executor.get_stats(),
            scheduler: self.scheduler.stats(),
        }
    }

    /// Committed phases so far, as a checkpoint.
    pub fn checkpoint(&self) -> WorkflowCheckpoint {
        let run = self.run_state();
        let mut checkpoint = WorkflowCheckpoint::new(run.target.clone().unwrap_or_default());
        for result in run.committed.values() {
            checkpoint.commit(result.clone());
        }
        checkpoint
    }

    /// Discards the last run's state. Returns false while a run is active.
    pub fn reset(&self) -> bool {
        if self.is_running() {
            return false;
        }
        *self.run_state() = RunState::default();
        true
    }

    fn report(&self, run: &RunState, target: String) -> WorkflowReport {
        WorkflowReport {
            target,
            state: run.machine.current(),
            phases: run.committed.values().cloned().collect(),
            skipped: run.skipped.clone(),
            transitions: run.machine.history().to_vec(),
            timeline: run.timeline.clone(),
            elapsed: run.elapsed(),
            executor: self.executor.get_stats(),
            resource_summary: self.resources.summary(),
        }
    }
}

fn module_error(phase: Phase, message: String) -> WorkflowError {
    WorkflowError::Module {
        phase: phase.name().to_string(),
        message,
    }
}

/// Orders descriptors so every task comes after the tasks it depends on.
fn submission_order(phase: Phase, descriptors: &[TaskDescriptor]) -> Result<Vec<usize>, WorkflowError> {
    let index: HashMap<&str, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.as_str(), i))
        .collect();

    for descriptor in descriptors {
        for dep in &descriptor.depends_on {
            if !index.contains_key(dep.as_str()) {
                return Err(module_error(
                    phase,
                    format!("task '{}' depends on unknown task '{}'", descriptor.name, dep),
                ));
            }
        }
    }

    let mut placed = vec![false; descriptors.len()];
    let mut order = Vec::with_capacity(descriptors.len());
    while order.len() < descriptors.len() {
        let before = order.len();
        for (i, descriptor) in descriptors.iter().enumerate() {
            if placed[i] {
                continue;
            }
            let ready = descriptor
                .depends_on
                .iter()
                .all(|dep| index.get(dep.as_str()).is_some_and(|&d| placed[d]));
            if ready {
                placed[i] = true;
                order.push(i);
            }
        }

        if order.len() == before {
            let stuck: Vec<_> = descriptors
                .iter()
                .zip(&placed)
                .filter(|(_, &done)| !done)
                .map(|(d, _)| d.name.as_str())
                .collect();
            return Err(module_error(
                phase,
                format!("dependency cycle among {:?}", stuck),
            ));
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::StaticProbe;
    use crate::task::unit;
    use crate::workflow::{AllowAll, DenyAll, PriorResults, TaskList};
    use serde_json::json;
    use std::fs;
    use std::thread;
    use tempfile::tempdir;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.monitoring.enabled = false;
        config.retry.default_retries = 1;
        config
    }

    fn orchestrator(config: Config, authorizer: Arc<dyn Authorizer>) -> WorkflowOrchestrator {
        let resources = Arc::new(ResourceManager::with_probe(
            config.thresholds.clone(),
            config.max_concurrent_tasks,
            Arc::new(StaticProbe::idle()),
        ));
        WorkflowOrchestrator::with_resources(config, resources, authorizer).unwrap()
    }

    fn echo_module(phase: Phase) -> TaskList {
        let tasks = ["a", "b"]
            .iter()
            .map(|suffix| {
                let name = format!("{}-{}", phase, suffix);
                let value = name.clone();
                TaskDescriptor::new(name, unit(move |_| Ok(json!(value))))
            })
            .collect();
        TaskList::new(format!("{}-module", phase), tasks)
    }

    fn with_all_modules(mut orchestrator: WorkflowOrchestrator) -> WorkflowOrchestrator {
        for phase in Phase::ALL {
            orchestrator.register_module(phase, echo_module(phase));
        }
        orchestrator
    }

    fn wait_for(orchestrator: &WorkflowOrchestrator, state: WorkflowState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if orchestrator.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    struct FailingModule;

    impl PhaseModule for FailingModule {
        fn name(&self) -> &str {
            "broken"
        }

        fn tasks(&self, _: &str, _: &PriorResults) -> Result<Vec<TaskDescriptor>, String> {
            Err("wordlist missing".to_string())
        }
    }

    /// Builds one task per open port found by the recon phase.
    struct PortModule;

    impl PhaseModule for PortModule {
        fn name(&self) -> &str {
            "ports"
        }

        fn tasks(&self, target: &str, prior: &PriorResults) -> Result<Vec<TaskDescriptor>, String> {
            let ports = prior
                .get(&Phase::Recon)
                .and_then(|r| r.value("portscan"))
                .and_then(|v| v.as_array().cloned())
                .ok_or("no port scan results")?;

            Ok(ports
                .into_iter()
                .map(|port| {
                    let label = format!("{}:{}", target, port);
                    TaskDescriptor::new(
                        format!("check-{}", port),
                        unit(move |_| Ok(json!(label))),
                    )
                })
                .collect())
        }
    }

    #[test]
    fn test_full_run_commits_every_phase() {
        let orchestrator = with_all_modules(orchestrator(test_config(), Arc::new(AllowAll)));
        let report = orchestrator.run("10.0.0.5").unwrap();

        assert!(report.is_complete());
        assert_eq!(
            report.phase_names(),
            vec!["recon", "vulnerability", "exploitation", "post_exploitation", "reporting"]
        );
        assert!(report.transitioned(WorkflowState::VulnComplete, WorkflowState::ExploitPending));
        assert!(report.transitioned(WorkflowState::ExploitPending, WorkflowState::ExploitRunning));
        assert!(report.transitioned(WorkflowState::Reporting, WorkflowState::Complete));
        assert_eq!(report.total_succeeded(), 10);
        assert_eq!(report.phase(Phase::Recon).unwrap().value("recon-a"), Some(&json!("recon-a")));

        let status = orchestrator.get_status();
        assert_eq!(status.state, WorkflowState::Complete);
        assert_eq!(status.target.as_deref(), Some("10.0.0.5"));
        assert_eq!(status.phases.len(), 5);
        assert_eq!(status.executor.completed, 10);
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn test_denied_authorization_skips_sensitive_phases() {
        let asked = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&asked);
        let authorizer = move |target: &str, scope: Option<&str>| {
            record
                .lock()
                .unwrap()
                .push((target.to_string(), scope.map(str::to_string)));
            false
        };

        let orchestrator = with_all_modules(orchestrator(test_config(), Arc::new(authorizer)));
        let report = orchestrator.run("10.0.0.5").unwrap();

        assert!(report.is_complete());
        assert!(report.transitioned(WorkflowState::VulnComplete, WorkflowState::Reporting));
        assert_eq!(report.phase_names(), vec!["recon", "vulnerability", "reporting"]);
        assert_eq!(report.skip_reason(Phase::Exploitation), Some(SkipReason::Unauthorized));
        assert_eq!(
            report.skip_reason(Phase::PostExploitation),
            Some(SkipReason::PrerequisiteSkipped)
        );
        assert!(!orchestrator
            .get_status()
            .phases
            .contains(&"exploitation".to_string()));
        assert_eq!(
            *asked.lock().unwrap(),
            vec![("10.0.0.5".to_string(), Some("exploitation".to_string()))]
        );
    }

    #[test]
    fn test_post_exploitation_can_be_denied_alone() {
        let authorizer = |_: &str, scope: Option<&str>| scope == Some("exploitation");
        let orchestrator = with_all_modules(orchestrator(test_config(), Arc::new(authorizer)));
        let report = orchestrator.run("host").unwrap();

        assert!(report.transitioned(WorkflowState::ExploitComplete, WorkflowState::Reporting));
        assert_eq!(report.skip_reason(Phase::PostExploitation), Some(SkipReason::Unauthorized));
    }

    #[test]
    fn test_disabled_phase_is_skipped() {
        let mut config = test_config();
        config.phases.set(Phase::Vulnerability, false);
        config.phases.set(Phase::Reporting, false);

        let orchestrator = with_all_modules(orchestrator(config, Arc::new(DenyAll)));
        let report = orchestrator.run("host").unwrap();

        assert!(report.is_complete());
        assert_eq!(report.phase_names(), vec!["recon"]);
        assert_eq!(report.skip_reason(Phase::Vulnerability), Some(SkipReason::Disabled));
        assert!(report.transitioned(WorkflowState::ReconComplete, WorkflowState::Complete));
    }

    #[test]
    fn test_task_failures_do_not_abort_the_run() {
        let mut orchestrator = orchestrator(test_config(), Arc::new(DenyAll));
        orchestrator.register_module(
            Phase::Recon,
            TaskList::new(
                "mixed",
                vec![
                    TaskDescriptor::new("ok", unit(|_| Ok(json!(1)))),
                    TaskDescriptor::new("bad", unit(|_| Err("timeout talking to host".into()))),
                ],
            ),
        );
        orchestrator.register_module(
            Phase::Vulnerability,
            TaskList::new(
                "hopeless",
                vec![TaskDescriptor::new("nope", unit(|_| Err("refused".into())))],
            ),
        );

        let report = orchestrator.run("host").unwrap();
        assert!(report.is_complete());

        let recon = report.phase(Phase::Recon).unwrap();
        assert_eq!((recon.succeeded, recon.failed), (1, 1));
        assert!(!recon.all_failed);
        assert!(report.phase(Phase::Vulnerability).unwrap().all_failed);
        assert_eq!(report.timeline.outcome("vulnerability"), Some(PhaseEvent::Failed));
    }

    #[test]
    fn test_module_error_fails_the_run() {
        let mut orchestrator = orchestrator(test_config(), Arc::new(AllowAll));
        orchestrator.register_module(Phase::Recon, echo_module(Phase::Recon));
        orchestrator.register_module(Phase::Vulnerability, FailingModule);

        let err = orchestrator.run("host").unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Module { ref phase, .. } if phase == "vulnerability"
        ));

        let status = orchestrator.get_status();
        assert_eq!(status.state, WorkflowState::Failed);
        assert_eq!(status.phases, vec!["recon".to_string()]);
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn test_later_phases_see_prior_results() {
        let mut orchestrator = orchestrator(test_config(), Arc::new(DenyAll));
        orchestrator.register_module(
            Phase::Recon,
            TaskList::new(
                "nmap",
                vec![TaskDescriptor::new("portscan", unit(|_| Ok(json!([22, 443]))))],
            ),
        );
        orchestrator.register_module(Phase::Vulnerability, PortModule);

        let report = orchestrator.run("10.0.0.5").unwrap();
        let vuln = report.phase(Phase::Vulnerability).unwrap();
        assert_eq!(vuln.value("check-22"), Some(&json!("10.0.0.5:22")));
        assert_eq!(vuln.value("check-443"), Some(&json!("10.0.0.5:443")));
    }

    #[test]
    fn test_dependent_tasks_run_through_scheduler() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let step = |name: &'static str, fail: bool| {
            let order = Arc::clone(&order);
            unit(move |_| {
                order.lock().unwrap().push(name);
                if fail {
                    Err(format!("{} failed", name).into())
                } else {
                    Ok(json!(name))
                }
            })
        };

        let mut orchestrator = orchestrator(test_config(), Arc::new(DenyAll));
        orchestrator.register_module(
            Phase::Recon,
            TaskList::new(
                "chain",
                vec![
                    // Listed before its dependency on purpose
                    TaskDescriptor::new("scan", step("scan", false)).depends_on("resolve"),
                    TaskDescriptor::new("resolve", step("resolve", false)),
                    TaskDescriptor::new("crawl", step("crawl", true)),
                    TaskDescriptor::new("screenshot", step("screenshot", false)).depends_on("crawl"),
                ],
            ),
        );

        let report = orchestrator.run("host").unwrap();
        let recon = report.phase(Phase::Recon).unwrap();

        assert_eq!(recon.value("scan"), Some(&json!("scan")));
        assert!(!recon.get("crawl").unwrap().success);
        assert_eq!(recon.blocked, vec!["screenshot".to_string()]);
        assert_eq!((recon.succeeded, recon.failed), (2, 1));

        let order = order.lock().unwrap();
        let pos = |name| order.iter().position(|n| *n == name).unwrap();
        assert!(pos("resolve") < pos("scan"));
        assert!(!order.contains(&"screenshot"));

        let stats = orchestrator.scheduler().stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_unknown_dependency_is_fatal() {
        let mut orchestrator = orchestrator(test_config(), Arc::new(DenyAll));
        orchestrator.register_module(
            Phase::Recon,
            TaskList::new(
                "bad-graph",
                vec![TaskDescriptor::new("scan", unit(|_| Ok(json!(null)))).depends_on("ghost")],
            ),
        );

        let err = orchestrator.run("host").unwrap_err();
        assert!(err.to_string().contains("unknown task 'ghost'"));
        assert_eq!(orchestrator.state(), WorkflowState::Failed);
    }

    #[test]
    fn test_dependency_cycle_is_fatal() {
        let noop = unit(|_| Ok(json!(null)));
        let mut orchestrator = orchestrator(test_config(), Arc::new(DenyAll));
        orchestrator.register_module(
            Phase::Recon,
            TaskList::new(
                "cycle",
                vec![
                    TaskDescriptor::new("a", noop.clone()).depends_on("b"),
                    TaskDescriptor::new("b", noop).depends_on("a"),
                ],
            ),
        );

        let err = orchestrator.run("host").unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn test_duplicate_task_names_are_fatal() {
        let mut orchestrator = orchestrator(test_config(), Arc::new(DenyAll));
        orchestrator.register_module(Phase::Recon, echo_module(Phase::Recon));
        orchestrator.register_module(Phase::Recon, echo_module(Phase::Recon));

        let err = orchestrator.run("host").unwrap_err();
        assert!(err.to_string().contains("duplicate task name 'recon-a'"));
    }

    #[test]
    fn test_resume_from_checkpoint_skips_committed_phases() {
        let calls = Arc::new(AtomicBool::new(false));
        let called = Arc::clone(&calls);

        let mut orchestrator = orchestrator(test_config(), Arc::new(DenyAll));
        orchestrator.register_module(
            Phase::Recon,
            TaskList::new(
                "recon",
                vec![TaskDescriptor::new(
                    "again",
                    unit(move |_| {
                        called.store(true, Ordering::SeqCst);
                        Ok(json!(null))
                    }),
                )],
            ),
        );
        orchestrator.register_module(Phase::Vulnerability, echo_module(Phase::Vulnerability));

        let mut checkpoint = WorkflowCheckpoint::new("host");
        checkpoint.commit(PhaseResult::empty(Phase::Recon));

        let report = orchestrator.run_from_checkpoint(checkpoint).unwrap();
        assert!(!calls.load(Ordering::SeqCst));
        assert_eq!(report.transitions[0].from, WorkflowState::ReconComplete);
        assert_eq!(report.transitions[0].to, WorkflowState::VulnRunning);
        assert_eq!(report.skip_reason(Phase::Recon), Some(SkipReason::Committed));
        assert_eq!(report.phase_names(), vec!["recon", "vulnerability", "reporting"]);
    }

    #[test]
    fn test_checkpoint_saved_after_each_phase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let orchestrator = with_all_modules(orchestrator(test_config(), Arc::new(DenyAll)))
            .with_checkpoint_path(&path);
        orchestrator.run("host").unwrap();

        let saved = WorkflowCheckpoint::load(&path).unwrap();
        assert_eq!(saved.target, "host");
        assert_eq!(saved.last_committed(), Some(Phase::Reporting));
        assert_eq!(saved.phases, orchestrator.checkpoint().phases);
    }

    #[test]
    fn test_pause_and_resume_at_phase_boundary() {
        let orchestrator = Arc::new(with_all_modules(orchestrator(
            test_config(),
            Arc::new(DenyAll),
        )));
        orchestrator.pause();

        let runner = Arc::clone(&orchestrator);
        let handle = thread::spawn(move || runner.run("host"));

        assert!(wait_for(&orchestrator, WorkflowState::Paused));
        assert!(orchestrator.get_status().paused);
        assert!(orchestrator.get_status().phases.is_empty());
        assert!(matches!(
            orchestrator.run("other"),
            Err(WorkflowError::AlreadyRunning)
        ));

        orchestrator.resume();
        let report = handle.join().unwrap().unwrap();

        assert!(report.is_complete());
        assert!(report.transitioned(WorkflowState::Initialized, WorkflowState::Paused));
        assert!(report.transitioned(WorkflowState::Paused, WorkflowState::Initialized));
    }

    #[test]
    fn test_pause_flag_file_holds_the_run() {
        let dir = tempdir().unwrap();
        let flag = dir.path().join("pause.flag");
        fs::write(&flag, "paused").unwrap();

        let orchestrator = Arc::new(
            with_all_modules(orchestrator(test_config(), Arc::new(DenyAll))).with_pause_flag(&flag),
        );
        let runner = Arc::clone(&orchestrator);
        let handle = thread::spawn(move || runner.run("host"));

        assert!(wait_for(&orchestrator, WorkflowState::Paused));
        fs::remove_file(&flag).unwrap();

        let report = handle.join().unwrap().unwrap();
        assert!(report.is_complete());
    }

    #[test]
    fn test_status_and_reset() {
        let orchestrator = with_all_modules(orchestrator(test_config(), Arc::new(DenyAll)));

        let status = orchestrator.get_status();
        assert_eq!(status.state, WorkflowState::Initialized);
        assert_eq!(status.target, None);
        assert_eq!(status.elapsed, Duration::ZERO);

        orchestrator.run("host").unwrap();
        let elapsed = orchestrator.get_status().elapsed;
        thread::sleep(Duration::from_millis(20));
        assert_eq!(orchestrator.get_status().elapsed, elapsed);

        assert!(orchestrator.reset());
        assert_eq!(orchestrator.state(), WorkflowState::Initialized);
        assert!(orchestrator.get_status().phases.is_empty());
    }

    #[test]
    fn test_orchestrator_can_run_again() {
        let orchestrator = with_all_modules(orchestrator(test_config(), Arc::new(DenyAll)));
        assert!(orchestrator.run("first").unwrap().is_complete());
        let second = orchestrator.run("second").unwrap();
        assert!(second.is_complete());
        assert_eq!(second.target, "second");
    }
}
