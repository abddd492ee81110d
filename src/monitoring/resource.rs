//! Resource Manager
//!
//! Keeps a bounded history of host resource readings and answers the
//! admission questions the executors ask before adding concurrency:
//! - Is the host within its configured thresholds?
//! - How many workers does a given workload safely support?
//! - Can a cooperative reservation of CPU/memory/disk be granted?
//!
//! Reading failures never propagate: they produce a degraded snapshot
//! that reads as constrained.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

use super::probe::{ResourceProbe, ResourceSnapshot, SystemProbe};

/// Default number of snapshots retained.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Concurrency multiplier per core for I/O-bound work.
const IO_BOUND_WORKERS_PER_CORE: f64 = 4.0;

/// Ceiling values the host should stay under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    /// Maximum CPU usage percentage
    pub max_cpu_usage: f32,
    /// Maximum memory usage percentage
    pub max_memory_usage: f32,
    /// Maximum disk usage percentage
    pub max_disk_usage: f32,
    /// Minimum free disk space in MB
    pub min_free_space: u64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            max_cpu_usage: 80.0,
            max_memory_usage: 80.0,
            max_disk_usage: 90.0,
            min_free_space: 1024,
        }
    }
}

impl ResourceThresholds {
    /// Rejects percentages outside (0, 100].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("max_cpu_usage", self.max_cpu_usage),
            ("max_memory_usage", self.max_memory_usage),
            ("max_disk_usage", self.max_disk_usage),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::InvalidThreshold { field, value });
            }
        }
        Ok(())
    }
}

/// A single threshold a snapshot exceeds.
#[derive(Debug, Clone, PartialEq)]
pub enum Breach {
    Cpu { usage: f32, limit: f32 },
    Memory { usage: f32, limit: f32 },
    Disk { usage: f32, limit: f32 },
    FreeSpace { free_mb: u64, min_mb: u64 },
}

impl Breach {
    /// Name of the breached dimension.
    pub fn dimension(&self) -> &'static str {
        match self {
            Self::Cpu { .. } => "cpu",
            Self::Memory { .. } => "memory",
            Self::Disk { .. } => "disk",
            Self::FreeSpace { .. } => "free_space",
        }
    }
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu { usage, limit } => write!(f, "CPU at {:.1}% (limit {:.1}%)", usage, limit),
            Self::Memory { usage, limit } => {
                write!(f, "memory at {:.1}% (limit {:.1}%)", usage, limit)
            }
            Self::Disk { usage, limit } => write!(f, "disk at {:.1}% (limit {:.1}%)", usage, limit),
            Self::FreeSpace { free_mb, min_mb } => {
                write!(f, "free disk {} MB (minimum {} MB)", free_mb, min_mb)
            }
        }
    }
}

/// Lists every threshold the snapshot breaches. Pure.
pub fn check_limits(snapshot: &ResourceSnapshot, thresholds: &ResourceThresholds) -> Vec<Breach> {
    let mut breaches = Vec::new();

    if snapshot.cpu_usage > thresholds.max_cpu_usage {
        breaches.push(Breach::Cpu {
            usage: snapshot.cpu_usage,
            limit: thresholds.max_cpu_usage,
        });
    }
    if snapshot.memory_usage > thresholds.max_memory_usage {
        breaches.push(Breach::Memory {
            usage: snapshot.memory_usage,
            limit: thresholds.max_memory_usage,
        });
    }
    if snapshot.disk_usage > thresholds.max_disk_usage {
        breaches.push(Breach::Disk {
            usage: snapshot.disk_usage,
            limit: thresholds.max_disk_usage,
        });
    }
    if snapshot.disk_free_mb < thresholds.min_free_space {
        breaches.push(Breach::FreeSpace {
            free_mb: snapshot.disk_free_mb,
            min_mb: thresholds.min_free_space,
        });
    }

    breaches
}

/// Returns true if no threshold is breached, logging each breach.
pub fn is_within_limits(snapshot: &ResourceSnapshot, thresholds: &ResourceThresholds) -> bool {
    let breaches = check_limits(snapshot, thresholds);
    for breach in &breaches {
        warn!("Resource limit exceeded: {}", breach);
    }
    breaches.is_empty()
}

/// Coarse workload shape used for sizing advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    IoBound,
    CpuBound,
}

/// Declared needs of one kind of task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskProfile {
    pub kind: WorkloadKind,
    /// Memory needed per worker, in MB
    pub memory_mb: u64,
}

impl TaskProfile {
    pub fn io_bound(memory_mb: u64) -> Self {
        Self {
            kind: WorkloadKind::IoBound,
            memory_mb,
        }
    }

    pub fn cpu_bound(memory_mb: u64) -> Self {
        Self {
            kind: WorkloadKind::CpuBound,
            memory_mb,
        }
    }
}

/// Advisory sizing for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub max_workers: usize,
    pub per_worker_memory_mb: u64,
}

/// Outstanding cooperative reservations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Reservation {
    pub cpu: f32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

struct Monitor {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Samples host resources and makes advisory admission decisions.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use taskforge::monitoring::{ResourceManager, ResourceSnapshot, ResourceThresholds, StaticProbe};
///
/// let probe = Arc::new(StaticProbe::new(ResourceSnapshot::idle().with_cpu(95.0)));
/// let manager = ResourceManager::with_probe(ResourceThresholds::default(), 8, probe);
///
/// assert!(!manager.check_resources());
/// println!("{}", manager.summary());
/// ```
pub struct ResourceManager {
    probe: Arc<dyn ResourceProbe>,
    thresholds: ResourceThresholds,
    max_workers: usize,
    cpu_count: usize,
    history_size: usize,
    history: Mutex<VecDeque<ResourceSnapshot>>,
    reserved: Mutex<Reservation>,
    monitor: Mutex<Option<Monitor>>,
}

impl ResourceManager {
    /// Creates a manager reading the local host.
    pub fn new(thresholds: ResourceThresholds, max_workers: usize) -> Self {
        Self::with_probe(thresholds, max_workers, Arc::new(SystemProbe::new()))
    }

    /// Creates a manager reading from the given probe.
    pub fn with_probe(
        thresholds: ResourceThresholds,
        max_workers: usize,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            probe,
            thresholds,
            max_workers: max_workers.max(1),
            cpu_count: num_cpus::get().max(1),
            history_size: DEFAULT_HISTORY_SIZE,
            history: Mutex::new(VecDeque::with_capacity(DEFAULT_HISTORY_SIZE)),
            reserved: Mutex::new(Reservation::default()),
            monitor: Mutex::new(None),
        }
    }

    /// Sets how many snapshots are retained.
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size.max(1);
        self
    }

    /// Overrides the detected core count.
    pub fn with_cpu_count(mut self, cpus: usize) -> Self {
        self.cpu_count = cpus.max(1);
        self
    }

    pub fn thresholds(&self) -> &ResourceThresholds {
        &self.thresholds
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    fn history_lock(&self) -> MutexGuard<'_, VecDeque<ResourceSnapshot>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserved_lock(&self) -> MutexGuard<'_, Reservation> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a reading and records it in the history.
    ///
    /// A failing probe yields [`ResourceSnapshot::degraded`].
    pub fn sample(&self) -> ResourceSnapshot {
        let snapshot = self.probe.probe().unwrap_or_else(|e| {
            warn!("{}; reporting degraded snapshot", e);
            ResourceSnapshot::degraded()
        });

        let mut history = self.history_lock();
        while history.len() >= self.history_size {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    /// Samples now and checks the reading against the thresholds.
    pub fn check_resources(&self) -> bool {
        let snapshot = self.sample();
        is_within_limits(&snapshot, &self.thresholds)
    }

    /// Checks the most recent reading without sampling.
    ///
    /// With no readings yet there is no evidence of pressure.
    pub fn latest_within_limits(&self) -> bool {
        self.latest()
            .map_or(true, |s| check_limits(&s, &self.thresholds).is_empty())
    }

    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.history_lock().back().cloned()
    }

    /// Retained readings, oldest first.
    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.history_lock().iter().cloned().collect()
    }

    /// Average CPU usage across the retained readings.
    pub fn average_cpu(&self) -> f32 {
        let history = self.history_lock();
        if history.is_empty() {
            return 0.0;
        }
        history.iter().map(|s| s.cpu_usage).sum::<f32>() / history.len() as f32
    }

    /// Highest memory usage percentage across the retained readings.
    pub fn peak_memory_usage(&self) -> f32 {
        self.history_lock()
            .iter()
            .map(|s| s.memory_usage)
            .fold(0.0, f32::max)
    }

    /// Returns a human-readable summary of the retained readings.
    pub fn summary(&self) -> String {
        let samples = self.history_lock().len();
        if samples == 0 {
            return "No resource data collected".to_string();
        }

        let lowest_free = self
            .history_lock()
            .iter()
            .map(|s| s.disk_free_mb)
            .min()
            .unwrap_or(0);

        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {:.1}%\n  Lowest Free Disk: {} MB\n  Samples: {}",
            self.average_cpu(),
            self.peak_memory_usage(),
            lowest_free,
            samples
        )
    }

    /// Suggests a worker count for a workload.
    ///
    /// `min(max_workers, available_memory / per_worker_memory, cpu_limit)`,
    /// never below one. The CPU limit scales the core count (times four for
    /// I/O-bound work) by the idle CPU fraction.
    pub fn recommend(&self, profile: TaskProfile) -> Recommendation {
        let snapshot = self.latest().unwrap_or_else(|| self.sample());

        let by_memory = if profile.memory_mb == 0 {
            self.max_workers
        } else {
            (snapshot.memory_available_mb / profile.memory_mb) as usize
        };

        let idle = (1.0 - f64::from(snapshot.cpu_usage) / 100.0).clamp(0.0, 1.0);
        let per_core = match profile.kind {
            WorkloadKind::CpuBound => 1.0,
            WorkloadKind::IoBound => IO_BOUND_WORKERS_PER_CORE,
        };
        let by_cpu = (self.cpu_count as f64 * per_core * idle).ceil() as usize;

        let max_workers = self.max_workers.min(by_memory).min(by_cpu).max(1);
        debug!(
            "Recommending {} workers for {:?} (memory allows {}, cpu allows {})",
            max_workers, profile.kind, by_memory, by_cpu
        );

        Recommendation {
            max_workers,
            per_worker_memory_mb: profile.memory_mb,
        }
    }

    /// Reserves resources if the reservation, on top of current usage and
    /// outstanding reservations, stays within the thresholds.
    ///
    /// Returns false without side effects otherwise.
    pub fn allocate(&self, cpu: f32, memory_mb: u64, disk_mb: u64) -> bool {
        let snapshot = self.latest().unwrap_or_else(|| self.sample());
        let mut reserved = self.reserved_lock();

        let projected_cpu = snapshot.cpu_usage + reserved.cpu + cpu;
        if projected_cpu > self.thresholds.max_cpu_usage {
            debug!("Allocation refused: CPU would reach {:.1}%", projected_cpu);
            return false;
        }

        let memory_needed = reserved.memory_mb + memory_mb;
        if memory_needed > 0 {
            if snapshot.memory_total_mb == 0 {
                debug!("Allocation refused: memory total unknown");
                return false;
            }
            let projected = (snapshot.memory_used_mb() + memory_needed) as f64
                / snapshot.memory_total_mb as f64
                * 100.0;
            if projected > f64::from(self.thresholds.max_memory_usage) {
                debug!("Allocation refused: memory would reach {:.1}%", projected);
                return false;
            }
        }

        let disk_needed = reserved.disk_mb + disk_mb;
        let free_after = snapshot.disk_free_mb.saturating_sub(disk_needed);
        if disk_needed > snapshot.disk_free_mb || free_after < self.thresholds.min_free_space {
            debug!("Allocation refused: free disk would drop to {} MB", free_after);
            return false;
        }
        if snapshot.disk_total_mb > 0 {
            let projected = f64::from(snapshot.disk_usage)
                + disk_needed as f64 / snapshot.disk_total_mb as f64 * 100.0;
            if projected > f64::from(self.thresholds.max_disk_usage) {
                debug!("Allocation refused: disk would reach {:.1}%", projected);
                return false;
            }
        }

        reserved.cpu += cpu;
        reserved.memory_mb += memory_mb;
        reserved.disk_mb += disk_mb;
        true
    }

    /// Returns a reservation. Totals never go below zero.
    pub fn release(&self, cpu: f32, memory_mb: u64, disk_mb: u64) {
        let mut reserved = self.reserved_lock();
        reserved.cpu = (reserved.cpu - cpu).max(0.0);
        reserved.memory_mb = reserved.memory_mb.saturating_sub(memory_mb);
        reserved.disk_mb = reserved.disk_mb.saturating_sub(disk_mb);
    }

    /// Current outstanding reservations.
    pub fn reserved(&self) -> Reservation {
        *self.reserved_lock()
    }

    /// Starts sampling on a background thread every `interval`.
    ///
    /// Returns false if monitoring is already running.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) -> bool {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            return false;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let manager: Weak<Self> = Arc::downgrade(self);

        let spawned = thread::Builder::new()
            .name("resource-monitor".to_string())
            .spawn(move || loop {
                match manager.upgrade() {
                    Some(manager) => {
                        manager.sample();
                    }
                    None => break,
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            });

        match spawned {
            Ok(handle) => {
                info!("Resource monitoring started (interval: {:?})", interval);
                *monitor = Some(Monitor { stop_tx, handle });
                true
            }
            Err(e) => {
                warn!("Failed to start resource monitor: {}", e);
                false
            }
        }
    }

    /// Stops the background sampler and waits for it to exit.
    pub fn stop_monitoring(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(monitor) = monitor {
            let _ = monitor.stop_tx.send(());
            if monitor.handle.thread().id() != thread::current().id()
                && monitor.handle.join().is_err()
            {
                warn!("Resource monitor thread panicked");
            }
            info!("Resource monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::StaticProbe;

    fn manager_with(snapshot: ResourceSnapshot) -> (Arc<StaticProbe>, ResourceManager) {
        let probe = Arc::new(StaticProbe::new(snapshot));
        let manager = ResourceManager::with_probe(ResourceThresholds::default(), 8, probe.clone())
            .with_cpu_count(4);
        (probe, manager)
    }

    #[test]
    fn test_idle_host_is_within_limits() {
        let snapshot = ResourceSnapshot::idle();
        assert!(check_limits(&snapshot, &ResourceThresholds::default()).is_empty());
        assert!(is_within_limits(&snapshot, &ResourceThresholds::default()));
    }

    #[test]
    fn test_cpu_breach_is_attributed() {
        let snapshot = ResourceSnapshot::idle().with_cpu(95.0);
        let thresholds = ResourceThresholds::default();

        let breaches = check_limits(&snapshot, &thresholds);
        assert_eq!(breaches, vec![Breach::Cpu { usage: 95.0, limit: 80.0 }]);
        assert_eq!(breaches[0].dimension(), "cpu");
    }

    #[test]
    fn test_is_within_limits_is_pure() {
        let snapshot = ResourceSnapshot::idle().with_cpu(95.0);
        let thresholds = ResourceThresholds::default();

        let first = is_within_limits(&snapshot, &thresholds);
        let second = is_within_limits(&snapshot, &thresholds);
        assert!(!first);
        assert_eq!(first, second);
    }

    #[test]
    fn test_every_dimension_reported() {
        let snapshot = ResourceSnapshot::idle()
            .with_cpu(99.0)
            .with_memory(95.0)
            .with_disk(99.9);
        let dims: Vec<_> = check_limits(&snapshot, &ResourceThresholds::default())
            .iter()
            .map(Breach::dimension)
            .collect();

        assert_eq!(dims, vec!["cpu", "memory", "disk", "free_space"]);
    }

    #[test]
    fn test_free_space_floor() {
        let snapshot = ResourceSnapshot::idle().with_free_disk_mb(512);
        let breaches = check_limits(&snapshot, &ResourceThresholds::default());
        assert_eq!(breaches, vec![Breach::FreeSpace { free_mb: 512, min_mb: 1024 }]);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(ResourceThresholds::default().validate().is_ok());

        let bad = ResourceThresholds {
            max_memory_usage: 0.0,
            ..ResourceThresholds::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidThreshold { field: "max_memory_usage", .. })
        ));

        let bad = ResourceThresholds {
            max_cpu_usage: 150.0,
            ..ResourceThresholds::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_probe_failure_reads_as_constrained() {
        let (probe, manager) = manager_with(ResourceSnapshot::idle());
        probe.fail_with("permission denied");

        let snapshot = manager.sample();
        assert!(snapshot.degraded);
        assert!(!manager.check_resources());
        assert!(!manager.latest_within_limits());
    }

    #[test]
    fn test_history_is_bounded() {
        let (probe, manager) = manager_with(ResourceSnapshot::idle());
        let manager = manager.with_history_size(3);

        for cpu in [10.0, 20.0, 30.0, 40.0, 50.0] {
            probe.set(ResourceSnapshot::idle().with_cpu(cpu));
            manager.sample();
        }

        let cpus: Vec<_> = manager.history().iter().map(|s| s.cpu_usage).collect();
        assert_eq!(cpus, vec![30.0, 40.0, 50.0]);
        assert_eq!(manager.latest().unwrap().cpu_usage, 50.0);
        assert_eq!(manager.average_cpu(), 40.0);
    }

    #[test]
    fn test_latest_within_limits_without_samples() {
        let (_, manager) = manager_with(ResourceSnapshot::idle().with_cpu(99.0));
        assert!(manager.latest_within_limits());
        manager.sample();
        assert!(!manager.latest_within_limits());
    }

    #[test]
    fn test_summary() {
        let (_, manager) = manager_with(ResourceSnapshot::idle());
        assert!(manager.summary().contains("No resource data collected"));

        manager.sample();
        let summary = manager.summary();
        assert!(summary.contains("Average CPU: 10.0%"));
        assert!(summary.contains("Peak Memory: 25.0%"));
        assert!(summary.contains("Samples: 1"));
    }

    #[test]
    fn test_recommend_limited_by_configured_max() {
        let (_, manager) = manager_with(ResourceSnapshot::idle().with_cpu(0.0));
        let rec = manager.recommend(TaskProfile::io_bound(64));
        // memory allows 192, cpu allows 16, configured max is 8
        assert_eq!(rec.max_workers, 8);
        assert_eq!(rec.per_worker_memory_mb, 64);
    }

    #[test]
    fn test_recommend_limited_by_memory() {
        let (_, manager) = manager_with(ResourceSnapshot::idle().with_memory(90.0));
        // ~1638 MB available / 512 MB per worker
        let rec = manager.recommend(TaskProfile::io_bound(512));
        assert_eq!(rec.max_workers, 3);
    }

    #[test]
    fn test_recommend_limited_by_cpu_headroom() {
        let (_, manager) = manager_with(ResourceSnapshot::idle().with_cpu(50.0));
        // 4 cores * 1 * 0.5 idle
        let rec = manager.recommend(TaskProfile::cpu_bound(16));
        assert_eq!(rec.max_workers, 2);
    }

    #[test]
    fn test_recommend_never_below_one() {
        let (_, manager) = manager_with(ResourceSnapshot::idle().with_cpu(100.0));
        let rec = manager.recommend(TaskProfile::cpu_bound(100_000));
        assert_eq!(rec.max_workers, 1);
    }

    #[test]
    fn test_allocate_and_release() {
        let (_, manager) = manager_with(ResourceSnapshot::idle());

        assert!(manager.allocate(30.0, 2048, 10_000));
        assert_eq!(
            manager.reserved(),
            Reservation { cpu: 30.0, memory_mb: 2048, disk_mb: 10_000 }
        );

        // 10% used + 30% reserved + 50% requested > 80%
        assert!(!manager.allocate(50.0, 0, 0));
        assert_eq!(manager.reserved().cpu, 30.0);

        manager.release(30.0, 2048, 10_000);
        assert_eq!(manager.reserved(), Reservation::default());

        manager.release(5.0, 1, 1);
        assert_eq!(manager.reserved(), Reservation::default());
    }

    #[test]
    fn test_allocate_refuses_memory_overcommit() {
        let (_, manager) = manager_with(ResourceSnapshot::idle().with_memory(70.0));
        // 70% used; 2048 MB more of 16384 is another 12.5%
        assert!(!manager.allocate(0.0, 2048, 0));
        assert!(manager.allocate(0.0, 1024, 0));
    }

    #[test]
    fn test_allocate_refuses_free_space_floor() {
        let (_, manager) = manager_with(ResourceSnapshot::idle().with_free_disk_mb(2048));
        assert!(!manager.allocate(0.0, 0, 1500));
        assert!(manager.allocate(0.0, 0, 1000));
    }

    #[test]
    fn test_background_monitoring() {
        let (_, manager) = manager_with(ResourceSnapshot::idle());
        let manager = Arc::new(manager);

        assert!(manager.start_monitoring(Duration::from_millis(10)));
        assert!(!manager.start_monitoring(Duration::from_millis(10)));
        assert!(manager.is_monitoring());

        thread::sleep(Duration::from_millis(100));
        manager.stop_monitoring();
        assert!(!manager.is_monitoring());

        let samples = manager.history().len();
        assert!(samples >= 2, "expected several samples, got {}", samples);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(manager.history().len(), samples);
    }
}
