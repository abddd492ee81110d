//! Resource Probes
//!
//! A probe takes one reading of host resource usage. [`SystemProbe`]
//! reads the real host through `sysinfo`; [`StaticProbe`] returns a
//! settable reading for tests and dry runs.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use log::debug;
use sysinfo::{Disks, Networks, System};
use thiserror::Error;

/// Bytes per megabyte.
const MB: u64 = 1024 * 1024;

/// Failure to read host resources.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("resource probe failed: {0}")]
pub struct ProbeError(pub String);

/// A point-in-time reading of host resource usage.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceSnapshot {
    /// Global CPU usage percentage (0-100)
    pub cpu_usage: f32,
    /// Memory usage percentage (0-100)
    pub memory_usage: f32,
    pub memory_total_mb: u64,
    pub memory_available_mb: u64,
    /// Disk usage percentage of the monitored volume (0-100)
    pub disk_usage: f32,
    pub disk_total_mb: u64,
    pub disk_free_mb: u64,
    /// Cumulative bytes sent across all interfaces
    pub net_bytes_sent: u64,
    /// Cumulative bytes received across all interfaces
    pub net_bytes_received: u64,
    /// 1, 5 and 15 minute load averages
    pub load_average: [f64; 3],
    pub timestamp: chrono::DateTime<Utc>,
    /// Set when the probe failed and the values are placeholders
    pub degraded: bool,
}

impl ResourceSnapshot {
    /// Zeroed placeholder used when the host cannot be read.
    ///
    /// Zero free disk space always breaches the free-space floor, so a
    /// degraded reading is treated as constrained.
    pub fn degraded() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            memory_total_mb: 0,
            memory_available_mb: 0,
            disk_usage: 0.0,
            disk_total_mb: 0,
            disk_free_mb: 0,
            net_bytes_sent: 0,
            net_bytes_received: 0,
            load_average: [0.0; 3],
            timestamp: Utc::now(),
            degraded: true,
        }
    }

    /// A lightly loaded 16 GB / 500 GB host.
    pub fn idle() -> Self {
        Self {
            cpu_usage: 10.0,
            memory_usage: 25.0,
            memory_total_mb: 16_384,
            memory_available_mb: 12_288,
            disk_usage: 40.0,
            disk_total_mb: 512_000,
            disk_free_mb: 307_200,
            net_bytes_sent: 0,
            net_bytes_received: 0,
            load_average: [0.5, 0.5, 0.5],
            timestamp: Utc::now(),
            degraded: false,
        }
    }

    pub fn with_cpu(mut self, cpu_usage: f32) -> Self {
        self.cpu_usage = cpu_usage;
        self
    }

    /// Sets memory usage, adjusting available memory to match.
    pub fn with_memory(mut self, memory_usage: f32) -> Self {
        self.memory_usage = memory_usage;
        let free_fraction = (1.0 - f64::from(memory_usage) / 100.0).clamp(0.0, 1.0);
        self.memory_available_mb = (self.memory_total_mb as f64 * free_fraction) as u64;
        self
    }

    /// Sets disk usage, adjusting free space to match.
    pub fn with_disk(mut self, disk_usage: f32) -> Self {
        self.disk_usage = disk_usage;
        let free_fraction = (1.0 - f64::from(disk_usage) / 100.0).clamp(0.0, 1.0);
        self.disk_free_mb = (self.disk_total_mb as f64 * free_fraction) as u64;
        self
    }

    pub fn with_free_disk_mb(mut self, free_mb: u64) -> Self {
        self.disk_free_mb = free_mb;
        self
    }

    /// Memory in use, in megabytes.
    pub fn memory_used_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_available_mb)
    }
}

/// Source of resource readings.
pub trait ResourceProbe: Send + Sync {
    fn probe(&self) -> Result<ResourceSnapshot, ProbeError>;
}

struct HostState {
    system: System,
    disks: Disks,
    networks: Networks,
}

/// Reads the local host via `sysinfo`.
///
/// CPU usage is computed between consecutive refreshes, so construction
/// performs a warm-up refresh and the first real reading reflects the
/// interval since then.
pub struct SystemProbe {
    host: Mutex<HostState>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            host: Mutex::new(HostState {
                system,
                disks: Disks::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn probe(&self) -> Result<ResourceSnapshot, ProbeError> {
        let mut guard = self.lock();
        let host = &mut *guard;

        host.system.refresh_cpu();
        host.system.refresh_memory();
        host.disks.refresh();
        host.networks.refresh();

        let total_bytes = host.system.total_memory();
        if total_bytes == 0 {
            return Err(ProbeError("memory information unavailable".to_string()));
        }
        let available_bytes = host.system.available_memory();
        let memory_usage =
            (total_bytes.saturating_sub(available_bytes) as f64 / total_bytes as f64 * 100.0) as f32;

        // Prefer the root volume; otherwise aggregate every disk
        let (disk_total, disk_free) = match host
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
        {
            Some(root) => (root.total_space(), root.available_space()),
            None => host.disks.list().iter().fold((0, 0), |(total, free), d| {
                (total + d.total_space(), free + d.available_space())
            }),
        };
        if disk_total == 0 {
            return Err(ProbeError("disk information unavailable".to_string()));
        }
        let disk_usage =
            (disk_total.saturating_sub(disk_free) as f64 / disk_total as f64 * 100.0) as f32;

        let (sent, received) = host
            .networks
            .list()
            .values()
            .fold((0u64, 0u64), |(sent, received), data| {
                (sent + data.total_transmitted(), received + data.total_received())
            });

        let load = System::load_average();
        let snapshot = ResourceSnapshot {
            cpu_usage: host.system.global_cpu_info().cpu_usage(),
            memory_usage,
            memory_total_mb: total_bytes / MB,
            memory_available_mb: available_bytes / MB,
            disk_usage,
            disk_total_mb: disk_total / MB,
            disk_free_mb: disk_free / MB,
            net_bytes_sent: sent,
            net_bytes_received: received,
            load_average: [load.one, load.five, load.fifteen],
            timestamp: Utc::now(),
            degraded: false,
        };

        debug!(
            "Sampled host: cpu {:.1}%, memory {:.1}%, disk {:.1}%",
            snapshot.cpu_usage, snapshot.memory_usage, snapshot.disk_usage
        );
        Ok(snapshot)
    }
}

/// Returns a fixed, replaceable reading, or a configured failure.
#[derive(Debug)]
pub struct StaticProbe {
    reading: Mutex<Result<ResourceSnapshot, ProbeError>>,
}

impl StaticProbe {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            reading: Mutex::new(Ok(snapshot)),
        }
    }

    /// A probe reporting an idle host.
    pub fn idle() -> Self {
        Self::new(ResourceSnapshot::idle())
    }

    /// Replaces the reading returned by subsequent probes.
    pub fn set(&self, snapshot: ResourceSnapshot) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = Ok(snapshot);
    }

    /// Makes subsequent probes fail.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) =
            Err(ProbeError(message.into()));
    }
}

impl ResourceProbe for StaticProbe {
    fn probe(&self) -> Result<ResourceSnapshot, ProbeError> {
        let reading = self.reading.lock().unwrap_or_else(PoisonError::into_inner);
        reading.clone().map(|mut snapshot| {
            snapshot.timestamp = Utc::now();
            snapshot
        })
    }
}
