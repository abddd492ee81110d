//! Runtime Configuration
//!
//! Loaded from YAML. Every section has defaults, so a partial file (or
//! none at all) is valid:
//!
//! ```yaml
//! max_concurrent_tasks: 8
//! thresholds:
//!   max_cpu_usage: 75
//! retry:
//!   default_retries: 2
//! phases:
//!   exploitation: false
//! authorized_targets:
//!   - 10.0.0.0/24
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::monitoring::{ResourceThresholds, DEFAULT_HISTORY_SIZE};
use crate::scheduler::{RetryPolicy, SchedulerConfig};
use crate::workflow::Phase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base: f64,
    pub unit_ms: u64,
    pub cap_secs: u64,
    /// Attempt budget for tasks that don't set their own
    pub default_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base: 2.0,
            unit_ms: 1000,
            cap_secs: 60,
            default_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub history_size: usize,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Tasks per batch; unbatched when absent
    pub batch_size: Option<usize>,
    /// Pause between batches while resources are constrained
    pub batch_pause_ms: u64,
    pub default_timeout_secs: Option<u64>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            batch_size: None,
            batch_pause_ms: 2000,
            default_timeout_secs: None,
        }
    }
}

/// Per-phase enablement. Sensitive phases also need authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseSettings {
    pub recon: bool,
    pub vulnerability: bool,
    pub exploitation: bool,
    pub post_exploitation: bool,
    pub reporting: bool,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            recon: true,
            vulnerability: true,
            exploitation: true,
            post_exploitation: true,
            reporting: true,
        }
    }
}

impl PhaseSettings {
    pub fn is_enabled(&self, phase: Phase) -> bool {
        match phase {
            Phase::Recon => self.recon,
            Phase::Vulnerability => self.vulnerability,
            Phase::Exploitation => self.exploitation,
            Phase::PostExploitation => self.post_exploitation,
            Phase::Reporting => self.reporting,
        }
    }

    pub fn set(&mut self, phase: Phase, enabled: bool) {
        let flag = match phase {
            Phase::Recon => &mut self.recon,
            Phase::Vulnerability => &mut self.vulnerability,
            Phase::Exploitation => &mut self.exploitation,
            Phase::PostExploitation => &mut self.post_exploitation,
            Phase::Reporting => &mut self.reporting,
        };
        *flag = enabled;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrent_tasks: usize,
    pub thresholds: ResourceThresholds,
    pub retry: RetrySettings,
    pub monitoring: MonitoringSettings,
    pub executor: ExecutorSettings,
    pub phases: PhaseSettings,
    pub completed_retention: usize,
    pub authorized_targets: Vec<String>,
    pub phase_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            thresholds: ResourceThresholds::default(),
            retry: RetrySettings::default(),
            monitoring: MonitoringSettings::default(),
            executor: ExecutorSettings::default(),
            phases: PhaseSettings::default(),
            completed_retention: 10_000,
            authorized_targets: Vec::new(),
            phase_timeout_secs: None,
        }
    }
}

impl Config {
    /// Reads and validates a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as unit, not as a mapping
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;

        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.monitoring.history_size == 0 {
            return Err(ConfigError::Invalid(
                "monitoring.history_size must be at least 1".to_string(),
            ));
        }
        if self.retry.base.is_nan() || self.retry.base < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.base must be >= 1.0, got {}",
                self.retry.base
            )));
        }
        if self.executor.batch_size == Some(0) {
            return Err(ConfigError::Invalid(
                "executor.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.base,
            Duration::from_millis(self.retry.unit_ms),
            Duration::from_secs(self.retry.cap_secs),
        )
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.max_concurrent_tasks,
            retry: self.retry_policy(),
            completed_retention: self.completed_retention.max(1),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.interval_ms.max(1))
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.executor.batch_pause_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.executor.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_secs.map(Duration::from_secs)
    }
}
