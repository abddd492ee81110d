//! Resource Monitoring Module
//!
//! Host resource readings, threshold checks and admission advice, plus
//! the phase timeline recorded during workflow runs.
//!
//! # Components
//!
//! - [`ResourceManager`]: Snapshot history, limit checks, sizing and reservations
//! - [`ResourceProbe`]: Source of readings ([`SystemProbe`] or [`StaticProbe`])
//! - [`PhaseTimeline`]: Phase start/end events for reports

pub mod probe;
pub mod resource;
pub mod timeline;

pub use probe::{ProbeError, ResourceProbe, ResourceSnapshot, StaticProbe, SystemProbe};
pub use resource::{
    check_limits, is_within_limits, Breach, Recommendation, Reservation, ResourceManager,
    ResourceThresholds, TaskProfile, WorkloadKind, DEFAULT_HISTORY_SIZE,
};
pub use timeline::{PhaseEvent, PhaseTimeline, TimelineEntry};
