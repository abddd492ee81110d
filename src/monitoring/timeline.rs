//! Phase Timeline
//!
//! Records when each workflow phase started and how it ended, for the
//! run report and the ASCII chart printed by the CLI.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseEvent {
    Started,
    Completed,
    Skipped,
    Failed,
}

impl PhaseEvent {
    fn ends_phase(self) -> bool {
        !matches!(self, Self::Started)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub phase: String,
    pub event: PhaseEvent,
    pub at: DateTime<Utc>,
}

/// Ordered log of phase events for one workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimeline {
    entries: Vec<TimelineEntry>,
}

impl PhaseTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, phase: impl Into<String>, event: PhaseEvent) {
        self.record_at(phase, event, Utc::now());
    }

    pub fn record_at(&mut self, phase: impl Into<String>, event: PhaseEvent, at: DateTime<Utc>) {
        self.entries.push(TimelineEntry {
            phase: phase.into(),
            event,
            at,
        });
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Last recorded outcome of a phase, if any.
    pub fn outcome(&self, phase: &str) -> Option<PhaseEvent> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.phase == phase)
            .map(|e| e.event)
    }

    /// Wall time of each phase that both started and ended.
    pub fn durations(&self) -> BTreeMap<String, Duration> {
        let mut starts: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        let mut durations = BTreeMap::new();

        for entry in &self.entries {
            if entry.event == PhaseEvent::Started {
                starts.insert(&entry.phase, entry.at);
            } else if let Some(start) = starts.get(entry.phase.as_str()) {
                let elapsed = (entry.at - *start).to_std().unwrap_or_default();
                durations.insert(entry.phase.clone(), elapsed);
            }
        }

        durations
    }

    /// Time from the first to the last recorded event.
    pub fn span(&self) -> Duration {
        match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => (last.at - first.at).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// Renders an ASCII chart of the phases, 40 columns wide.
    pub fn chart(&self) -> String {
        let mut output = String::from("Phase Timeline:\n");

        let Some(origin) = self.entries.first().map(|e| e.at) else {
            return output;
        };
        let total_ms = self.span().as_millis().max(1) as f64;
        let scale = 40.0 / total_ms;

        let mut bars: Vec<(String, u128, u128, PhaseEvent)> = Vec::new();
        for entry in &self.entries {
            let offset = (entry.at - origin).num_milliseconds().max(0) as u128;
            match entry.event {
                PhaseEvent::Started => bars.push((entry.phase.clone(), offset, offset, entry.event)),
                event => {
                    match bars.iter_mut().rev().find(|b| b.0 == entry.phase) {
                        Some(bar) => {
                            bar.2 = offset;
                            bar.3 = event;
                        }
                        // Skipped phases never start
                        None => bars.push((entry.phase.clone(), offset, offset, event)),
                    }
                }
            }
        }

        for (phase, start, end, event) in bars {
            let lead = (start as f64 * scale) as usize;
            let width = if event.ends_phase() && event != PhaseEvent::Skipped {
                (((end - start) as f64 * scale) as usize).max(1)
            } else {
                0
            };
            output.push_str(&format!(
                "{:<18}|{}{}| {:?} ({} ms)\n",
                phase,
                " ".repeat(lead),
                "#".repeat(width),
                event,
                end - start
            ));
        }

        output
    }
}
