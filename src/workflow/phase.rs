//! Workflow Phases
//!
//! Phases run in a fixed total order. Sensitive phases need an
//! authorization check before they are entered.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::state::WorkflowState;

/// A coarse-grained stage of a workflow run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Recon,
    Vulnerability,
    Exploitation,
    PostExploitation,
    Reporting,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Phase; 5] = [
        Phase::Recon,
        Phase::Vulnerability,
        Phase::Exploitation,
        Phase::PostExploitation,
        Phase::Reporting,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Recon => "recon",
            Self::Vulnerability => "vulnerability",
            Self::Exploitation => "exploitation",
            Self::PostExploitation => "post_exploitation",
            Self::Reporting => "reporting",
        }
    }

    /// Sensitive phases are entered only after authorization.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Exploitation | Self::PostExploitation)
    }

    /// State while the phase's tasks run.
    pub fn running_state(&self) -> WorkflowState {
        match self {
            Self::Recon => WorkflowState::ReconRunning,
            Self::Vulnerability => WorkflowState::VulnRunning,
            Self::Exploitation => WorkflowState::ExploitRunning,
            Self::PostExploitation => WorkflowState::PostExploitRunning,
            Self::Reporting => WorkflowState::Reporting,
        }
    }

    /// State once the phase's results are committed.
    pub fn complete_state(&self) -> WorkflowState {
        match self {
            Self::Recon => WorkflowState::ReconComplete,
            Self::Vulnerability => WorkflowState::VulnComplete,
            Self::Exploitation => WorkflowState::ExploitComplete,
            Self::PostExploitation => WorkflowState::PostExploitComplete,
            Self::Reporting => WorkflowState::Complete,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "recon" | "reconnaissance" => Ok(Self::Recon),
            "vulnerability" | "vuln" | "assessment" => Ok(Self::Vulnerability),
            "exploitation" | "exploit" => Ok(Self::Exploitation),
            "post_exploitation" | "post_exploit" => Ok(Self::PostExploitation),
            "reporting" | "report" => Ok(Self::Reporting),
            _ => Err(format!("unknown phase '{}'", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_are_totally_ordered() {
        let mut sorted = Phase::ALL;
        sorted.sort();
        assert_eq!(sorted, Phase::ALL);
        assert!(Phase::Recon < Phase::Reporting);
    }

    #[test]
    fn test_sensitive_phases() {
        let sensitive: Vec<_> = Phase::ALL.iter().filter(|p| p.is_sensitive()).collect();
        assert_eq!(sensitive, vec![&Phase::Exploitation, &Phase::PostExploitation]);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Post-Exploitation".parse::<Phase>(), Ok(Phase::PostExploitation));
        assert_eq!("vuln".parse::<Phase>(), Ok(Phase::Vulnerability));
        assert_eq!(" recon ".parse::<Phase>(), Ok(Phase::Recon));
        assert!("lateral".parse::<Phase>().is_err());
    }

    #[test]
    fn test_reporting_completes_the_workflow() {
        assert_eq!(Phase::Reporting.running_state(), WorkflowState::Reporting);
        assert_eq!(Phase::Reporting.complete_state(), WorkflowState::Complete);
    }

    #[test]
    fn test_serde_names_match_display() {
        for phase in Phase::ALL {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase));
        }
    }
}
