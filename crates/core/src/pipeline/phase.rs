//! # Pipeline Phases
//!
//! Phases of a migration run. Each phase is one node of the pipeline graph,
//! named by its `as_str` form.

use serde::{Deserialize, Serialize};

/// Phase of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Run created, nothing done yet
    Init,
    /// Inspecting the legacy input
    Analyzing,
    /// Generating target artifacts
    Building,
    /// Running the generated artifacts
    Executing,
    /// Comparing results against the source
    Validating,
    /// Explaining a failed validation and proposing a fix
    Diagnosing,
    /// Complete
    Complete,
    /// Failed
    Failed,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Init,
        Phase::Analyzing,
        Phase::Building,
        Phase::Executing,
        Phase::Validating,
        Phase::Diagnosing,
        Phase::Complete,
        Phase::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Analyzing => "analyzing",
            Phase::Building => "building",
            Phase::Executing => "executing",
            Phase::Validating => "validating",
            Phase::Diagnosing => "diagnosing",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }

    /// Registered tool doing this phase's work
    pub fn tool(&self) -> Option<&'static str> {
        match self {
            Phase::Analyzing => Some("analyze"),
            Phase::Building => Some("build"),
            Phase::Executing => Some("execute"),
            Phase::Validating => Some("validate"),
            Phase::Diagnosing => Some("diagnose"),
            _ => None,
        }
    }

    /// State key holding the phase's tool result
    pub fn output_key(&self) -> Option<&'static str> {
        match self {
            Phase::Analyzing => Some("analysis"),
            Phase::Building => Some("build"),
            Phase::Executing => Some("execution"),
            Phase::Validating => Some("validation"),
            Phase::Diagnosing => Some("diagnosis"),
            _ => None,
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("Unknown phase: {}", s))
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>(), Ok(phase));
        }
        assert!("bogus".parse::<Phase>().is_err());
        assert_eq!(crate::graph::INITIAL_PHASE, Phase::Init.as_str());
    }

    #[test]
    fn test_only_working_phases_have_tools() {
        let with_tools: Vec<Phase> = Phase::ALL.into_iter().filter(|p| p.tool().is_some()).collect();
        assert_eq!(with_tools.len(), 5);
        assert!(Phase::Complete.is_terminal());
        assert!(!Phase::Diagnosing.is_terminal());
    }
}
