//! The fixed seven-phase lifecycle.
//!
//! Phases are totally ordered. The only legal transition is from a phase to
//! its immediate successor; [`Phase::next`] is the single source of that order.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One stage of the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RequirementAnalysis,
    TaskDecomposition,
    Planning,
    Execution,
    Qa,
    CompletionValidation,
    Report,
}

impl Phase {
    /// All phases in lifecycle order.
    pub const ALL: [Phase; 7] = [
        Phase::RequirementAnalysis,
        Phase::TaskDecomposition,
        Phase::Planning,
        Phase::Execution,
        Phase::Qa,
        Phase::CompletionValidation,
        Phase::Report,
    ];

    pub fn first() -> Phase {
        Phase::RequirementAnalysis
    }

    /// Position in the lifecycle, starting at 0.
    pub fn index(&self) -> usize {
        Phase::ALL
            .iter()
            .position(|p| p == self)
            .unwrap_or_default()
    }

    /// The immediate successor, or `None` for the final phase.
    pub fn next(&self) -> Option<Phase> {
        Phase::ALL.get(self.index() + 1).copied()
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    /// Short identifier used in config keys and file names.
    pub fn slug(&self) -> &'static str {
        match self {
            Phase::RequirementAnalysis => "requirement_analysis",
            Phase::TaskDecomposition => "task_decomposition",
            Phase::Planning => "planning",
            Phase::Execution => "execution",
            Phase::Qa => "qa",
            Phase::CompletionValidation => "completion_validation",
            Phase::Report => "report",
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::RequirementAnalysis => "Requirement Analysis",
            Phase::TaskDecomposition => "Task Decomposition",
            Phase::Planning => "Planning",
            Phase::Execution => "Execution",
            Phase::Qa => "QA",
            Phase::CompletionValidation => "Completion Validation",
            Phase::Report => "Report",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Phase::ALL
            .iter()
            .find(|p| p.slug() == normalized)
            .copied()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid phase '{}'. Valid values: {}",
                    s,
                    Phase::ALL
                        .iter()
                        .map(|p| p.slug())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}
