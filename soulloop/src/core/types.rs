//! Shared deterministic types for the soul model and the iteration loop.
//!
//! These enums are persisted (inside JSON blobs and the `status` column), so
//! their serialized spelling is a stable contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a soul.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoulStatus {
    /// Idle: created, or judged production ready with no open bugs.
    Standby,
    /// An iteration has been launched and the loop has not settled.
    Working,
}

impl SoulStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standby => "standby",
            Self::Working => "working",
        }
    }
}

impl fmt::Display for SoulStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SoulStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standby" => Ok(Self::Standby),
            "working" => Ok(Self::Working),
            other => Err(format!("unknown soul status '{other}'")),
        }
    }
}

/// Inferred bug severity, ordered most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BugStatus {
    Open,
    Fixed,
}

/// What an iteration was launched to do.
///
/// The literal purpose string is still stored on the iteration for display,
/// but branching only ever looks at this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationKind {
    /// Implement or fix exactly one thing.
    Development,
    /// Assess readiness and emit `PRODUCTION READY` or a prioritized issue list.
    Test,
}

impl IterationKind {
    pub fn purpose(self) -> &'static str {
        match self {
            Self::Development => "Development iteration",
            Self::Test => "Test iteration",
        }
    }
}

impl fmt::Display for IterationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => f.write_str("development"),
            Self::Test => f.write_str("test"),
        }
    }
}

/// Status reported by the agent executor for a launched agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Failed or killed: the run ended abnormally and the loop re-tests.
    pub fn is_abnormal(self) -> bool {
        matches!(self, Self::Failed | Self::Killed)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soul_status_round_trips_through_str() {
        for status in [SoulStatus::Standby, SoulStatus::Working] {
            assert_eq!(status.as_str().parse::<SoulStatus>(), Ok(status));
        }
        assert!("sleeping".parse::<SoulStatus>().is_err());
    }

    #[test]
    fn severity_orders_most_severe_first() {
        let mut all = vec![Severity::Low, Severity::Critical, Severity::Medium, Severity::High];
        all.sort();
        assert_eq!(
            all,
            vec![Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
        );
    }

    #[test]
    fn only_failed_and_killed_are_abnormal() {
        assert!(!AgentStatus::Running.is_terminal());
        assert!(!AgentStatus::Finished.is_abnormal());
        assert!(AgentStatus::Failed.is_abnormal());
        assert!(AgentStatus::Killed.is_abnormal());
    }
}
