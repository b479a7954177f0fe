//! Stage identifiers and status enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed identifier of a pipeline stage and the agent that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Server-side application code.
    Backend,
    /// Client-side application code.
    Frontend,
    /// Schema, migrations and seed data.
    Database,
    /// Deployment and scaling manifests.
    Infrastructure,
    /// Metrics, dashboards and alerting configuration.
    Observability,
    /// Generated test suites.
    Testing,
    /// Project documentation.
    Documentation,
}

impl AgentType {
    /// All stage identifiers in the default pipeline order.
    pub const ALL: [Self; 7] = [
        Self::Backend,
        Self::Frontend,
        Self::Database,
        Self::Infrastructure,
        Self::Observability,
        Self::Testing,
        Self::Documentation,
    ];

    /// Returns the default fixed stage order.
    #[must_use]
    pub fn default_order() -> Vec<Self> {
        Self::ALL.to_vec()
    }

    /// Returns the wire name of the stage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Database => "database",
            Self::Infrastructure => "infrastructure",
            Self::Observability => "observability",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
        }
    }

    /// Returns the key under which this stage's output is merged into the
    /// accumulated input of later stages.
    #[must_use]
    pub fn output_key(&self) -> String {
        format!("{}_output", self.as_str())
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|a| a.as_str() == s.trim().to_ascii_lowercase())
            .copied()
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// The outcome of a single stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The agent produced output.
    Completed,
    /// The agent failed or raised.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The lifecycle status of a whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Record created, no stage started yet.
    #[default]
    Initializing,
    /// Stages are executing.
    Running,
    /// Every stage was accepted.
    Completed,
    /// A stage exhausted its retries.
    Failed,
}

impl ExecutionStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the wire name of the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_type_display_and_parse() {
        assert_eq!(AgentType::Backend.to_string(), "backend");
        assert_eq!("Frontend".parse::<AgentType>(), Ok(AgentType::Frontend));
        assert!("mobile".parse::<AgentType>().is_err());
    }

    #[test]
    fn test_default_order_starts_with_backend() {
        let order = AgentType::default_order();
        assert_eq!(order.first(), Some(&AgentType::Backend));
        assert_eq!(order.len(), 7);
    }

    #[test]
    fn test_output_key() {
        assert_eq!(AgentType::Database.output_key(), "database_output");
    }

    #[test]
    fn test_execution_status_is_terminal() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Initializing.is_terminal());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&ExecutionStatus::Running).unwrap();
        assert_eq!(json, r#""running""#);

        let json = serde_json::to_string(&AgentType::Infrastructure).unwrap();
        assert_eq!(json, r#""infrastructure""#);
    }
}
