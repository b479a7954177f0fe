//! Log entries and severities.

use crate::core::AgentType;
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fixed severity set, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal lifecycle.
    Info,
    /// Something unexpected that the run survived.
    Warning,
    /// A stage attempt failed.
    Error,
    /// The run failed.
    Critical,
}

impl LogLevel {
    /// All levels, least severe first.
    pub const ALL: [Self; 5] = [Self::Debug, Self::Info, Self::Warning, Self::Error, Self::Critical];

    /// Uppercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" | "FATAL" => Ok(Self::Critical),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// One structured log line of an execution.
///
/// `id` is the per-execution sequence number. It is zero until the log store
/// assigns it on append, and strictly increases in append order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Per-execution sequence number.
    pub id: u64,
    /// Owning execution.
    pub execution_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Project being generated.
    pub project_id: String,
    /// When the entry was written.
    pub timestamp: Timestamp,
    /// Severity.
    pub level: LogLevel,
    /// Human readable message.
    pub message: String,
    /// Stage the entry belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<AgentType>,
    /// Structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl LogEntry {
    /// Creates an unsequenced entry stamped with the current time.
    #[must_use]
    pub fn new(
        execution_id: Uuid,
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            execution_id,
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            timestamp: now_utc(),
            level,
            message: message.into(),
            stage: None,
            metadata: None,
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: AgentType) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sort key used by every backend: timestamp, then sequence.
    #[must_use]
    pub fn sort_key(&self) -> (Timestamp, u64) {
        (self.timestamp, self.id)
    }
}
