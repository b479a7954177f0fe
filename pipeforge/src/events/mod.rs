//! Pipeline lifecycle events.
//!
//! The orchestrator and the degradation manager publish an [`PipelineEvent`]
//! at every lifecycle transition. Sinks are installed per orchestrator; the
//! default discards everything.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A run record was created and the run is about to start.
    #[serde(rename = "run.started")]
    RunStarted,
    /// A stage began its first attempt.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// Stage or overall progress moved.
    #[serde(rename = "progress.updated")]
    ProgressUpdated,
    /// A stage attempt was scored.
    #[serde(rename = "stage.quality_checked")]
    StageQualityChecked,
    /// A stage attempt was rejected and will run again.
    #[serde(rename = "stage.retry")]
    StageRetry,
    /// A stage result passed the gate.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// Every stage was accepted.
    #[serde(rename = "run.completed")]
    RunCompleted,
    /// A stage exhausted its retries.
    #[serde(rename = "run.failed")]
    RunFailed,
    /// A breaker tripped.
    #[serde(rename = "circuit.opened")]
    CircuitOpened,
    /// A breaker admitted its trial call.
    #[serde(rename = "circuit.half_open")]
    CircuitHalfOpen,
    /// A breaker recovered.
    #[serde(rename = "circuit.closed")]
    CircuitClosed,
}

impl EventKind {
    /// Returns the dotted wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::StageStarted => "stage.started",
            Self::ProgressUpdated => "progress.updated",
            Self::StageQualityChecked => "stage.quality_checked",
            Self::StageRetry => "stage.retry",
            Self::StageCompleted => "stage.completed",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::CircuitOpened => "circuit.opened",
            Self::CircuitHalfOpen => "circuit.half_open",
            Self::CircuitClosed => "circuit.closed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event with its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// What happened.
    pub kind: EventKind,
    /// The execution the event belongs to; `None` for breaker events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    /// When the event was produced.
    pub timestamp: Timestamp,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PipelineEvent {
    /// Creates an event for an execution.
    #[must_use]
    pub fn for_execution(kind: EventKind, execution_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            kind,
            execution_id: Some(execution_id),
            timestamp: now_utc(),
            data,
        }
    }

    /// Creates an event not tied to an execution.
    #[must_use]
    pub fn global(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            execution_id: None,
            timestamp: now_utc(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_match_serde() {
        for kind in [EventKind::StageQualityChecked, EventKind::CircuitHalfOpen, EventKind::RunFailed] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_event_constructors() {
        let id = Uuid::now_v7();
        let event = PipelineEvent::for_execution(EventKind::RunStarted, id, serde_json::json!({}));
        assert_eq!(event.execution_id, Some(id));

        let event = PipelineEvent::global(EventKind::CircuitOpened, serde_json::json!({"service": "x"}));
        assert!(event.execution_id.is_none());
    }
}
