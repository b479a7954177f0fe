//! The progress sink handed to a running agent.

use crate::core::AgentType;
use crate::events::{EventKind, EventSink, NoOpEventSink, PipelineEvent};
use crate::logs::{ExecutionLogStore, LogEntry, LogLevel};
use crate::records::ExecutionRecord;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Lets an agent move its stage's progress and write stage-tagged log lines.
///
/// Progress updates go straight into the run's live record, so readers of
/// the execution see them immediately. Updates are clamped to [0, 100] and
/// backwards moves are ignored.
#[derive(Clone)]
pub struct StageReporter {
    stage: AgentType,
    record: Arc<RwLock<ExecutionRecord>>,
    logs: Option<Arc<ExecutionLogStore>>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for StageReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageReporter")
            .field("stage", &self.stage)
            .field("execution_id", &self.record.read().id)
            .finish_non_exhaustive()
    }
}

impl StageReporter {
    pub(crate) fn new(
        stage: AgentType,
        record: Arc<RwLock<ExecutionRecord>>,
        logs: Arc<ExecutionLogStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            stage,
            record,
            logs: Some(logs),
            events,
        }
    }

    /// A reporter bound to a private record and no log store, for driving an
    /// agent outside an orchestrator.
    #[must_use]
    pub fn detached(stage: AgentType, project_id: &str) -> Self {
        let mut record = ExecutionRecord::new(project_id, "detached", vec![stage]);
        record.mark_running();
        record.begin_stage(stage);
        Self {
            stage,
            record: Arc::new(RwLock::new(record)),
            logs: None,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// The stage this reporter belongs to.
    #[must_use]
    pub fn stage(&self) -> AgentType {
        self.stage
    }

    /// The current stage progress.
    #[must_use]
    pub fn stage_progress(&self) -> f64 {
        self.record.read().stage_progress
    }

    /// Moves the stage's progress to `pct`. Values are clamped to [0, 100];
    /// a value at or below the current progress is ignored.
    pub fn report_progress(&self, pct: f64) {
        let snapshot = {
            let mut record = self.record.write();
            if record.current_stage != Some(self.stage) || !record.update_stage_progress(pct) {
                return;
            }
            record.progress()
        };
        self.events.try_emit(PipelineEvent::for_execution(
            EventKind::ProgressUpdated,
            snapshot.execution_id,
            serde_json::json!({
                "stage": self.stage,
                "stage_progress": snapshot.stage_progress,
                "overall_progress": snapshot.overall_progress,
            }),
        ));
    }

    /// Writes a log line tagged with this stage.
    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) {
        let Some(logs) = &self.logs else {
            return;
        };
        let mut entry = {
            let record = self.record.read();
            LogEntry::new(
                record.id,
                record.tenant_id.clone(),
                record.project_id.clone(),
                level,
                message,
            )
            .with_stage(self.stage)
        };
        entry.metadata = metadata;
        logs.append(entry).await;
    }

    /// Shorthand for an info line.
    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None).await;
    }
}
