//! The durable representation of one run.

use crate::core::{AgentType, ExecutionStatus, GenerationProgress};
use crate::utils::{generate_uuid_v7, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Ceiling on overall progress while a run is not completed.
pub const MAX_PROGRESS_BEFORE_COMPLETION: f64 = 99.0;

/// One run of the pipeline.
///
/// Lifecycle methods enforce the record invariants: a terminal record is
/// never mutated again, `stages_completed` is always a prefix of
/// `stage_order`, and `overall_progress` never decreases and stays below 100
/// until the run completes. Methods return `false` when they refused a
/// change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution id.
    pub id: Uuid,
    /// Project being generated.
    pub project_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Fingerprint of the blueprint the run started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint_fingerprint: Option<String>,
    /// Lifecycle status.
    pub status: ExecutionStatus,
    /// Fixed stage order of this run.
    pub stage_order: Vec<AgentType>,
    /// The first stage not yet accepted; `None` once every stage is.
    pub current_stage: Option<AgentType>,
    /// When the record was created.
    pub started_at: Timestamp,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// When the current stage's first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage_started_at: Option<Timestamp>,
    /// Accepted stages, in order.
    pub stages_completed: Vec<AgentType>,
    /// Seconds spent per accepted stage, all attempts included.
    pub stage_durations: BTreeMap<AgentType, f64>,
    /// Overall progress in [0, 100].
    pub overall_progress: f64,
    /// Progress of the current stage in [0, 100].
    pub stage_progress: f64,
    /// Why the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Rejected attempts across the whole run.
    pub retry_count: u32,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

impl ExecutionRecord {
    /// Creates an initializing record positioned at the first stage.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        tenant_id: impl Into<String>,
        stage_order: Vec<AgentType>,
    ) -> Self {
        let now = now_utc();
        Self {
            id: generate_uuid_v7(),
            project_id: project_id.into(),
            tenant_id: tenant_id.into(),
            blueprint_fingerprint: None,
            status: ExecutionStatus::Initializing,
            current_stage: stage_order.first().copied(),
            stage_order,
            started_at: now,
            completed_at: None,
            current_stage_started_at: None,
            stages_completed: Vec::new(),
            stage_durations: BTreeMap::new(),
            overall_progress: 0.0,
            stage_progress: 0.0,
            error_message: None,
            retry_count: 0,
            updated_at: now,
        }
    }

    /// Sets the blueprint fingerprint.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.blueprint_fingerprint = Some(fingerprint.into());
        self
    }

    /// Returns true once completed or failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of stages in the run.
    #[must_use]
    pub fn total_stages(&self) -> usize {
        self.stage_order.len()
    }

    /// Initializing to running.
    pub fn mark_running(&mut self) -> bool {
        if self.status != ExecutionStatus::Initializing {
            return false;
        }
        self.status = ExecutionStatus::Running;
        self.touch();
        true
    }

    /// Marks the start of a stage's first attempt and resets stage progress.
    pub fn begin_stage(&mut self, stage: AgentType) -> bool {
        if self.is_terminal() || self.current_stage != Some(stage) {
            return false;
        }
        self.current_stage_started_at = Some(now_utc());
        self.stage_progress = 0.0;
        self.touch();
        true
    }

    /// Moves the current stage's progress forward. Returns true if anything
    /// changed; backwards moves are ignored.
    pub fn update_stage_progress(&mut self, pct: f64) -> bool {
        if self.is_terminal() || self.current_stage.is_none() || !pct.is_finite() {
            return false;
        }
        let pct = pct.clamp(0.0, 100.0);
        if pct <= self.stage_progress {
            return false;
        }
        self.stage_progress = pct;
        self.recompute_overall();
        self.touch();
        true
    }

    /// Counts a rejected attempt and rewinds stage progress for the next
    /// one. Overall progress keeps its high-water mark.
    pub fn record_retry(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.stage_progress = 0.0;
        self.touch();
        true
    }

    /// Folds in an accepted stage and advances to the next one.
    pub fn complete_stage(&mut self, stage: AgentType, duration_secs: f64) -> bool {
        if self.is_terminal() || self.current_stage != Some(stage) {
            return false;
        }
        let next_index = self.stages_completed.len();
        if self.stage_order.get(next_index) != Some(&stage) {
            return false;
        }
        self.stages_completed.push(stage);
        self.stage_durations.insert(stage, duration_secs.max(0.0));
        self.stage_progress = 0.0;
        self.current_stage = self.stage_order.get(next_index + 1).copied();
        self.current_stage_started_at = None;
        self.recompute_overall();
        self.touch();
        true
    }

    /// Ends the run successfully. Requires every stage to be accepted.
    pub fn mark_completed(&mut self) -> bool {
        if self.is_terminal() || self.stages_completed.len() != self.stage_order.len() {
            return false;
        }
        self.status = ExecutionStatus::Completed;
        self.overall_progress = 100.0;
        self.stage_progress = 0.0;
        self.current_stage = None;
        self.completed_at = Some(now_utc());
        self.touch();
        true
    }

    /// Ends the run with an error. Progress is left where it was.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = ExecutionStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(now_utc());
        self.touch();
        true
    }

    /// Snapshot for progress readers.
    #[must_use]
    pub fn progress(&self) -> GenerationProgress {
        GenerationProgress {
            execution_id: self.id,
            project_id: self.project_id.clone(),
            current_stage: self.current_stage,
            status: self.status,
            overall_progress: self.overall_progress,
            stage_progress: self.stage_progress,
            stages_completed: self.stages_completed.len(),
            total_stages: self.stage_order.len(),
        }
    }

    /// Wall time of the run so far, or in total once terminal.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(now_utc);
        (end - self.started_at).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
    }

    fn recompute_overall(&mut self) {
        let total = self.stage_order.len();
        if total == 0 {
            return;
        }
        let done = self.stages_completed.len() as f64 + self.stage_progress / 100.0;
        let computed = (100.0 * done / total as f64).min(MAX_PROGRESS_BEFORE_COMPLETION);
        self.overall_progress = self.overall_progress.max(computed);
    }

    fn touch(&mut self) {
        self.updated_at = now_utc();
    }
}
