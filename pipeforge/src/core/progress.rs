//! Progress snapshot exposed to callers.

use super::{AgentType, ExecutionStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A point-in-time view of a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationProgress {
    /// The execution this snapshot belongs to.
    pub execution_id: Uuid,
    /// The project being generated.
    pub project_id: String,
    /// The stage currently executing, if any.
    pub current_stage: Option<AgentType>,
    /// The execution status.
    pub status: ExecutionStatus,
    /// Overall progress in [0, 100], monotonic within a run.
    pub overall_progress: f64,
    /// Progress of the current stage in [0, 100].
    pub stage_progress: f64,
    /// Number of accepted stages.
    pub stages_completed: usize,
    /// Number of stages in the pipeline.
    pub total_stages: usize,
}

impl GenerationProgress {
    /// Returns true once the run has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
