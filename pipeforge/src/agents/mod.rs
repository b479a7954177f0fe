//! Stage agents: the pluggable units that perform a stage's work.
//!
//! The orchestrator owns sequencing, retries and quality gating; an agent
//! only turns its [`AccumulatedInput`] into a [`StageResult`] and grades
//! results through [`StageAgent::quality_check`].

mod fn_agent;
mod input;
mod reporter;

pub use fn_agent::{AsyncFnAgent, FnAgent};
pub use input::AccumulatedInput;
pub use reporter::StageReporter;

use crate::blueprint::Blueprint;
use crate::core::{AgentType, QualityCheck, QualityReport, StageResult};
use async_trait::async_trait;

/// Confidence at which the default confidence check passes.
pub const DEFAULT_CONFIDENCE_PASS: f64 = 0.5;

/// The capability set every stage agent provides.
///
/// Implementations must be safe to call concurrently for different runs.
/// A run never calls the same agent twice at once.
#[async_trait]
pub trait StageAgent: Send + Sync {
    /// The stage this agent serves.
    fn agent_type(&self) -> AgentType;

    /// Performs the stage's work.
    ///
    /// Semantically empty input should produce a failed result rather than
    /// an error. A returned error, a panic or a timeout is converted into a
    /// failed result by the orchestrator.
    async fn execute(
        &self,
        project_id: &str,
        input: &AccumulatedInput,
        reporter: &StageReporter,
    ) -> anyhow::Result<StageResult>;

    /// Grades a result. Failed results must score 0.
    fn quality_check(&self, result: &StageResult) -> QualityReport {
        default_quality_report(result)
    }

    /// Returns false if the agent cannot serve this blueprint.
    fn is_compatible(&self, blueprint: &Blueprint) -> bool {
        let _ = blueprint;
        true
    }
}

/// The report used by agents that do not grade their own results.
///
/// A completed result is scored as the mean of four checks: status,
/// confidence, artifact presence and error absence.
#[must_use]
pub fn default_quality_report(result: &StageResult) -> QualityReport {
    if result.is_failure() {
        return QualityReport::for_failed_result(result);
    }
    QualityReport::from_checks(vec![
        QualityCheck::binary("status", true),
        QualityCheck::scored("confidence", result.confidence_score, DEFAULT_CONFIDENCE_PASS),
        QualityCheck::binary("artifacts", !result.artifacts.is_empty()),
        QualityCheck::binary("no_error", result.error_message.is_none()),
    ])
}
