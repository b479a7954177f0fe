//! Quality gating of stage results.

use crate::core::{QualityReport, StageResult};
use serde::{Deserialize, Serialize};

/// What the orchestrator does with an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// The result is folded into the run.
    Accept {
        /// The score that cleared the threshold.
        score: f64,
    },
    /// The attempt is rejected and the stage retried or the run failed.
    Reject {
        /// The score of the attempt.
        score: f64,
        /// Why it was rejected.
        reason: String,
    },
}

impl GateDecision {
    /// Returns true for [`GateDecision::Accept`].
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept { .. })
    }

    /// The score the decision was based on.
    #[must_use]
    pub fn score(&self) -> f64 {
        match self {
            Self::Accept { score } | Self::Reject { score, .. } => *score,
        }
    }
}

/// Accepts a result when it completed and its score reaches the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    threshold: f64,
}

impl QualityGate {
    /// Creates a gate. The threshold is clamped to [0, 1].
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// The acceptance threshold.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Decides on an attempt.
    #[must_use]
    pub fn evaluate(&self, result: &StageResult, report: &QualityReport) -> GateDecision {
        let score = report.overall_score;
        if result.is_failure() {
            let reason = result
                .error_message
                .clone()
                .unwrap_or_else(|| "stage failed".to_string());
            return GateDecision::Reject { score, reason };
        }
        if score >= self.threshold {
            GateDecision::Accept { score }
        } else {
            let failed = report.failed_checks();
            let reason = if failed.is_empty() {
                format!("quality score {score:.2} below threshold {:.2}", self.threshold)
            } else {
                format!(
                    "quality score {score:.2} below threshold {:.2} (failed checks: {})",
                    self.threshold,
                    failed.join(", ")
                )
            };
            GateDecision::Reject { score, reason }
        }
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(0.7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AgentType, QualityCheck};

    #[test]
    fn test_accepts_at_threshold() {
        let gate = QualityGate::new(0.7);
        let result = StageResult::completed(AgentType::Backend, serde_json::json!({}));
        let decision = gate.evaluate(&result, &QualityReport::new(0.7, Vec::new()));
        assert!(decision.is_accepted());
        assert_eq!(decision.score(), 0.7);
    }

    #[test]
    fn test_rejects_low_score_with_failed_checks() {
        let gate = QualityGate::default();
        let result = StageResult::completed(AgentType::Backend, serde_json::json!({}));
        let report = QualityReport::from_checks(vec![
            QualityCheck::binary("compiles", false),
            QualityCheck::binary("lint", true),
        ]);
        match gate.evaluate(&result, &report) {
            GateDecision::Reject { reason, .. } => assert!(reason.contains("compiles")),
            GateDecision::Accept { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_failed_result_rejected_regardless_of_score() {
        let gate = QualityGate::new(0.0);
        let result = StageResult::failed(AgentType::Backend, "boom");
        let decision = gate.evaluate(&result, &QualityReport::new(1.0, Vec::new()));
        assert_eq!(
            decision,
            GateDecision::Reject {
                score: 1.0,
                reason: "boom".to_string()
            }
        );
    }
}
