//! Stage results and quality reports.

use super::{AgentType, FileArtifact, StageStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The result of one stage attempt.
///
/// A result is immutable once returned by an agent; the orchestrator only
/// ever derives a normalized copy before folding it into the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage that produced this result.
    pub agent_type: AgentType,
    /// Whether the attempt completed.
    pub status: StageStatus,
    /// Opaque payload consumed by later stages.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Files produced, in agent order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<FileArtifact>,
    /// Named numeric metrics.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
    /// Wall time of the attempt in seconds.
    pub execution_time: f64,
    /// Agent self-assessed confidence in [0, 1].
    pub confidence_score: f64,
    /// Error message, present iff the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StageResult {
    /// Creates a completed result.
    #[must_use]
    pub fn completed(agent_type: AgentType, output: serde_json::Value) -> Self {
        Self {
            agent_type,
            status: StageStatus::Completed,
            output,
            artifacts: Vec::new(),
            metrics: HashMap::new(),
            execution_time: 0.0,
            confidence_score: 1.0,
            error_message: None,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failed(agent_type: AgentType, error: impl Into<String>) -> Self {
        Self {
            agent_type,
            status: StageStatus::Failed,
            output: serde_json::Value::Null,
            artifacts: Vec::new(),
            metrics: HashMap::new(),
            execution_time: 0.0,
            confidence_score: 0.0,
            error_message: Some(error.into()),
        }
    }

    /// Sets the artifacts.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<FileArtifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Adds a single metric.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Sets the confidence score.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_score = confidence;
        self
    }

    /// Sets the execution time in seconds.
    #[must_use]
    pub fn with_execution_time(mut self, seconds: f64) -> Self {
        self.execution_time = seconds;
        self
    }

    /// Returns true if the attempt completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Completed
    }

    /// Returns true if the attempt failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == StageStatus::Failed
    }

    /// Returns a copy that satisfies the result invariants: confidence in
    /// [0, 1], non-negative execution time, and an error message present iff
    /// the status is failed.
    #[must_use]
    pub fn normalized(mut self, expected: AgentType) -> Self {
        self.agent_type = expected;
        self.confidence_score = if self.confidence_score.is_finite() {
            self.confidence_score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if !self.execution_time.is_finite() || self.execution_time < 0.0 {
            self.execution_time = 0.0;
        }
        match self.status {
            StageStatus::Failed => {
                if self.error_message.as_deref().map_or(true, str::is_empty) {
                    self.error_message = Some(format!("{expected} stage reported failure"));
                }
            }
            StageStatus::Completed => self.error_message = None,
        }
        self
    }
}

/// A named sub-result of a quality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    /// Check name.
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Score of this check in [0, 1].
    pub score: f64,
    /// Optional explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QualityCheck {
    /// Creates a passing or failing check with a binary score.
    #[must_use]
    pub fn binary(name: impl Into<String>, passed: bool) -> Self {
        Self {
            name: name.into(),
            passed,
            score: if passed { 1.0 } else { 0.0 },
            message: None,
        }
    }

    /// Creates a scored check; it passes when the score reaches `pass_at`.
    #[must_use]
    pub fn scored(name: impl Into<String>, score: f64, pass_at: f64) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            name: name.into(),
            passed: score >= pass_at,
            score,
            message: None,
        }
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// The quality assessment of a stage result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Overall score in [0, 1].
    pub overall_score: f64,
    /// Ordered named sub-results.
    #[serde(default)]
    pub checks: Vec<QualityCheck>,
}

impl QualityReport {
    /// Creates a report with an explicit overall score.
    #[must_use]
    pub fn new(overall_score: f64, checks: Vec<QualityCheck>) -> Self {
        Self {
            overall_score: clamp_score(overall_score),
            checks,
        }
    }

    /// Creates a report whose overall score is the mean of its checks.
    #[must_use]
    pub fn from_checks(checks: Vec<QualityCheck>) -> Self {
        if checks.is_empty() {
            return Self::new(0.0, checks);
        }
        let mean = checks.iter().map(|c| c.score).sum::<f64>() / checks.len() as f64;
        Self::new(mean, checks)
    }

    /// The report produced for a failed result.
    #[must_use]
    pub fn for_failed_result(result: &StageResult) -> Self {
        let mut check = QualityCheck::binary("status", false);
        if let Some(ref err) = result.error_message {
            check = check.with_message(err.clone());
        }
        Self::new(0.0, vec![check])
    }

    /// Returns the names of the checks that did not pass.
    #[must_use]
    pub fn failed_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
