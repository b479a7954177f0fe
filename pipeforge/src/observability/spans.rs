//! OpenTelemetry-style attribute maps attached to run and stage events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Attributes describing a whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSpanAttributes {
    /// Execution id.
    pub execution_id: String,
    /// Project id.
    pub project_id: Option<String>,
    /// Tenant id.
    pub tenant_id: Option<String>,
    /// Blueprint fingerprint.
    pub blueprint_fingerprint: Option<String>,
    /// Number of stages in the run.
    pub total_stages: Option<usize>,
    /// Final status.
    pub status: Option<String>,
}

impl RunSpanAttributes {
    /// Creates attributes for an execution.
    #[must_use]
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            ..Default::default()
        }
    }

    /// Sets the project id.
    #[must_use]
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Sets the tenant id.
    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the blueprint fingerprint.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.blueprint_fingerprint = Some(fingerprint.into());
        self
    }

    /// Sets the stage count.
    #[must_use]
    pub fn with_total_stages(mut self, total: usize) -> Self {
        self.total_stages = Some(total);
        self
    }

    /// Sets the final status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Converts to OpenTelemetry attributes.
    #[must_use]
    pub fn to_otel_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("pipeline.execution_id".to_string(), self.execution_id.clone());
        if let Some(ref v) = self.project_id {
            attrs.insert("pipeline.project_id".to_string(), v.clone());
        }
        if let Some(ref v) = self.tenant_id {
            attrs.insert("pipeline.tenant_id".to_string(), v.clone());
        }
        if let Some(ref v) = self.blueprint_fingerprint {
            attrs.insert("pipeline.blueprint".to_string(), v.clone());
        }
        if let Some(v) = self.total_stages {
            attrs.insert("pipeline.total_stages".to_string(), v.to_string());
        }
        if let Some(ref v) = self.status {
            attrs.insert("pipeline.status".to_string(), v.clone());
        }
        attrs
    }
}

/// Attributes describing one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpanAttributes {
    /// Stage name.
    pub stage_name: String,
    /// Number of attempts made.
    pub attempts: Option<u32>,
    /// Last quality score.
    pub score: Option<f64>,
    /// Stage status.
    pub status: Option<String>,
    /// Duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Number of artifacts produced by the accepted attempt.
    pub artifact_count: Option<usize>,
}

impl StageSpanAttributes {
    /// Creates attributes for a stage.
    #[must_use]
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            ..Default::default()
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the quality score.
    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Sets the stage status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the artifact count.
    #[must_use]
    pub fn with_artifact_count(mut self, count: usize) -> Self {
        self.artifact_count = Some(count);
        self
    }

    /// Converts to OpenTelemetry attributes.
    #[must_use]
    pub fn to_otel_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("stage.name".to_string(), self.stage_name.clone());
        if let Some(v) = self.attempts {
            attrs.insert("stage.attempts".to_string(), v.to_string());
        }
        if let Some(v) = self.score {
            attrs.insert("stage.quality_score".to_string(), v.to_string());
        }
        if let Some(ref v) = self.status {
            attrs.insert("stage.status".to_string(), v.clone());
        }
        if let Some(v) = self.duration_ms {
            attrs.insert("stage.duration_ms".to_string(), v.to_string());
        }
        if let Some(ref v) = self.error {
            attrs.insert("stage.error".to_string(), v.clone());
        }
        if let Some(v) = self.artifact_count {
            attrs.insert("stage.artifacts".to_string(), v.to_string());
        }
        attrs
    }

    /// Converts to a JSON object suitable for an event payload.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!(self.to_otel_attributes())
    }
}

/// Wall-clock timer for a named span.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the elapsed time in seconds.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration in milliseconds.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_attributes() {
        let otel = RunSpanAttributes::new("exec-1")
            .with_project("proj")
            .with_total_stages(7)
            .to_otel_attributes();
        assert_eq!(otel.get("pipeline.execution_id"), Some(&"exec-1".to_string()));
        assert_eq!(otel.get("pipeline.total_stages"), Some(&"7".to_string()));
        assert!(!otel.contains_key("pipeline.status"));
    }

    #[test]
    fn test_stage_span_attributes() {
        let otel = StageSpanAttributes::new("backend")
            .with_status("completed")
            .with_attempts(2)
            .with_duration_ms(123.45)
            .to_otel_attributes();
        assert_eq!(otel.get("stage.name"), Some(&"backend".to_string()));
        assert_eq!(otel.get("stage.attempts"), Some(&"2".to_string()));
        assert_eq!(otel.get("stage.duration_ms"), Some(&"123.45".to_string()));
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("backend");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(timer.name(), "backend");
        assert!(timer.finish() >= 10.0);
    }
}
