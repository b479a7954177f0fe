//! Error types for the pipeforge orchestration core.
//!
//! Only [`ValidationError`] and [`ConfigurationError`] are fatal to a caller;
//! they are raised before any record or log row is written. Everything that
//! goes wrong while a run is in flight is folded into the execution record and
//! its log stream instead of being returned.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for pipeforge operations.
#[derive(Debug, Error)]
pub enum PipeforgeError {
    /// The blueprint failed its pre-run shape checks.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// The pipeline or crate configuration is unusable.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// An agent raised while executing a stage.
    #[error("Stage execution error: {0}")]
    StageExecution(String),

    /// A durable backend could not serve the request.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// A guarded call was skipped because the breaker is open.
    #[error("Circuit open for service '{service}'")]
    CircuitOpen {
        /// The guarded service name.
        service: String,
    },

    /// The execution does not exist for the calling tenant.
    #[error("Execution not found: {execution_id}")]
    NotFound {
        /// The requested execution id.
        execution_id: Uuid,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipeforgeError {
    /// Returns true for errors that are raised before any resource commits.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Configuration(_))
    }
}

impl From<serde_json::Error> for PipeforgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Structured diagnostics attached to validation and configuration errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "BLUEPRINT-002-MISSING_TECH_STACK").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("summary".to_string(), serde_json::json!(self.summary));

        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        if !self.context.is_empty() {
            map.insert("context".to_string(), serde_json::json!(self.context));
        }

        map
    }
}

/// Error raised when a blueprint fails its minimal shape checks.
#[derive(Debug, Clone, Error)]
#[error("Blueprint validation failed: {message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// The offending blueprint field, if any.
    pub field: Option<String>,
    /// Optional diagnostics.
    pub error_info: Option<ErrorInfo>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
            error_info: None,
        }
    }

    /// Creates a validation error for a specific field with a diagnostic code.
    #[must_use]
    pub fn field(field: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        let field = field.into();
        let message = message.into();
        Self {
            error_info: Some(
                ErrorInfo::new(code, message.clone()).with_context_entry("field", field.clone()),
            ),
            message,
            field: Some(field),
        }
    }

    /// Sets the diagnostics.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|i| i.code.as_str())
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!("ValidationError"));
        map.insert("message".to_string(), serde_json::json!(self.message));
        if let Some(ref field) = self.field {
            map.insert("field".to_string(), serde_json::json!(field));
        }
        if let Some(ref info) = self.error_info {
            map.insert("error_info".to_string(), serde_json::json!(info.to_dict()));
        }
        map
    }
}

/// Error raised when the pipeline or runtime configuration is unusable.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional diagnostics.
    pub error_info: Option<ErrorInfo>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostics.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|i| i.code.as_str())
    }
}

/// Errors returned by durable backends.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The backend cannot be reached at all.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the operation.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A stored row could not be decoded.
    #[error("Corrupt stored data: {0}")]
    Corrupt(String),

    /// The backend answered but will never accept this row, for example a
    /// log line whose execution row does not exist.
    #[error("Storage refused row: {0}")]
    Refused(String),
}

impl StorageError {
    /// Returns true if retrying the same write cannot succeed.
    #[must_use]
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Refused(_))
    }
}

/// Error returned by a guarded call that had no fallback to serve.
#[derive(Debug, Error)]
pub enum DegradationError<E> {
    /// The call was skipped because the breaker is open.
    #[error("Circuit open for service '{service}'")]
    CircuitOpen {
        /// The guarded service name.
        service: String,
    },

    /// The call ran and failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> DegradationError<E> {
    /// Returns true if the call was skipped rather than attempted.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<DegradationError<StorageError>> for StorageError {
    fn from(err: DegradationError<StorageError>) -> Self {
        match err {
            DegradationError::CircuitOpen { service } => {
                Self::Unavailable(format!("circuit open for '{service}'"))
            }
            DegradationError::Operation(e) => e,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = PipeforgeError> = std::result::Result<T, E>;
