//! The upstream blueprint a run generates from.
//!
//! The orchestrator treats the blueprint as opaque beyond a handful of shape
//! checks. Those checks run in [`Blueprint::parse`] before any record is
//! created, so a malformed blueprint never produces a run.

use crate::errors::{ErrorInfo, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Diagnostic codes raised by blueprint validation.
pub mod codes {
    /// The blueprint is not a JSON object.
    pub const NOT_OBJECT: &str = "BLUEPRINT-001-NOT_OBJECT";
    /// `tech_stack` is absent or empty.
    pub const MISSING_TECH_STACK: &str = "BLUEPRINT-002-MISSING_TECH_STACK";
    /// A known field has the wrong JSON type.
    pub const BAD_FIELD: &str = "BLUEPRINT-003-BAD_FIELD";
    /// A registered agent declared the blueprint incompatible.
    pub const INCOMPATIBLE: &str = "BLUEPRINT-004-INCOMPATIBLE";
}

const OBJECT_FIELDS: [&str; 4] = ["schema", "deployment", "scaling", "monitoring"];

/// A validated blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Languages, frameworks and services to generate for.
    pub tech_stack: Map<String, Value>,
    /// Data schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// API endpoint descriptors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Value>,
    /// Deployment target configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Value>,
    /// Scaling configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<Value>,
    /// Monitoring configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<Value>,
    /// Any other top-level fields, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Blueprint {
    /// Validates the minimal shape of a raw blueprint and parses it.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the offending field when the top
    /// level is not an object, `tech_stack` is missing or empty, one of
    /// `schema`/`deployment`/`scaling`/`monitoring` is present but not an
    /// object, or `endpoints` is present but not an array of objects.
    pub fn parse(raw: Value) -> Result<Self, ValidationError> {
        let Value::Object(map) = raw else {
            return Err(ValidationError::new("blueprint must be a JSON object").with_error_info(
                ErrorInfo::new(codes::NOT_OBJECT, "Blueprint is not an object")
                    .with_fix_hint("Pass the approved blueprint document, not a string or array"),
            ));
        };

        match map.get("tech_stack") {
            Some(Value::Object(stack)) if !stack.is_empty() => {}
            Some(Value::Object(_)) | None | Some(Value::Null) => {
                return Err(ValidationError::field(
                    "tech_stack",
                    codes::MISSING_TECH_STACK,
                    "tech_stack is required and must not be empty",
                ));
            }
            Some(other) => return Err(bad_field("tech_stack", "an object", other)),
        }

        for field in OBJECT_FIELDS {
            match map.get(field) {
                None | Some(Value::Null | Value::Object(_)) => {}
                Some(other) => return Err(bad_field(field, "an object", other)),
            }
        }

        match map.get("endpoints") {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                if let Some(pos) = items.iter().position(|e| !e.is_object()) {
                    return Err(ValidationError::field(
                        "endpoints",
                        codes::BAD_FIELD,
                        format!("endpoints[{pos}] must be an object"),
                    ));
                }
            }
            Some(other) => return Err(bad_field("endpoints", "an array", other)),
        }

        let mut map = map;
        // Nulls are treated as absent so `Option`/`Vec` fields deserialize cleanly.
        map.retain(|_, v| !v.is_null());
        serde_json::from_value(Value::Object(map))
            .map_err(|e| ValidationError::new(format!("blueprint could not be decoded: {e}")))
    }

    /// SHA-256 of the canonical JSON encoding, hex encoded.
    ///
    /// Object keys are emitted in sorted order, so two blueprints that differ
    /// only in key order share a fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_value(self)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns a tech-stack entry as a string, if present.
    #[must_use]
    pub fn tech(&self, key: &str) -> Option<&str> {
        self.tech_stack.get(key).and_then(Value::as_str)
    }

    /// Converts back to a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn bad_field(field: &str, expected: &str, got: &Value) -> ValidationError {
    let kind = match got {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    ValidationError::field(
        field,
        codes::BAD_FIELD,
        format!("{field} must be {expected}, got {kind}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "tech_stack": {"backend": "axum", "frontend": "react", "database": "postgres"},
            "schema": {"tables": [{"name": "users"}]},
            "endpoints": [{"method": "GET", "path": "/users"}],
            "deployment": {"target": "kubernetes"},
            "owner": "platform-team"
        })
    }

    #[test]
    fn test_parse_valid_blueprint() {
        let bp = Blueprint::parse(sample()).unwrap();
        assert_eq!(bp.tech("backend"), Some("axum"));
        assert_eq!(bp.endpoints.len(), 1);
        assert!(bp.scaling.is_none());
        assert_eq!(bp.extra.get("owner"), Some(&json!("platform-team")));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        let err = Blueprint::parse(json!(["tech_stack"])).unwrap_err();
        assert_eq!(err.code(), Some(codes::NOT_OBJECT));
    }

    #[test]
    fn test_parse_requires_tech_stack() {
        let err = Blueprint::parse(json!({"schema": {}})).unwrap_err();
        assert_eq!(err.code(), Some(codes::MISSING_TECH_STACK));

        let err = Blueprint::parse(json!({"tech_stack": {}})).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("tech_stack"));

        let err = Blueprint::parse(json!({"tech_stack": "rust"})).unwrap_err();
        assert_eq!(err.code(), Some(codes::BAD_FIELD));
    }

    #[test]
    fn test_parse_checks_field_types() {
        let mut raw = sample();
        raw["scaling"] = json!(3);
        let err = Blueprint::parse(raw).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("scaling"));

        let mut raw = sample();
        raw["endpoints"] = json!([{"path": "/"}, "GET /health"]);
        let err = Blueprint::parse(raw).unwrap_err();
        assert!(err.message.contains("endpoints[1]"));
    }

    #[test]
    fn test_null_fields_are_absent() {
        let mut raw = sample();
        raw["monitoring"] = Value::Null;
        let bp = Blueprint::parse(raw).unwrap();
        assert!(bp.monitoring.is_none());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = Blueprint::parse(sample()).unwrap();
        let b = Blueprint::parse(sample()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let mut raw = sample();
        raw["owner"] = json!("someone-else");
        let c = Blueprint::parse(raw).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
