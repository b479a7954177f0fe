//! Caller identity.
//!
//! Every exposed orchestrator operation takes a [`TenantContext`]. Records
//! and log entries are stamped with its tenant id at creation and every
//! lookup is filtered by it, so an execution owned by another tenant is
//! indistinguishable from one that does not exist.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identity of the caller of an orchestrator operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    /// The tenant that owns the data being read or written.
    pub tenant_id: String,

    /// The acting user, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Correlation id of the calling request.
    pub request_id: Uuid,
}

impl TenantContext {
    /// Creates a context for a tenant with a fresh request id.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
            request_id: Uuid::new_v4(),
        }
    }

    /// Sets the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    /// Returns true if this context may see data owned by `tenant_id`.
    #[must_use]
    pub fn owns(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id
    }

    /// Converts to a dictionary with string values (or null).
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("tenant_id".to_string(), serde_json::json!(self.tenant_id));
        map.insert(
            "user_id".to_string(),
            self.user_id
                .as_ref()
                .map_or(serde_json::Value::Null, |u| serde_json::json!(u)),
        );
        map.insert(
            "request_id".to_string(),
            serde_json::json!(self.request_id.to_string()),
        );
        map
    }
}
