//! Blueprint and tenant fixtures.

use crate::context::TenantContext;
use serde_json::{json, Value};

/// The smallest blueprint that passes validation.
#[must_use]
pub fn minimal_blueprint() -> Value {
    json!({
        "tech_stack": {
            "backend": "axum",
            "frontend": "react",
            "database": "postgres"
        }
    })
}

/// A blueprint populating every known field.
#[must_use]
pub fn sample_blueprint() -> Value {
    json!({
        "tech_stack": {
            "backend": "axum",
            "frontend": "react",
            "database": "postgres",
            "cache": "redis"
        },
        "schema": {
            "tables": [
                {"name": "users", "columns": ["id", "email"]},
                {"name": "orders", "columns": ["id", "user_id", "total"]}
            ]
        },
        "endpoints": [
            {"method": "GET", "path": "/orders"},
            {"method": "POST", "path": "/orders"}
        ],
        "deployment": {"target": "kubernetes", "replicas": 2},
        "scaling": {"min": 1, "max": 4},
        "monitoring": {"metrics": true, "tracing": true},
        "owner": "platform-team"
    })
}

/// A tenant context with a fixed user.
#[must_use]
pub fn tenant(tenant_id: &str) -> TenantContext {
    TenantContext::new(tenant_id).with_user_id(format!("{tenant_id}-user"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::Blueprint;

    #[test]
    fn test_fixtures_parse() {
        assert!(Blueprint::parse(minimal_blueprint()).is_ok());
        let sample = Blueprint::parse(sample_blueprint()).unwrap();
        assert_eq!(sample.endpoints.len(), 2);
        assert!(tenant("acme").owns("acme"));
    }
}
