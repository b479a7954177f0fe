//! What a stage agent receives.

use crate::blueprint::Blueprint;
use crate::core::AgentType;
use serde_json::{Map, Value};
use std::sync::Arc;

/// The blueprint plus every accepted output so far, keyed `"<stage>_output"`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatedInput {
    project_id: String,
    blueprint: Arc<Blueprint>,
    outputs: Map<String, Value>,
}

impl AccumulatedInput {
    /// Creates the input of the first stage.
    #[must_use]
    pub fn new(project_id: impl Into<String>, blueprint: Arc<Blueprint>) -> Self {
        Self {
            project_id: project_id.into(),
            blueprint,
            outputs: Map::new(),
        }
    }

    /// Project being generated.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// The validated blueprint.
    #[must_use]
    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    /// The accepted output of an earlier stage.
    #[must_use]
    pub fn output(&self, stage: AgentType) -> Option<&Value> {
        self.outputs.get(&stage.output_key())
    }

    /// Every accepted output, keyed by `"<stage>_output"`.
    #[must_use]
    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    /// Merges an accepted output under its stage-qualified key.
    pub fn merge_output(&mut self, stage: AgentType, output: Value) {
        self.outputs.insert(stage.output_key(), output);
    }

    /// True when there is nothing to generate from: a blank project id, or
    /// a tech stack with no usable value and no earlier output.
    #[must_use]
    pub fn is_semantically_empty(&self) -> bool {
        if self.project_id.trim().is_empty() {
            return true;
        }
        let stack_is_blank = self.blueprint.tech_stack.values().all(|v| match v {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        });
        stack_is_blank && self.outputs.is_empty()
    }

    /// The whole input as one JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = self.outputs.clone();
        map.insert("project_id".to_string(), Value::String(self.project_id.clone()));
        map.insert("blueprint".to_string(), self.blueprint.to_value());
        Value::Object(map)
    }
}
