//! The fixed stage order and the agents that serve it.
//!
//! Also home of the `PIPELINE-*` diagnostic codes.

use crate::agents::StageAgent;
use crate::blueprint::{codes as blueprint_codes, Blueprint};
use crate::core::AgentType;
use crate::errors::{ConfigurationError, ErrorInfo, ValidationError};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Diagnostic codes raised while building a registry.
pub mod codes {
    /// The stage order is empty.
    pub const EMPTY: &str = "PIPELINE-001-EMPTY";
    /// A stage appears twice in the order.
    pub const DUPLICATE_STAGE: &str = "PIPELINE-002-DUPLICATE_STAGE";
    /// A position in the order has no agent.
    pub const MISSING_AGENT: &str = "PIPELINE-003-MISSING_AGENT";
    /// The operation needs a finished run.
    pub const RUN_IN_PROGRESS: &str = "PIPELINE-004-RUN_IN_PROGRESS";
}

/// A validated mapping from every position of a fixed stage order to its
/// agent. The orchestrator only ever looks agents up by stage id.
#[derive(Clone)]
pub struct StageRegistry {
    order: Vec<AgentType>,
    agents: HashMap<AgentType, Arc<dyn StageAgent>>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl StageRegistry {
    /// Starts a registry using the default stage order.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::new()
    }

    /// The fixed stage order.
    #[must_use]
    pub fn order(&self) -> &[AgentType] {
        &self.order
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Always false for a built registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The agent serving `stage`, if the stage is part of the order.
    #[must_use]
    pub fn agent(&self, stage: AgentType) -> Option<&Arc<dyn StageAgent>> {
        self.agents.get(&stage)
    }

    /// Asks every agent whether it can serve the blueprint.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] listing the stages that declined.
    pub fn check_compatibility(&self, blueprint: &Blueprint) -> Result<(), ValidationError> {
        let declined: Vec<&str> = self
            .order
            .iter()
            .filter(|stage| {
                self.agents
                    .get(*stage)
                    .is_some_and(|agent| !agent.is_compatible(blueprint))
            })
            .map(AgentType::as_str)
            .collect();
        if declined.is_empty() {
            return Ok(());
        }
        let message = format!("blueprint is incompatible with stages: {}", declined.join(", "));
        Err(ValidationError::new(message.clone()).with_error_info(
            ErrorInfo::new(blueprint_codes::INCOMPATIBLE, message)
                .with_context_entry("stages", declined.join(","))
                .with_fix_hint("Adjust the tech stack or register agents that support it."),
        ))
    }
}

/// Builder for [`StageRegistry`].
#[derive(Default)]
pub struct StageRegistryBuilder {
    order: Option<Vec<AgentType>>,
    agents: HashMap<AgentType, Arc<dyn StageAgent>>,
}

impl fmt::Debug for StageRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut registered: Vec<_> = self.agents.keys().collect();
        registered.sort();
        f.debug_struct("StageRegistryBuilder")
            .field("order", &self.order)
            .field("registered", &registered)
            .finish()
    }
}

impl StageRegistryBuilder {
    /// Creates a builder with the default order and no agents.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stage order.
    #[must_use]
    pub fn order(mut self, order: Vec<AgentType>) -> Self {
        self.order = Some(order);
        self
    }

    /// Registers an agent under the stage it declares. A later registration
    /// for the same stage replaces the earlier one.
    #[must_use]
    pub fn agent(mut self, agent: Arc<dyn StageAgent>) -> Self {
        self.agents.insert(agent.agent_type(), agent);
        self
    }

    /// Registers several agents.
    #[must_use]
    pub fn agents(self, agents: impl IntoIterator<Item = Arc<dyn StageAgent>>) -> Self {
        agents.into_iter().fold(self, Self::agent)
    }

    /// Validates the order against the registered agents.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] when the order is empty, names a
    /// stage twice, or has a position with no registered agent.
    pub fn build(self) -> Result<StageRegistry, ConfigurationError> {
        let order = self.order.unwrap_or_else(AgentType::default_order);
        if order.is_empty() {
            return Err(ConfigurationError::new("stage order is empty").with_error_info(
                ErrorInfo::new(codes::EMPTY, "No stages configured")
                    .with_fix_hint("Configure at least one stage."),
            ));
        }

        let mut seen = HashSet::new();
        let duplicates: Vec<String> = order
            .iter()
            .filter(|stage| !seen.insert(**stage))
            .map(ToString::to_string)
            .collect();
        if !duplicates.is_empty() {
            return Err(ConfigurationError::new(format!(
                "stage order repeats: {}",
                duplicates.join(", ")
            ))
            .with_stages(duplicates.clone())
            .with_error_info(
                ErrorInfo::new(codes::DUPLICATE_STAGE, "A stage occupies more than one position")
                    .with_context_entry("stages", duplicates.join(",")),
            ));
        }

        let missing: Vec<String> = order
            .iter()
            .filter(|stage| !self.agents.contains_key(*stage))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigurationError::new(format!(
                "no agent registered for: {}",
                missing.join(", ")
            ))
            .with_stages(missing.clone())
            .with_error_info(
                ErrorInfo::new(codes::MISSING_AGENT, "Stage has no registered agent")
                    .with_context_entry("stages", missing.join(","))
                    .with_fix_hint("Register an agent for every stage in the order."),
            ));
        }

        let mut agents = self.agents;
        agents.retain(|stage, _| {
            let used = order.contains(stage);
            if !used {
                warn!(stage = %stage, "agent registered for a stage outside the order; ignoring");
            }
            used
        });

        Ok(StageRegistry { order, agents })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedAgent;
    use pretty_assertions::assert_eq;

    fn agent(stage: AgentType) -> Arc<dyn StageAgent> {
        Arc::new(ScriptedAgent::always_succeeds(stage))
    }

    #[test]
    fn test_build_with_custom_order() {
        let registry = StageRegistry::builder()
            .order(vec![AgentType::Backend, AgentType::Frontend])
            .agent(agent(AgentType::Frontend))
            .agent(agent(AgentType::Backend))
            .agent(agent(AgentType::Testing))
            .build()
            .unwrap();

        assert_eq!(registry.order(), &[AgentType::Backend, AgentType::Frontend]);
        assert!(registry.agent(AgentType::Testing).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_default_order_requires_every_agent() {
        let err = StageRegistry::builder()
            .agent(agent(AgentType::Backend))
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some(codes::MISSING_AGENT));
        assert_eq!(err.stages.len(), 6);
        assert!(!err.stages.contains(&"backend".to_string()));
    }

    #[test]
    fn test_empty_order_rejected() {
        let err = StageRegistry::builder().order(Vec::new()).build().unwrap_err();
        assert_eq!(err.code(), Some(codes::EMPTY));
    }

    #[test]
    fn test_duplicate_position_rejected() {
        let err = StageRegistry::builder()
            .order(vec![AgentType::Backend, AgentType::Backend])
            .agent(agent(AgentType::Backend))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::DUPLICATE_STAGE));
        assert_eq!(err.stages, vec!["backend".to_string()]);
    }

    #[test]
    fn test_compatibility_check() {
        let picky = crate::agents::FnAgent::new(AgentType::Frontend, |_, _| {
            Ok(crate::core::StageResult::completed(AgentType::Frontend, serde_json::json!({})))
        })
        .with_compatibility(|bp| bp.tech("frontend").is_some());

        let registry = StageRegistry::builder()
            .order(vec![AgentType::Backend, AgentType::Frontend])
            .agent(agent(AgentType::Backend))
            .agent(Arc::new(picky))
            .build()
            .unwrap();

        let blueprint = Blueprint::parse(serde_json::json!({"tech_stack": {"backend": "axum"}})).unwrap();
        let err = registry.check_compatibility(&blueprint).unwrap_err();
        assert_eq!(err.code(), Some(blueprint_codes::INCOMPATIBLE));

        let blueprint = Blueprint::parse(serde_json::json!({
            "tech_stack": {"backend": "axum", "frontend": "leptos"}
        }))
        .unwrap();
        assert!(registry.check_compatibility(&blueprint).is_ok());
    }
}
