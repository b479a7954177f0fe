//! Closure-backed agents.

use super::{default_quality_report, AccumulatedInput, StageAgent, StageReporter};
use crate::blueprint::Blueprint;
use crate::core::{AgentType, QualityReport, StageResult};
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::future::Future;
use std::marker::PhantomData;

type QualityFn = Box<dyn Fn(&StageResult) -> QualityReport + Send + Sync>;
type CompatibilityFn = Box<dyn Fn(&Blueprint) -> bool + Send + Sync>;

#[derive(Default)]
struct Hooks {
    quality: Option<QualityFn>,
    compatibility: Option<CompatibilityFn>,
}

impl Hooks {
    fn quality(&self, result: &StageResult) -> QualityReport {
        match &self.quality {
            Some(f) => f(result),
            None => default_quality_report(result),
        }
    }

    fn compatible(&self, blueprint: &Blueprint) -> bool {
        self.compatibility.as_ref().map_or(true, |f| f(blueprint))
    }
}

/// An agent backed by a synchronous function.
pub struct FnAgent<F>
where
    F: Fn(&AccumulatedInput, &StageReporter) -> anyhow::Result<StageResult> + Send + Sync,
{
    agent_type: AgentType,
    func: F,
    hooks: Hooks,
}

impl<F> FnAgent<F>
where
    F: Fn(&AccumulatedInput, &StageReporter) -> anyhow::Result<StageResult> + Send + Sync,
{
    /// Creates a new function-based agent.
    pub fn new(agent_type: AgentType, func: F) -> Self {
        Self {
            agent_type,
            func,
            hooks: Hooks::default(),
        }
    }

    /// Replaces the default quality check.
    #[must_use]
    pub fn with_quality_check(
        mut self,
        check: impl Fn(&StageResult) -> QualityReport + Send + Sync + 'static,
    ) -> Self {
        self.hooks.quality = Some(Box::new(check));
        self
    }

    /// Sets a blueprint compatibility predicate.
    #[must_use]
    pub fn with_compatibility(mut self, check: impl Fn(&Blueprint) -> bool + Send + Sync + 'static) -> Self {
        self.hooks.compatibility = Some(Box::new(check));
        self
    }
}

impl<F> Debug for FnAgent<F>
where
    F: Fn(&AccumulatedInput, &StageReporter) -> anyhow::Result<StageResult> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAgent")
            .field("agent_type", &self.agent_type)
            .finish()
    }
}

#[async_trait]
impl<F> StageAgent for FnAgent<F>
where
    F: Fn(&AccumulatedInput, &StageReporter) -> anyhow::Result<StageResult> + Send + Sync,
{
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    async fn execute(
        &self,
        _project_id: &str,
        input: &AccumulatedInput,
        reporter: &StageReporter,
    ) -> anyhow::Result<StageResult> {
        (self.func)(input, reporter)
    }

    fn quality_check(&self, result: &StageResult) -> QualityReport {
        self.hooks.quality(result)
    }

    fn is_compatible(&self, blueprint: &Blueprint) -> bool {
        self.hooks.compatible(blueprint)
    }
}

/// An agent backed by an async function. The function receives owned
/// copies of the input and reporter so its future can be `'static`.
pub struct AsyncFnAgent<F, Fut>
where
    F: Fn(AccumulatedInput, StageReporter) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StageResult>> + Send,
{
    agent_type: AgentType,
    func: F,
    hooks: Hooks,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnAgent<F, Fut>
where
    F: Fn(AccumulatedInput, StageReporter) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StageResult>> + Send,
{
    /// Creates a new async function-based agent.
    pub fn new(agent_type: AgentType, func: F) -> Self {
        Self {
            agent_type,
            func,
            hooks: Hooks::default(),
            _phantom: PhantomData,
        }
    }

    /// Replaces the default quality check.
    #[must_use]
    pub fn with_quality_check(
        mut self,
        check: impl Fn(&StageResult) -> QualityReport + Send + Sync + 'static,
    ) -> Self {
        self.hooks.quality = Some(Box::new(check));
        self
    }

    /// Sets a blueprint compatibility predicate.
    #[must_use]
    pub fn with_compatibility(mut self, check: impl Fn(&Blueprint) -> bool + Send + Sync + 'static) -> Self {
        self.hooks.compatibility = Some(Box::new(check));
        self
    }
}

impl<F, Fut> Debug for AsyncFnAgent<F, Fut>
where
    F: Fn(AccumulatedInput, StageReporter) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StageResult>> + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFnAgent")
            .field("agent_type", &self.agent_type)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> StageAgent for AsyncFnAgent<F, Fut>
where
    F: Fn(AccumulatedInput, StageReporter) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StageResult>> + Send,
{
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    async fn execute(
        &self,
        _project_id: &str,
        input: &AccumulatedInput,
        reporter: &StageReporter,
    ) -> anyhow::Result<StageResult> {
        (self.func)(input.clone(), reporter.clone()).await
    }

    fn quality_check(&self, result: &StageResult) -> QualityReport {
        self.hooks.quality(result)
    }

    fn is_compatible(&self, blueprint: &Blueprint) -> bool {
        self.hooks.compatible(blueprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn input() -> AccumulatedInput {
        let blueprint = Blueprint::parse(json!({"tech_stack": {"backend": "axum"}})).unwrap();
        AccumulatedInput::new("shop", Arc::new(blueprint))
    }

    #[tokio::test]
    async fn test_fn_agent() {
        let agent = FnAgent::new(AgentType::Backend, |input, reporter| {
            reporter.report_progress(50.0);
            Ok(StageResult::completed(
                AgentType::Backend,
                json!({ "framework": input.blueprint().tech("backend") }),
            ))
        });
        let reporter = StageReporter::detached(AgentType::Backend, "shop");

        let result = agent.execute("shop", &input(), &reporter).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.output["framework"], "axum");
        assert_eq!(reporter.stage_progress(), 50.0);
        assert_eq!(agent.agent_type(), AgentType::Backend);
    }

    #[tokio::test]
    async fn test_async_fn_agent() {
        let agent = AsyncFnAgent::new(AgentType::Frontend, |input: AccumulatedInput, _reporter| async move {
            Ok::<_, anyhow::Error>(StageResult::completed(
                AgentType::Frontend,
                json!({ "project": input.project_id() }),
            ))
        });
        let reporter = StageReporter::detached(AgentType::Frontend, "shop");

        let result = agent.execute("shop", &input(), &reporter).await.unwrap();
        assert_eq!(result.output["project"], "shop");
    }

    #[test]
    fn test_hooks_override_defaults() {
        let agent = FnAgent::new(AgentType::Testing, |_, _| {
            Ok(StageResult::completed(AgentType::Testing, json!({})))
        })
        .with_quality_check(|_| QualityReport::new(0.1, Vec::new()))
        .with_compatibility(|bp| bp.tech("testing").is_some());

        let result = StageResult::completed(AgentType::Testing, json!({}));
        assert_eq!(agent.quality_check(&result).overall_score, 0.1);
        assert!(!agent.is_compatible(input().blueprint()));
    }
}
