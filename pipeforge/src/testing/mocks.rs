//! Mock agents and backends for testing.

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::agents::{default_quality_report, AccumulatedInput, StageAgent, StageReporter};
use crate::core::{AgentType, FileArtifact, QualityCheck, QualityReport, StageResult};
use crate::errors::StorageError;
use crate::logs::{InMemoryLogBackend, LogBackend, LogEntry, LogPage, LogQuery, LogSummary, SummaryScope};

/// What a [`ScriptedAgent`] does on one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Return a completed, high-confidence result with one artifact.
    Succeed,
    /// Return a completed result that the default quality check rejects.
    LowQuality,
    /// Return a failed result carrying a partial artifact.
    Fail(String),
    /// Return an error from `execute`.
    Raise(String),
    /// Panic inside `execute`.
    Panic(String),
}

/// Shared count of calls, readable after the agent has been moved into an
/// orchestrator.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    /// Number of calls so far.
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// An agent that plays back a script of attempt outcomes.
///
/// Once the script is exhausted every further attempt repeats the
/// `then` step, which defaults to [`ScriptStep::Succeed`].
#[derive(Debug)]
pub struct ScriptedAgent {
    agent_type: AgentType,
    steps: Mutex<VecDeque<ScriptStep>>,
    then: ScriptStep,
    calls: CallCounter,
    inputs: Arc<Mutex<Vec<AccumulatedInput>>>,
    delay: Option<Duration>,
    progress: Vec<f64>,
    fixed_score: Option<f64>,
    panicking_quality_check: bool,
}

impl ScriptedAgent {
    /// Creates an agent playing back `steps`.
    #[must_use]
    pub fn new(agent_type: AgentType, steps: Vec<ScriptStep>) -> Self {
        Self {
            agent_type,
            steps: Mutex::new(steps.into()),
            then: ScriptStep::Succeed,
            calls: CallCounter::default(),
            inputs: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            progress: Vec::new(),
            fixed_score: None,
            panicking_quality_check: false,
        }
    }

    /// An agent whose every attempt succeeds.
    #[must_use]
    pub fn always_succeeds(agent_type: AgentType) -> Self {
        Self::new(agent_type, Vec::new())
    }

    /// An agent whose every attempt returns a failed result.
    #[must_use]
    pub fn always_fails(agent_type: AgentType, error: impl Into<String>) -> Self {
        Self::new(agent_type, Vec::new()).then(ScriptStep::Fail(error.into()))
    }

    /// An agent that fails `failures` times and then succeeds.
    #[must_use]
    pub fn failing_then_succeeding(agent_type: AgentType, failures: usize) -> Self {
        let steps = (1..=failures)
            .map(|i| ScriptStep::Fail(format!("scripted failure {i}")))
            .collect();
        Self::new(agent_type, steps)
    }

    /// An agent that panics on every attempt.
    #[must_use]
    pub fn panicking(agent_type: AgentType) -> Self {
        Self::new(agent_type, Vec::new()).then(ScriptStep::Panic(format!("{agent_type} agent panicked")))
    }

    /// Sets the step repeated after the script runs out.
    #[must_use]
    pub fn then(mut self, step: ScriptStep) -> Self {
        self.then = step;
        self
    }

    /// Sleeps for `delay` inside every attempt.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reports these progress values, in order, on every attempt.
    #[must_use]
    pub fn with_progress(mut self, steps: Vec<f64>) -> Self {
        self.progress = steps;
        self
    }

    /// Makes the quality check return `score` for every completed result.
    #[must_use]
    pub fn with_fixed_score(mut self, score: f64) -> Self {
        self.fixed_score = Some(score);
        self
    }

    /// Makes the quality check panic.
    #[must_use]
    pub fn with_panicking_quality_check(mut self) -> Self {
        self.panicking_quality_check = true;
        self
    }

    /// Number of attempts so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.get()
    }

    /// A handle on the attempt count that outlives moving the agent.
    #[must_use]
    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }

    /// A handle on the inputs of every attempt.
    #[must_use]
    pub fn recorded_inputs(&self) -> Arc<Mutex<Vec<AccumulatedInput>>> {
        Arc::clone(&self.inputs)
    }

    fn artifact(&self, name: &str, attempt: usize) -> FileArtifact {
        FileArtifact::with_content(
            format!("{}/{name}", self.agent_type),
            format!("{} attempt {attempt}", self.agent_type),
        )
        .language("text")
    }
}

#[async_trait]
impl StageAgent for ScriptedAgent {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    async fn execute(
        &self,
        project_id: &str,
        input: &AccumulatedInput,
        reporter: &StageReporter,
    ) -> anyhow::Result<StageResult> {
        let attempt = self.calls.increment();
        self.inputs.lock().push(input.clone());
        reporter
            .info(format!("{} attempt {attempt} started", self.agent_type))
            .await;
        if input.is_semantically_empty() {
            return Ok(StageResult::failed(self.agent_type, "nothing to generate from"));
        }
        for pct in &self.progress {
            reporter.report_progress(*pct);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = self.steps.lock().pop_front();
        let step = step.unwrap_or_else(|| self.then.clone());
        let output = serde_json::json!({
            "stage": self.agent_type,
            "attempt": attempt,
            "project_id": project_id,
        });
        match step {
            ScriptStep::Succeed => Ok(StageResult::completed(self.agent_type, output)
                .with_artifacts(vec![self.artifact("output.txt", attempt)])
                .with_confidence(0.95)),
            ScriptStep::LowQuality => {
                Ok(StageResult::completed(self.agent_type, output).with_confidence(0.1))
            }
            ScriptStep::Fail(error) => Ok(StageResult::failed(self.agent_type, error)
                .with_artifacts(vec![self.artifact(&format!("partial-{attempt}.txt"), attempt)])),
            ScriptStep::Raise(error) => Err(anyhow::anyhow!(error)),
            ScriptStep::Panic(message) => panic!("{message}"),
        }
    }

    fn quality_check(&self, result: &StageResult) -> QualityReport {
        assert!(!self.panicking_quality_check, "quality check exploded");
        match self.fixed_score {
            Some(_) if result.is_failure() => QualityReport::for_failed_result(result),
            Some(score) => QualityReport::new(score, vec![QualityCheck::scored("fixed", score, 0.0)]),
            None => default_quality_report(result),
        }
    }
}

/// A log backend that can be switched off to simulate an outage, or told
/// to refuse the rows of an execution it has no parent row for.
#[derive(Debug)]
pub struct FlakyLogBackend {
    inner: InMemoryLogBackend,
    available: AtomicBool,
    rejected: AtomicUsize,
    refused: DashSet<Uuid>,
}

impl Default for FlakyLogBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FlakyLogBackend {
    /// Creates an available backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: InMemoryLogBackend::new(100_000),
            available: AtomicBool::new(true),
            rejected: AtomicUsize::new(0),
            refused: DashSet::new(),
        }
    }

    /// Refuses every future row of `execution_id`.
    pub fn refuse_execution(&self, execution_id: Uuid) {
        self.refused.insert(execution_id);
    }

    /// Switches the backend on or off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Entries actually stored for an execution.
    #[must_use]
    pub fn stored(&self, execution_id: Uuid) -> usize {
        self.inner.len(execution_id)
    }

    /// Calls refused while switched off.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Unavailable("flaky backend is offline".to_string()))
        }
    }
}

#[async_trait]
impl LogBackend for FlakyLogBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn append(&self, entry: &LogEntry) -> Result<(), StorageError> {
        self.check()?;
        if self.refused.contains(&entry.execution_id) {
            return Err(StorageError::Refused(format!(
                "no execution row for {}",
                entry.execution_id
            )));
        }
        self.inner.push(entry.clone());
        Ok(())
    }

    async fn query(&self, query: &LogQuery, limit: usize) -> Result<LogPage, StorageError> {
        self.check()?;
        Ok(self.inner.query_now(query, limit))
    }

    async fn summary(&self, scope: &SummaryScope) -> Result<LogSummary, StorageError> {
        self.check()?;
        Ok(self.inner.summary_now(scope))
    }

    async fn last_sequence(&self, execution_id: Uuid) -> Result<Option<u64>, StorageError> {
        self.check()?;
        Ok(self.inner.last_sequence_now(execution_id))
    }

    async fn delete_execution(&self, execution_id: Uuid) -> Result<u64, StorageError> {
        self.check()?;
        Ok(self.inner.remove(execution_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::Blueprint;
    use crate::logs::LogLevel;

    fn input() -> AccumulatedInput {
        let blueprint = Blueprint::parse(serde_json::json!({"tech_stack": {"backend": "axum"}})).unwrap();
        AccumulatedInput::new("shop", Arc::new(blueprint))
    }

    #[tokio::test]
    async fn test_script_plays_back_then_repeats() {
        let agent = ScriptedAgent::failing_then_succeeding(AgentType::Backend, 1);
        let reporter = StageReporter::detached(AgentType::Backend, "shop");

        let first = agent.execute("shop", &input(), &reporter).await.unwrap();
        let second = agent.execute("shop", &input(), &reporter).await.unwrap();
        let third = agent.execute("shop", &input(), &reporter).await.unwrap();

        assert!(first.is_failure());
        assert!(second.is_success());
        assert!(third.is_success());
        assert_eq!(agent.call_count(), 3);
        assert_eq!(agent.recorded_inputs().lock().len(), 3);
    }

    #[tokio::test]
    async fn test_low_quality_step_fails_default_gate() {
        let agent = ScriptedAgent::new(AgentType::Backend, vec![ScriptStep::LowQuality]);
        let reporter = StageReporter::detached(AgentType::Backend, "shop");
        let result = agent.execute("shop", &input(), &reporter).await.unwrap();
        assert!(agent.quality_check(&result).overall_score < 0.7);
    }

    #[tokio::test]
    async fn test_flaky_backend_toggles() {
        let backend = FlakyLogBackend::new();
        let id = Uuid::now_v7();
        let mut entry = LogEntry::new(id, "acme", "shop", LogLevel::Info, "hello");
        entry.id = 1;

        assert!(backend.append(&entry).await.is_ok());
        backend.set_available(false);
        assert!(backend.append(&entry).await.is_err());
        assert_eq!(backend.rejected(), 1);
        assert_eq!(backend.stored(id), 1);
    }

    #[tokio::test]
    async fn test_flaky_backend_refuses_execution() {
        let backend = FlakyLogBackend::new();
        let id = Uuid::now_v7();
        backend.refuse_execution(id);
        let entry = LogEntry::new(id, "acme", "shop", LogLevel::Info, "hello");

        let err = backend.append(&entry).await.unwrap_err();
        assert!(err.is_refusal());
        assert_eq!(backend.append_batch(&[entry]).await.unwrap(), 1);
        assert_eq!(backend.stored(id), 0);
    }
}
