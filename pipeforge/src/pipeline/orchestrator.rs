//! The pipeline orchestrator.
//!
//! A run walks the registry's fixed stage order strictly sequentially. Each
//! stage attempt runs its agent in its own task, grades the result, and
//! either folds it into the run or retries the stage up to the configured
//! bound. Exhausting the bound fails the whole run; nothing after the failed
//! stage runs and nothing before it is rolled back.
//!
//! Only blueprint validation and configuration problems are returned to the
//! caller. Everything that happens once a run has started is recorded on the
//! [`ExecutionRecord`], in the execution's log stream and as
//! [`PipelineEvent`]s.

use super::gate::{GateDecision, QualityGate};
use super::registry::{codes, StageRegistry};
use crate::agents::{AccumulatedInput, StageAgent, StageReporter};
use crate::blueprint::{codes as blueprint_codes, Blueprint};
use crate::config::{OrchestratorConfig, PipeforgeConfig, CONFIG_INVALID};
use crate::context::TenantContext;
use crate::core::{AgentType, FileArtifact, GenerationProgress, QualityCheck, QualityReport, StageResult};
use crate::degradation::{DegradationManager, ServiceSummary};
use crate::errors::{ConfigurationError, ErrorInfo, PipeforgeError, ValidationError};
use crate::events::{EventKind, EventSink, NoOpEventSink, PipelineEvent};
use crate::logs::{
    ExecutionLogStore, LogBackend, LogEntry, LogLevel, LogPage, LogQuery, LogSummary, SummaryScope,
    TailMode, TailSession, TerminalProbe,
};
use crate::observability::{RunSpanAttributes, SpanTimer, StageSpanAttributes};
use crate::records::{ExecutionRecord, ExecutionRecordStore, InMemoryRecordStore};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Service name under which execution record writes are guarded.
pub const RECORD_STORE_SERVICE: &str = "execution_store";

/// A run's record, shared between the orchestrator and the stage reporters.
pub type SharedRecord = Arc<RwLock<ExecutionRecord>>;

/// Service name under which calls to a stage's agent are guarded.
#[must_use]
pub fn agent_service(stage: AgentType) -> String {
    format!("agent.{stage}")
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The terminal record.
    pub record: ExecutionRecord,
    /// Accepted results in stage order, followed by the last rejected
    /// attempt when the run failed.
    pub stage_results: Vec<StageResult>,
    /// Artifacts of the accepted stages, in stage order.
    pub artifacts: Vec<FileArtifact>,
    /// The input the next stage would have received.
    pub accumulated_input: AccumulatedInput,
}

impl RunOutcome {
    /// The execution id.
    #[must_use]
    pub fn execution_id(&self) -> Uuid {
        self.record.id
    }

    /// Returns true if every stage was accepted.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.record.status == crate::core::ExecutionStatus::Completed
    }
}

/// A run started in the background by [`PipelineOrchestrator::start_run`].
pub struct RunHandle {
    record: ExecutionRecord,
    task: JoinHandle<RunOutcome>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("execution_id", &self.record.id)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl RunHandle {
    /// The execution id.
    #[must_use]
    pub fn execution_id(&self) -> Uuid {
        self.record.id
    }

    /// The record as it was when the run was started.
    #[must_use]
    pub fn record(&self) -> &ExecutionRecord {
        &self.record
    }

    /// Returns true once the run task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the run to end.
    ///
    /// # Errors
    ///
    /// Returns [`PipeforgeError::Internal`] if the run task itself was lost.
    pub async fn wait(self) -> Result<RunOutcome, PipeforgeError> {
        self.task
            .await
            .map_err(|e| PipeforgeError::Internal(format!("run task ended abnormally: {e}")))
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("agent raised: {0:#}")]
    Raised(anyhow::Error),
    #[error("agent panicked: {0}")]
    Panicked(String),
    #[error("agent timed out after {0:?}")]
    TimedOut(Duration),
    #[error("agent task cancelled: {0}")]
    Cancelled(String),
}

enum StageOutcome {
    Accepted(StageResult),
    Exhausted { result: StageResult, reason: String },
}

/// Drives runs of a fixed stage pipeline.
///
/// Cloning is cheap and every clone drives the same runs. Distinct runs
/// execute concurrently; they share the log store, the record store and the
/// breakers.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    registry: Arc<StageRegistry>,
    config: Arc<OrchestratorConfig>,
    gate: QualityGate,
    records: Arc<dyn ExecutionRecordStore>,
    logs: Arc<ExecutionLogStore>,
    breaker: Arc<DegradationManager>,
    events: Arc<dyn EventSink>,
    live: Arc<DashMap<Uuid, SharedRecord>>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("stages", &self.registry.order())
            .field("quality_threshold", &self.gate.threshold())
            .field("max_retries", &self.config.max_retries)
            .field("record_store", &self.records.name())
            .field("live_runs", &self.live.len())
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Starts building an orchestrator.
    #[must_use]
    pub fn builder() -> PipelineOrchestratorBuilder {
        PipelineOrchestratorBuilder::default()
    }

    /// The stage registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// The orchestrator configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The execution log store.
    #[must_use]
    pub fn log_store(&self) -> &Arc<ExecutionLogStore> {
        &self.logs
    }

    /// The breakers shared by agent calls and storage writes.
    #[must_use]
    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.breaker
    }

    /// Runs still tracked in memory.
    #[must_use]
    pub fn live_runs(&self) -> usize {
        self.live.len()
    }

    /// Validates the blueprint, creates the run's record and drives the run
    /// in a background task.
    ///
    /// # Errors
    ///
    /// Returns [`PipeforgeError::Validation`] for a malformed blueprint, a
    /// blank project id, or a blueprint a registered agent declines. Nothing
    /// is written in that case.
    pub async fn start_run(
        &self,
        ctx: &TenantContext,
        project_id: &str,
        blueprint: serde_json::Value,
    ) -> Result<RunHandle, PipeforgeError> {
        let (shared, blueprint) = self.prepare_run(ctx, project_id, blueprint).await?;
        let record = shared.read().clone();
        let span = info_span!("pipeline_run", execution_id = %record.id, project_id = %record.project_id);
        let task = tokio::spawn(self.clone().drive(shared, blueprint).instrument(span));
        Ok(RunHandle { record, task })
    }

    /// Like [`Self::start_run`] but drives the run on the calling task and
    /// returns once it has ended.
    ///
    /// # Errors
    ///
    /// Same as [`Self::start_run`].
    pub async fn execute_run(
        &self,
        ctx: &TenantContext,
        project_id: &str,
        blueprint: serde_json::Value,
    ) -> Result<RunOutcome, PipeforgeError> {
        let (shared, blueprint) = self.prepare_run(ctx, project_id, blueprint).await?;
        let execution_id = shared.read().id;
        let span = info_span!("pipeline_run", execution_id = %execution_id, project_id = %project_id);
        Ok(self.clone().drive(shared, blueprint).instrument(span).await)
    }

    /// Runs a single attempt of `stage` against a run's record.
    ///
    /// Never fails: an error returned by the agent, a panic, a timeout or a
    /// call skipped by an open breaker all come back as a failed
    /// [`StageResult`]. The result is normalized before it is returned.
    pub async fn run_stage(
        &self,
        record: &SharedRecord,
        stage: AgentType,
        input: &AccumulatedInput,
    ) -> StageResult {
        let Some(agent) = self.registry.agent(stage).cloned() else {
            return StageResult::failed(stage, format!("no agent registered for stage {stage}"));
        };
        let reporter = StageReporter::new(
            stage,
            Arc::clone(record),
            Arc::clone(&self.logs),
            Arc::clone(&self.events),
        );
        let timer = SpanTimer::start(stage.as_str());
        let attempt = invoke(agent, input.clone(), reporter, self.config.stage_timeout());

        let result = if self.config.guard_agents {
            let service = agent_service(stage);
            self.breaker
                .call_with_fallback(&service, || attempt, |err| {
                    StageResult::failed(stage, err.to_string())
                })
                .await
                .into_inner()
        } else {
            attempt
                .await
                .unwrap_or_else(|err| StageResult::failed(stage, err.to_string()))
        };

        let elapsed = timer.elapsed_secs();
        let mut result = result.normalized(stage);
        if result.execution_time <= 0.0 {
            result.execution_time = elapsed;
        }
        if let Some(err) = result.error_message.clone() {
            warn!(stage = %stage, error = %err, "stage attempt failed");
            self.log(record, LogLevel::Error, Some(stage), format!("{stage} attempt failed: {err}"), None)
                .await;
        }
        result
    }

    /// Loads a record visible to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`PipeforgeError::NotFound`] when the execution does not exist
    /// for the caller's tenant, and [`PipeforgeError::Storage`] when the
    /// record store cannot be read.
    pub async fn get_execution(
        &self,
        ctx: &TenantContext,
        execution_id: Uuid,
    ) -> Result<ExecutionRecord, PipeforgeError> {
        if let Some(record) = self.live_record(ctx, execution_id) {
            return Ok(record);
        }
        self.records
            .get(&ctx.tenant_id, execution_id)
            .await?
            .ok_or(PipeforgeError::NotFound { execution_id })
    }

    /// Progress snapshot of a run.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get_execution`].
    pub async fn get_progress(
        &self,
        ctx: &TenantContext,
        execution_id: Uuid,
    ) -> Result<GenerationProgress, PipeforgeError> {
        Ok(self.get_execution(ctx, execution_id).await?.progress())
    }

    /// A project's runs, newest first. Runs still in memory are reported
    /// with their live state.
    ///
    /// # Errors
    ///
    /// Returns [`PipeforgeError::Storage`] when the record store cannot be read.
    pub async fn list_executions(
        &self,
        ctx: &TenantContext,
        project_id: &str,
    ) -> Result<Vec<ExecutionRecord>, PipeforgeError> {
        let mut records = self.records.list_for_project(&ctx.tenant_id, project_id).await?;
        for record in &mut records {
            if let Some(live) = self.live_record(ctx, record.id) {
                *record = live;
            }
        }
        Ok(records)
    }

    /// Reads a page of an execution's log.
    ///
    /// # Errors
    ///
    /// Returns [`PipeforgeError::NotFound`] when the execution is not
    /// visible to the caller.
    pub async fn get_logs(
        &self,
        ctx: &TenantContext,
        mut query: LogQuery,
    ) -> Result<LogPage, PipeforgeError> {
        self.get_execution(ctx, query.execution_id).await?;
        query.tenant_id = Some(ctx.tenant_id.clone());
        Ok(self.logs.query(&query).await)
    }

    /// Aggregates an execution's log.
    ///
    /// # Errors
    ///
    /// Returns [`PipeforgeError::NotFound`] when the execution is not
    /// visible to the caller.
    pub async fn get_logs_summary(
        &self,
        ctx: &TenantContext,
        mut scope: SummaryScope,
    ) -> Result<LogSummary, PipeforgeError> {
        self.get_execution(ctx, scope.execution_id).await?;
        scope.tenant_id = Some(ctx.tenant_id.clone());
        Ok(self.logs.summary(&scope).await)
    }

    /// Tails an execution's log. A streaming tail ends when the session is
    /// dropped or the run reaches a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`PipeforgeError::NotFound`] when the execution is not
    /// visible to the caller.
    pub async fn tail_logs(
        &self,
        ctx: &TenantContext,
        mut query: LogQuery,
        mode: TailMode,
    ) -> Result<TailSession, PipeforgeError> {
        self.get_execution(ctx, query.execution_id).await?;
        query.tenant_id = Some(ctx.tenant_id.clone());
        let probe = Arc::new(RunTerminalProbe {
            live: Arc::clone(&self.live),
            records: Arc::clone(&self.records),
            tenant_id: ctx.tenant_id.clone(),
        });
        Ok(self.logs.tail(query, mode, probe))
    }

    /// Breaker statistics for one service, or for all of them.
    #[must_use]
    pub fn get_circuit_summary(&self, service: Option<&str>) -> Vec<ServiceSummary> {
        self.breaker.get_summary(service)
    }

    /// Deletes a finished execution with its whole log. Returns the number
    /// of log entries removed.
    ///
    /// # Errors
    ///
    /// Returns [`PipeforgeError::NotFound`] when the execution is not
    /// visible to the caller, [`PipeforgeError::Validation`] while it is
    /// still running, and [`PipeforgeError::Storage`] when a store refuses.
    pub async fn delete_execution(
        &self,
        ctx: &TenantContext,
        execution_id: Uuid,
    ) -> Result<u64, PipeforgeError> {
        let record = self.get_execution(ctx, execution_id).await?;
        if !record.is_terminal() {
            return Err(ValidationError::field(
                "execution_id",
                codes::RUN_IN_PROGRESS,
                format!("execution {execution_id} is still {}", record.status),
            )
            .into());
        }
        let removed = self.logs.delete_execution(execution_id).await?;
        self.records.delete(&ctx.tenant_id, execution_id).await?;
        self.live.remove(&execution_id);
        info!(execution_id = %execution_id, log_entries = removed, "execution deleted");
        Ok(removed)
    }

    async fn prepare_run(
        &self,
        ctx: &TenantContext,
        project_id: &str,
        raw: serde_json::Value,
    ) -> Result<(SharedRecord, Arc<Blueprint>), PipeforgeError> {
        if project_id.trim().is_empty() {
            return Err(ValidationError::field(
                "project_id",
                blueprint_codes::BAD_FIELD,
                "project_id must not be blank",
            )
            .into());
        }
        let blueprint = Blueprint::parse(raw)?;
        self.registry.check_compatibility(&blueprint)?;

        let fingerprint = blueprint.fingerprint();
        let total = self.registry.len();
        let mut record = ExecutionRecord::new(project_id, ctx.tenant_id.clone(), self.registry.order().to_vec())
            .with_fingerprint(fingerprint.clone());
        let execution_id = record.id;
        // The initializing row goes first so durable log rows have a parent.
        self.save(&record).await;
        record.mark_running();

        let shared = Arc::new(RwLock::new(record));
        self.live.insert(execution_id, Arc::clone(&shared));
        self.persist(&shared).await;

        let attrs = RunSpanAttributes::new(execution_id.to_string())
            .with_project(project_id)
            .with_tenant(ctx.tenant_id.clone())
            .with_fingerprint(fingerprint)
            .with_total_stages(total)
            .with_status("running");
        info!(
            execution_id = %execution_id,
            project_id,
            tenant_id = %ctx.tenant_id,
            stages = total,
            "run started"
        );
        self.events
            .emit(PipelineEvent::for_execution(
                EventKind::RunStarted,
                execution_id,
                json!(attrs.to_otel_attributes()),
            ))
            .await;
        self.log(
            &shared,
            LogLevel::Info,
            None,
            format!("run started with {total} stages"),
            Some(json!({ "request_id": ctx.request_id, "user_id": ctx.user_id })),
        )
        .await;

        Ok((shared, Arc::new(blueprint)))
    }

    async fn drive(self, shared: SharedRecord, blueprint: Arc<Blueprint>) -> RunOutcome {
        let (execution_id, project_id) = {
            let record = shared.read();
            (record.id, record.project_id.clone())
        };
        let run_timer = SpanTimer::start("pipeline_run");
        let mut input = AccumulatedInput::new(project_id, blueprint);
        let mut stage_results = Vec::new();
        let mut artifacts = Vec::new();
        let mut failure = None;

        for &stage in self.registry.order() {
            match self.drive_stage(&shared, stage, &input).await {
                StageOutcome::Accepted(result) => {
                    input.merge_output(stage, result.output.clone());
                    artifacts.extend(result.artifacts.iter().cloned());
                    stage_results.push(result);
                }
                StageOutcome::Exhausted { result, reason } => {
                    stage_results.push(result);
                    failure = Some((stage, reason));
                    break;
                }
            }
        }

        let elapsed = run_timer.elapsed_secs();
        match failure {
            None => self.finish_completed(&shared, elapsed).await,
            Some((stage, reason)) => self.finish_failed(&shared, stage, reason, elapsed).await,
        }

        let persisted = self.persist(&shared).await;
        self.logs.mark_terminal(execution_id).await;
        if persisted {
            self.live.remove(&execution_id);
        }

        let record = shared.read().clone();
        RunOutcome {
            record,
            stage_results,
            artifacts,
            accumulated_input: input,
        }
    }

    async fn drive_stage(
        &self,
        shared: &SharedRecord,
        stage: AgentType,
        input: &AccumulatedInput,
    ) -> StageOutcome {
        let execution_id = shared.read().id;
        shared.write().begin_stage(stage);
        self.persist(shared).await;
        info!(execution_id = %execution_id, stage = %stage, "stage started");
        self.events
            .emit(PipelineEvent::for_execution(
                EventKind::StageStarted,
                execution_id,
                json!({ "stage": stage }),
            ))
            .await;
        self.log(shared, LogLevel::Info, Some(stage), format!("{stage} stage started"), None)
            .await;

        let timer = SpanTimer::start(stage.as_str());
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = self.run_stage(shared, stage, input).await;
            let report = self.grade(stage, &result);
            let decision = self.gate.evaluate(&result, &report);
            self.events
                .emit(PipelineEvent::for_execution(
                    EventKind::StageQualityChecked,
                    execution_id,
                    json!({
                        "stage": stage,
                        "attempt": attempt,
                        "score": decision.score(),
                        "accepted": decision.is_accepted(),
                        "failed_checks": report.failed_checks(),
                    }),
                ))
                .await;

            match decision {
                GateDecision::Accept { score } => {
                    let duration = timer.elapsed_secs();
                    let progress = {
                        let mut record = shared.write();
                        record.complete_stage(stage, duration);
                        record.progress()
                    };
                    self.persist(shared).await;

                    let attrs = StageSpanAttributes::new(stage.as_str())
                        .with_attempts(attempt)
                        .with_score(score)
                        .with_status("completed")
                        .with_duration_ms(duration * 1000.0)
                        .with_artifact_count(result.artifacts.len());
                    info!(
                        execution_id = %execution_id,
                        stage = %stage,
                        attempt,
                        score,
                        overall_progress = progress.overall_progress,
                        "stage accepted"
                    );
                    self.events
                        .emit(PipelineEvent::for_execution(
                            EventKind::StageCompleted,
                            execution_id,
                            attrs.to_json(),
                        ))
                        .await;
                    self.emit_progress(&progress).await;
                    self.log(
                        shared,
                        LogLevel::Info,
                        Some(stage),
                        format!("{stage} stage accepted with score {score:.2}"),
                        Some(json!({
                            "attempt": attempt,
                            "score": score,
                            "artifacts": result.artifacts.len(),
                            "duration_secs": duration,
                        })),
                    )
                    .await;
                    return StageOutcome::Accepted(result);
                }
                GateDecision::Reject { score, reason } => {
                    if !result.artifacts.is_empty() {
                        debug!(
                            stage = %stage,
                            attempt,
                            discarded = result.artifacts.len(),
                            "discarding artifacts of rejected attempt"
                        );
                    }
                    self.log(
                        shared,
                        LogLevel::Warning,
                        Some(stage),
                        format!("{stage} attempt {attempt} rejected: {reason}"),
                        Some(json!({ "attempt": attempt, "score": score, "checks": report.checks })),
                    )
                    .await;
                    if attempt >= max_attempts {
                        return StageOutcome::Exhausted { result, reason };
                    }

                    shared.write().record_retry();
                    self.persist(shared).await;
                    let delay = self.config.retry_backoff.delay_for(attempt - 1);
                    warn!(
                        execution_id = %execution_id,
                        stage = %stage,
                        attempt,
                        score,
                        reason = %reason,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "stage attempt rejected, retrying"
                    );
                    self.events
                        .emit(PipelineEvent::for_execution(
                            EventKind::StageRetry,
                            execution_id,
                            json!({
                                "stage": stage,
                                "attempt": attempt,
                                "score": score,
                                "reason": reason,
                                "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            }),
                        ))
                        .await;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn finish_completed(&self, shared: &SharedRecord, elapsed: f64) {
        let (completed, progress) = {
            let mut record = shared.write();
            let completed = record.mark_completed();
            if !completed {
                record.mark_failed("run ended before every stage was accepted");
            }
            (completed, record.progress())
        };
        let execution_id = progress.execution_id;
        if !completed {
            error!(execution_id = %execution_id, "run ended before every stage was accepted");
            return;
        }

        info!(execution_id = %execution_id, elapsed_secs = elapsed, "run completed");
        self.emit_progress(&progress).await;
        let attrs = self.run_attributes(shared).with_status("completed");
        let mut data = json!(attrs.to_otel_attributes());
        data["elapsed_secs"] = json!(elapsed);
        self.events
            .emit(PipelineEvent::for_execution(EventKind::RunCompleted, execution_id, data))
            .await;
        self.log(
            shared,
            LogLevel::Info,
            None,
            format!("run completed in {elapsed:.2}s"),
            Some(json!({ "stages": progress.stages_completed })),
        )
        .await;
    }

    async fn finish_failed(&self, shared: &SharedRecord, stage: AgentType, reason: String, elapsed: f64) {
        let (execution_id, retries) = {
            let mut record = shared.write();
            record.mark_failed(reason.clone());
            (record.id, record.retry_count)
        };
        error!(
            execution_id = %execution_id,
            stage = %stage,
            retry_count = retries,
            error = %reason,
            "run failed"
        );
        let attrs = self.run_attributes(shared).with_status("failed");
        let mut data = json!(attrs.to_otel_attributes());
        data["stage"] = json!(stage);
        data["error"] = json!(reason);
        data["elapsed_secs"] = json!(elapsed);
        self.events
            .emit(PipelineEvent::for_execution(EventKind::RunFailed, execution_id, data))
            .await;
        self.log(
            shared,
            LogLevel::Error,
            Some(stage),
            format!("run failed at {stage}: {reason}"),
            Some(json!({ "retry_count": retries })),
        )
        .await;
    }

    fn grade(&self, stage: AgentType, result: &StageResult) -> QualityReport {
        let Some(agent) = self.registry.agent(stage) else {
            return QualityReport::for_failed_result(result);
        };
        let report = match panic::catch_unwind(AssertUnwindSafe(|| agent.quality_check(result))) {
            Ok(report) => QualityReport::new(report.overall_score, report.checks),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(stage = %stage, panic = %message, "quality check panicked");
                QualityReport::new(
                    0.0,
                    vec![QualityCheck::binary("quality_check", false)
                        .with_message(format!("quality check panicked: {message}"))],
                )
            }
        };
        if result.is_failure() && report.overall_score > 0.0 {
            return QualityReport::for_failed_result(result);
        }
        report
    }

    fn run_attributes(&self, shared: &SharedRecord) -> RunSpanAttributes {
        let record = shared.read();
        let mut attrs = RunSpanAttributes::new(record.id.to_string())
            .with_project(record.project_id.clone())
            .with_tenant(record.tenant_id.clone())
            .with_total_stages(record.total_stages());
        if let Some(fp) = &record.blueprint_fingerprint {
            attrs = attrs.with_fingerprint(fp.clone());
        }
        attrs
    }

    async fn emit_progress(&self, progress: &GenerationProgress) {
        self.events
            .emit(PipelineEvent::for_execution(
                EventKind::ProgressUpdated,
                progress.execution_id,
                json!({
                    "stage": progress.current_stage,
                    "stage_progress": progress.stage_progress,
                    "overall_progress": progress.overall_progress,
                }),
            ))
            .await;
    }

    fn live_record(&self, ctx: &TenantContext, execution_id: Uuid) -> Option<ExecutionRecord> {
        self.live
            .get(&execution_id)
            .map(|entry| entry.value().read().clone())
            .filter(|record| ctx.owns(&record.tenant_id))
    }

    async fn save(&self, record: &ExecutionRecord) -> bool {
        match self
            .breaker
            .call(RECORD_STORE_SERVICE, || self.records.save(record))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(execution_id = %record.id, error = %e, "execution record write failed");
                false
            }
        }
    }

    async fn persist(&self, shared: &SharedRecord) -> bool {
        let snapshot = shared.read().clone();
        self.save(&snapshot).await
    }

    async fn log(
        &self,
        shared: &SharedRecord,
        level: LogLevel,
        stage: Option<AgentType>,
        message: String,
        metadata: Option<serde_json::Value>,
    ) {
        let mut entry = {
            let record = shared.read();
            LogEntry::new(
                record.id,
                record.tenant_id.clone(),
                record.project_id.clone(),
                level,
                message,
            )
        };
        entry.stage = stage;
        entry.metadata = metadata;
        self.logs.append(entry).await;
    }
}

async fn invoke(
    agent: Arc<dyn StageAgent>,
    input: AccumulatedInput,
    reporter: StageReporter,
    timeout: Option<Duration>,
) -> Result<StageResult, AttemptError> {
    let project_id = input.project_id().to_string();
    let mut task = tokio::spawn(async move { agent.execute(&project_id, &input, &reporter).await });
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(AttemptError::TimedOut(limit));
            }
        },
        None => task.await,
    };
    match joined {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(AttemptError::Raised(err)),
        Err(join) if join.is_panic() => Err(AttemptError::Panicked(panic_message(
            join.into_panic().as_ref(),
        ))),
        Err(join) => Err(AttemptError::Cancelled(join.to_string())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct RunTerminalProbe {
    live: Arc<DashMap<Uuid, SharedRecord>>,
    records: Arc<dyn ExecutionRecordStore>,
    tenant_id: String,
}

#[async_trait]
impl TerminalProbe for RunTerminalProbe {
    async fn is_terminal(&self, execution_id: Uuid) -> bool {
        let live = self.live.get(&execution_id).map(|e| Arc::clone(e.value()));
        if let Some(shared) = live {
            return shared.read().is_terminal();
        }
        match self.records.get(&self.tenant_id, execution_id).await {
            Ok(Some(record)) => record.is_terminal(),
            // Deleted while tailed.
            Ok(None) => true,
            Err(_) => false,
        }
    }
}

/// Builder for [`PipelineOrchestrator`].
#[derive(Default)]
pub struct PipelineOrchestratorBuilder {
    config: PipeforgeConfig,
    registry: Option<StageRegistry>,
    agents: Vec<Arc<dyn StageAgent>>,
    records: Option<Arc<dyn ExecutionRecordStore>>,
    log_backend: Option<Arc<dyn LogBackend>>,
    breaker: Option<Arc<DegradationManager>>,
    events: Option<Arc<dyn EventSink>>,
}

impl fmt::Debug for PipelineOrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestratorBuilder")
            .field("config", &self.config)
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestratorBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: PipeforgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the orchestrator section of the configuration.
    #[must_use]
    pub fn orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.config.orchestrator = config;
        self
    }

    /// Uses a prebuilt registry instead of building one from the
    /// registered agents and the configured order.
    #[must_use]
    pub fn registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Registers an agent.
    #[must_use]
    pub fn agent(mut self, agent: Arc<dyn StageAgent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Registers several agents.
    #[must_use]
    pub fn agents(mut self, agents: impl IntoIterator<Item = Arc<dyn StageAgent>>) -> Self {
        self.agents.extend(agents);
        self
    }

    /// Sets the record store. Defaults to an in-memory store.
    #[must_use]
    pub fn record_store(mut self, store: Arc<dyn ExecutionRecordStore>) -> Self {
        self.records = Some(store);
        self
    }

    /// Sets the durable log backend. Without one, logs live in memory only.
    #[must_use]
    pub fn log_backend(mut self, backend: Arc<dyn LogBackend>) -> Self {
        self.log_backend = Some(backend);
        self
    }

    /// Uses one SQLite database for both records and logs.
    #[cfg(feature = "sqlite")]
    #[must_use]
    pub fn sqlite(mut self, store: Arc<crate::storage::SqliteStore>) -> Self {
        self.records = Some(Arc::clone(&store) as Arc<dyn ExecutionRecordStore>);
        self.log_backend = Some(store as Arc<dyn LogBackend>);
        self
    }

    /// Shares an existing breaker registry.
    #[must_use]
    pub fn degradation(mut self, manager: Arc<DegradationManager>) -> Self {
        self.breaker = Some(manager);
        self
    }

    /// Sets the lifecycle event sink.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Validates the configuration and the registry.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for invalid configuration values, an
    /// unusable stage order, a stage without an agent, or a database that
    /// cannot be opened.
    pub fn build(self) -> Result<PipelineOrchestrator, ConfigurationError> {
        self.config.validate()?;
        let registry = match self.registry {
            Some(registry) => registry,
            None => StageRegistry::builder()
                .order(self.config.orchestrator.stage_order.clone())
                .agents(self.agents)
                .build()?,
        };

        let events = self.events.unwrap_or_else(|| Arc::new(NoOpEventSink));
        let breaker = self.breaker.unwrap_or_else(|| {
            Arc::new(
                DegradationManager::new(self.config.circuit_breaker.clone())
                    .with_event_sink(Arc::clone(&events)),
            )
        });

        let (records, log_backend) = match (self.records, self.log_backend) {
            (None, None) => open_configured_stores(&self.config)?,
            (records, log_backend) => (records, log_backend),
        };
        let records = records.unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));

        let mut logs = ExecutionLogStore::new(self.config.log_store.clone(), Arc::clone(&breaker));
        if let Some(backend) = log_backend {
            logs = logs.with_durable(backend);
        }

        info!(
            stages = registry.len(),
            record_store = records.name(),
            quality_threshold = self.config.orchestrator.quality_threshold,
            max_retries = self.config.orchestrator.max_retries,
            "orchestrator ready"
        );
        Ok(PipelineOrchestrator {
            registry: Arc::new(registry),
            gate: QualityGate::new(self.config.orchestrator.quality_threshold),
            config: Arc::new(self.config.orchestrator),
            records,
            logs: Arc::new(logs),
            breaker,
            events,
            live: Arc::new(DashMap::new()),
        })
    }
}

type StorePair = (Option<Arc<dyn ExecutionRecordStore>>, Option<Arc<dyn LogBackend>>);

#[cfg(feature = "sqlite")]
fn open_configured_stores(config: &PipeforgeConfig) -> Result<StorePair, ConfigurationError> {
    let Some(path) = &config.database_path else {
        return Ok((None, None));
    };
    let store = crate::storage::SqliteStore::open(path).map_err(|e| {
        ConfigurationError::new(format!("cannot open database {}: {e}", path.display())).with_error_info(
            ErrorInfo::new(CONFIG_INVALID, "database cannot be opened")
                .with_context_entry("field", "database_path"),
        )
    })?;
    let store = Arc::new(store);
    Ok((
        Some(Arc::clone(&store) as Arc<dyn ExecutionRecordStore>),
        Some(store as Arc<dyn LogBackend>),
    ))
}

#[cfg(not(feature = "sqlite"))]
fn open_configured_stores(config: &PipeforgeConfig) -> Result<StorePair, ConfigurationError> {
    if config.database_path.is_some() {
        return Err(ConfigurationError::new("database_path requires the sqlite feature").with_error_info(
            ErrorInfo::new(CONFIG_INVALID, "database_path is set but SQLite support is not compiled in")
                .with_context_entry("field", "database_path"),
        ));
    }
    Ok((None, None))
}
