//! End-to-end tests of runs driven through the orchestrator.

#[cfg(test)]
mod tests {
    use crate::agents::StageAgent;
    use crate::config::{CircuitBreakerConfig, LogStoreConfig, OrchestratorConfig, PipeforgeConfig};
    use crate::core::{AgentType, ExecutionStatus};
    use crate::degradation::{CircuitPhase, DegradationManager};
    use crate::events::{CollectingEventSink, EventKind};
    use crate::logs::{ExecutionLogStore, LogEntry, LogLevel, LogQuery, SummaryScope, TailMode};
    use crate::pipeline::{PipelineOrchestrator, RetryPolicy};
    use crate::records::ExecutionRecord;
    use crate::testing::{
        assert_progress_monotonic, assert_stage_prefix, fixtures, FlakyLogBackend, ScriptStep,
        ScriptedAgent,
    };
    use crate::utils::now_utc;
    use chrono::SubsecRound;
    use parking_lot::RwLock;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::assert_ok;
    use uuid::Uuid;

    fn config(order: Vec<AgentType>, max_retries: u32) -> PipeforgeConfig {
        PipeforgeConfig::default().with_orchestrator(
            OrchestratorConfig::default()
                .with_stage_order(order)
                .with_max_retries(max_retries)
                .with_retry_backoff(RetryPolicy::immediate()),
        )
    }

    fn build(
        config: PipeforgeConfig,
        agents: Vec<Arc<dyn StageAgent>>,
        sink: Arc<CollectingEventSink>,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::builder()
            .config(config)
            .agents(agents)
            .event_sink(sink)
            .build()
            .unwrap()
    }

    fn shared(agent: ScriptedAgent) -> Arc<dyn StageAgent> {
        Arc::new(agent)
    }

    fn log_store() -> ExecutionLogStore {
        let breaker = Arc::new(DegradationManager::new(CircuitBreakerConfig::default()));
        ExecutionLogStore::new(LogStoreConfig::default(), breaker)
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_reaches_100_only_on_completion() {
        let order = vec![AgentType::Backend, AgentType::Frontend, AgentType::Database];
        let agents: Vec<Arc<dyn StageAgent>> = order
            .iter()
            .map(|&stage| {
                shared(ScriptedAgent::always_succeeds(stage).with_progress(vec![20.0, 60.0, 40.0, 100.0]))
            })
            .collect();
        let sink = Arc::new(CollectingEventSink::new());
        let orch = build(config(order, 0), agents, sink.clone());

        let outcome = assert_ok!(
            orch.execute_run(&fixtures::tenant("acme"), "shop", fixtures::sample_blueprint())
                .await
        );

        assert!(outcome.is_completed());
        let events = sink.events();
        assert_progress_monotonic(&events);

        let progress: Vec<f64> = sink
            .events_of_kind(EventKind::ProgressUpdated)
            .iter()
            .filter_map(|e| e.data["overall_progress"].as_f64())
            .collect();
        let (last, before) = progress.split_last().unwrap();
        assert_eq!(*last, 100.0);
        assert!(before.iter().all(|p| *p < 100.0));
        assert_eq!(outcome.record.overall_progress, 100.0);
        assert_stage_prefix(&outcome.record);
    }

    #[tokio::test]
    async fn test_failed_run_never_reports_100() {
        let order = vec![AgentType::Backend, AgentType::Frontend];
        let sink = Arc::new(CollectingEventSink::new());
        let orch = build(
            config(order, 0),
            vec![
                shared(ScriptedAgent::always_succeeds(AgentType::Backend).with_progress(vec![100.0])),
                shared(ScriptedAgent::always_fails(AgentType::Frontend, "template missing")),
            ],
            sink.clone(),
        );

        let outcome = orch
            .execute_run(&fixtures::tenant("acme"), "shop", fixtures::minimal_blueprint())
            .await
            .unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Failed);
        assert!(outcome.record.overall_progress < 100.0);
        assert_progress_monotonic(&sink.events());
        assert_eq!(outcome.record.stages_completed, vec![AgentType::Backend]);
        assert_stage_prefix(&outcome.record);
    }

    #[tokio::test]
    async fn test_retry_until_accepted_counts_retries() {
        let agent = ScriptedAgent::failing_then_succeeding(AgentType::Backend, 2);
        let calls = agent.call_counter();
        let sink = Arc::new(CollectingEventSink::new());
        let orch = build(config(vec![AgentType::Backend], 3), vec![shared(agent)], sink.clone());

        let outcome = orch
            .execute_run(&fixtures::tenant("acme"), "shop", fixtures::minimal_blueprint())
            .await
            .unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Completed);
        assert_eq!(outcome.record.retry_count, 2);
        assert_eq!(calls.get(), 3);
        assert_eq!(outcome.stage_results.len(), 1);
        assert_eq!(outcome.stage_results[0].output["attempt"], 3);
        assert_eq!(sink.events_of_kind(EventKind::StageRetry).len(), 2);

        // Only the accepted attempt's artifacts survive.
        let paths: Vec<&str> = outcome.artifacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["backend/output.txt"]);
    }

    #[tokio::test]
    async fn test_zero_score_stage_fails_run_without_running_later_stages() {
        let frontend = ScriptedAgent::always_succeeds(AgentType::Frontend);
        let frontend_calls = frontend.call_counter();
        let backend = ScriptedAgent::always_succeeds(AgentType::Backend).with_fixed_score(0.0);
        let backend_calls = backend.call_counter();
        let sink = Arc::new(CollectingEventSink::new());
        let orch = build(
            config(vec![AgentType::Backend, AgentType::Frontend], 1),
            vec![shared(backend), shared(frontend)],
            sink.clone(),
        );
        let ctx = fixtures::tenant("acme");

        let outcome = orch.execute_run(&ctx, "shop", fixtures::minimal_blueprint()).await.unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Failed);
        assert!(outcome.record.stages_completed.is_empty());
        assert_eq!(outcome.record.retry_count, 1);
        assert_eq!(backend_calls.get(), 2);
        assert_eq!(frontend_calls.get(), 0);
        assert!(outcome.record.completed_at.is_some());
        assert!(outcome.record.error_message.is_some());
        assert_eq!(sink.events_of_kind(EventKind::RunFailed).len(), 1);

        let stored = orch.get_execution(&ctx, outcome.execution_id()).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_later_stages_see_earlier_outputs() {
        let frontend = ScriptedAgent::always_succeeds(AgentType::Frontend);
        let inputs = frontend.recorded_inputs();
        let orch = build(
            config(vec![AgentType::Backend, AgentType::Frontend], 0),
            vec![
                shared(ScriptedAgent::always_succeeds(AgentType::Backend)),
                shared(frontend),
            ],
            Arc::new(CollectingEventSink::new()),
        );

        let outcome = orch
            .execute_run(&fixtures::tenant("acme"), "shop", fixtures::minimal_blueprint())
            .await
            .unwrap();

        let seen = inputs.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].output(AgentType::Backend).unwrap()["stage"], "backend");
        assert!(seen[0].output(AgentType::Frontend).is_none());
        assert!(outcome.accumulated_input.outputs().contains_key("frontend_output"));
        assert_eq!(seen[0].blueprint().tech("backend"), Some("axum"));
    }

    #[tokio::test]
    async fn test_failed_run_keeps_artifacts_of_accepted_stages() {
        let orch = build(
            config(vec![AgentType::Backend, AgentType::Frontend], 1),
            vec![
                shared(ScriptedAgent::always_succeeds(AgentType::Backend)),
                shared(ScriptedAgent::always_fails(AgentType::Frontend, "template missing")),
            ],
            Arc::new(CollectingEventSink::new()),
        );

        let outcome = orch
            .execute_run(&fixtures::tenant("acme"), "shop", fixtures::minimal_blueprint())
            .await
            .unwrap();

        let paths: Vec<&str> = outcome.artifacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["backend/output.txt"]);
        assert_eq!(outcome.record.error_message.as_deref(), Some("template missing"));
        assert_eq!(outcome.stage_results.len(), 2);
    }

    #[tokio::test]
    async fn test_run_logs_round_trip_with_cursor() {
        let orch = build(
            config(vec![AgentType::Backend, AgentType::Frontend], 0),
            vec![
                shared(ScriptedAgent::always_succeeds(AgentType::Backend)),
                shared(ScriptedAgent::always_succeeds(AgentType::Frontend)),
            ],
            Arc::new(CollectingEventSink::new()),
        );
        let ctx = fixtures::tenant("acme");
        let outcome = orch.execute_run(&ctx, "shop", fixtures::minimal_blueprint()).await.unwrap();
        let id = outcome.execution_id();

        let page = orch.get_logs(&ctx, LogQuery::new(id)).await.unwrap();
        assert!(page.total >= 5);
        let ids = page.ids();
        assert_eq!(ids, (1..=ids.len() as u64).collect::<Vec<_>>());
        assert!(page.entries.first().unwrap().message.starts_with("run started"));
        assert!(page.entries.last().unwrap().message.starts_with("run completed"));

        let k = page.entries[2].id;
        let rest = orch.get_logs(&ctx, LogQuery::new(id).after(k)).await.unwrap();
        assert_eq!(rest.entries, page.entries[3..].to_vec());

        let backend_only = orch
            .get_logs(&ctx, LogQuery::new(id).stage(AgentType::Backend))
            .await
            .unwrap();
        assert!(backend_only.entries.iter().all(|e| e.stage == Some(AgentType::Backend)));

        let other = fixtures::tenant("globex");
        assert!(orch.get_logs(&other, LogQuery::new(id)).await.is_err());
    }

    #[tokio::test]
    async fn test_log_store_round_trip_preserves_append_order() {
        let store = log_store();
        let id = Uuid::now_v7();
        let mut appended = Vec::new();
        for i in 0..20 {
            let entry = LogEntry::new(id, "acme", "shop", LogLevel::Info, format!("line {i}"));
            appended.push(store.append(entry).await);
        }

        let page = store.query(&LogQuery::new(id).limit(100)).await;
        assert_eq!(page.entries, appended);
        assert!(!page.has_more);

        for k in [0usize, 7, 19] {
            let page = store.query(&LogQuery::new(id).after(appended[k].id).limit(100)).await;
            assert_eq!(page.entries, appended[k + 1..].to_vec());
        }
    }

    #[tokio::test]
    async fn test_level_and_search_filters_are_conjunctive() {
        let store = log_store();
        let id = Uuid::now_v7();
        let seed = [
            (LogLevel::Error, "x marks the spot"),
            (LogLevel::Error, "disk full"),
            (LogLevel::Info, "x is fine"),
            (LogLevel::Warning, "x almost failed"),
            (LogLevel::Error, "another x failure"),
            (LogLevel::Info, "plain"),
        ];
        for (level, msg) in seed {
            store.append(LogEntry::new(id, "acme", "shop", level, msg)).await;
        }

        let page = store
            .query(&LogQuery::new(id).level(LogLevel::Error).search("x"))
            .await;

        let messages: Vec<&str> = page.entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["x marks the spot", "another x failure"]);
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_summary_counts_levels_and_stages() {
        let store = log_store();
        let id = Uuid::now_v7();
        let t = now_utc().trunc_subsecs(6);
        let seed = [
            (1, LogLevel::Info, AgentType::Backend),
            (2, LogLevel::Error, AgentType::Backend),
            (3, LogLevel::Info, AgentType::Frontend),
        ];
        for (offset, level, stage) in seed {
            let entry = LogEntry::new(id, "acme", "shop", level, "seeded")
                .with_stage(stage)
                .at(t + chrono::Duration::seconds(offset));
            store.append(entry).await;
        }

        let summary = store.summary(&SummaryScope::new(id)).await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_level.len(), 2);
        assert_eq!(summary.level_count(LogLevel::Info), 2);
        assert_eq!(summary.level_count(LogLevel::Error), 1);
        assert_eq!(summary.by_stage.len(), 2);
        assert_eq!(summary.stage_count(AgentType::Backend), 2);
        assert_eq!(summary.stage_count(AgentType::Frontend), 1);
        assert_eq!(summary.first_timestamp, Some(t + chrono::Duration::seconds(1)));
        assert_eq!(summary.last_timestamp, Some(t + chrono::Duration::seconds(3)));
    }

    #[tokio::test]
    async fn test_finished_runs_release_memory_logs_with_durable_backend() {
        let durable = Arc::new(FlakyLogBackend::new());
        let orch = PipelineOrchestrator::builder()
            .config(config(vec![AgentType::Backend, AgentType::Frontend], 0))
            .agents(vec![
                shared(ScriptedAgent::always_succeeds(AgentType::Backend)),
                shared(ScriptedAgent::always_succeeds(AgentType::Frontend)),
            ])
            .log_backend(durable.clone())
            .build()
            .unwrap();
        let ctx = fixtures::tenant("acme");

        let mut ids = Vec::new();
        for _ in 0..10 {
            let outcome = orch
                .execute_run(&ctx, "shop", fixtures::minimal_blueprint())
                .await
                .unwrap();
            ids.push(outcome.record.id);
        }

        assert_eq!(orch.log_store().memory().execution_count(), 0);
        for id in ids {
            let stored = durable.stored(id);
            assert!(stored > 0);
            let page = orch.get_logs(&ctx, LogQuery::new(id).limit(1_000)).await.unwrap();
            assert_eq!(page.total, stored);
        }
    }

    #[tokio::test]
    async fn test_breaker_skips_within_cool_down_then_admits_one_trial() {
        let cfg = config(vec![AgentType::Backend], 0).with_circuit_breaker(
            CircuitBreakerConfig::default().with_cool_down(Duration::from_millis(150)),
        );
        let agent = ScriptedAgent::new(
            AgentType::Backend,
            vec![
                ScriptStep::Raise("a".into()),
                ScriptStep::Raise("b".into()),
                ScriptStep::Raise("c".into()),
            ],
        )
        .with_delay(Duration::from_millis(50));
        let calls = agent.call_counter();
        let orch = build(cfg, vec![shared(agent)], Arc::new(CollectingEventSink::new()));

        let mut record = ExecutionRecord::new("shop", "acme", vec![AgentType::Backend]);
        record.mark_running();
        record.begin_stage(AgentType::Backend);
        let record = Arc::new(RwLock::new(record));
        let blueprint = crate::blueprint::Blueprint::parse(fixtures::minimal_blueprint()).unwrap();
        let input = crate::agents::AccumulatedInput::new("shop", Arc::new(blueprint));

        for _ in 0..3 {
            let result = orch.run_stage(&record, AgentType::Backend, &input).await;
            assert!(result.is_failure());
        }
        assert_eq!(orch.degradation().phase("agent.backend"), CircuitPhase::Open);

        let skipped = orch.run_stage(&record, AgentType::Backend, &input).await;
        assert!(skipped.is_failure());
        assert_eq!(calls.get(), 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (first, second) = tokio::join!(
            orch.run_stage(&record, AgentType::Backend, &input),
            orch.run_stage(&record, AgentType::Backend, &input),
        );

        assert_eq!(calls.get(), 4);
        assert!(first.is_success());
        assert!(second.error_message.unwrap().contains("Circuit open"));
        assert_eq!(orch.degradation().phase("agent.backend"), CircuitPhase::Closed);

        let summary = orch.get_circuit_summary(Some("agent.backend"));
        assert_eq!(summary[0].attempts, 4);
        assert_eq!(summary[0].fallbacks, 5);
    }

    #[tokio::test]
    async fn test_stream_tail_ends_when_run_finishes() {
        let orch = build(
            config(vec![AgentType::Backend, AgentType::Frontend], 0),
            vec![
                shared(ScriptedAgent::always_succeeds(AgentType::Backend).with_delay(Duration::from_millis(50))),
                shared(ScriptedAgent::always_succeeds(AgentType::Frontend).with_delay(Duration::from_millis(50))),
            ],
            Arc::new(CollectingEventSink::new()),
        );
        let ctx = fixtures::tenant("acme");
        let handle = orch.start_run(&ctx, "shop", fixtures::minimal_blueprint()).await.unwrap();
        let id = handle.execution_id();

        let session = orch
            .tail_logs(
                &ctx,
                LogQuery::new(id),
                TailMode::Stream {
                    poll_interval: Duration::from_secs(5),
                },
            )
            .await
            .unwrap();
        let tailed = tokio::time::timeout(Duration::from_secs(5), session.collect_all())
            .await
            .unwrap();
        let outcome = handle.wait().await.unwrap();

        assert!(outcome.is_completed());
        let ids: Vec<u64> = tailed.iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=ids.len() as u64).collect::<Vec<_>>());
        assert!(tailed[0].message.starts_with("run started"));
        assert!(tailed
            .iter()
            .any(|e| e.message.starts_with("frontend stage accepted")));
        assert_eq!(orch.log_store().active_watches(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let orch = build(
            config(vec![AgentType::Backend], 0),
            vec![shared(
                ScriptedAgent::always_succeeds(AgentType::Backend).with_delay(Duration::from_millis(20)),
            )],
            Arc::new(CollectingEventSink::new()),
        );
        let acme = fixtures::tenant("acme");
        let globex = fixtures::tenant("globex");

        let a = orch.start_run(&acme, "shop", fixtures::minimal_blueprint()).await.unwrap();
        let b = orch.start_run(&globex, "shop", fixtures::minimal_blueprint()).await.unwrap();
        let (a, b) = (a.wait().await.unwrap(), b.wait().await.unwrap());

        assert!(a.is_completed() && b.is_completed());
        assert_eq!(orch.live_runs(), 0);
        let listed = orch.list_executions(&acme, "shop").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a.execution_id());

        let page = orch.get_logs(&acme, LogQuery::new(a.execution_id())).await.unwrap();
        assert!(page.entries.iter().all(|e| e.tenant_id == "acme"));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_run_persists_to_sqlite() {
        use crate::records::ExecutionRecordStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let cfg = config(vec![AgentType::Backend], 0).with_database_path(path.clone());
        let orch = build(
            cfg,
            vec![shared(ScriptedAgent::always_succeeds(AgentType::Backend))],
            Arc::new(CollectingEventSink::new()),
        );
        let ctx = fixtures::tenant("acme");
        let outcome = orch.execute_run(&ctx, "shop", fixtures::minimal_blueprint()).await.unwrap();
        let id = outcome.execution_id();
        let page = orch.get_logs(&ctx, LogQuery::new(id)).await.unwrap();
        drop(orch);

        let store = crate::storage::SqliteStore::open(&path).unwrap();
        let record = store.get("acme", id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.stages_completed, vec![AgentType::Backend]);
        assert_eq!(store.log_count(id).unwrap(), page.total as u64);
    }
}
