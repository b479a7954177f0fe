//! Guarded calls to named dependencies.

use super::circuit::{Admission, CircuitPhase, CircuitState, ServiceHealth};
use crate::config::CircuitBreakerConfig;
use crate::errors::DegradationError;
use crate::events::{EventKind, EventSink, NoOpEventSink, PipelineEvent};
use crate::utils::Timestamp;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a guarded call's value came from.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    /// The operation ran and succeeded.
    Live(T),
    /// The operation was skipped or failed and a fallback answered.
    Fallback(T),
}

impl<T> CallOutcome<T> {
    /// Returns the value regardless of origin.
    pub fn into_inner(self) -> T {
        match self {
            Self::Live(v) | Self::Fallback(v) => v,
        }
    }

    /// Returns true if a fallback answered.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

/// Per-service statistics returned by [`DegradationManager::get_summary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    /// Service name.
    pub service: String,
    /// Calls that ran.
    pub attempts: u64,
    /// Calls that ran and succeeded.
    pub successes: u64,
    /// Calls that ran and failed.
    pub failures: u64,
    /// Requests answered from a fallback.
    pub fallbacks: u64,
    /// Requests skipped while open.
    pub skipped: u64,
    /// `successes / attempts`.
    pub success_rate: f64,
    /// `fallbacks / (attempts + skipped)`.
    pub degradation_rate: f64,
    /// Current breaker phase.
    pub phase: CircuitPhase,
    /// Derived health.
    pub health: ServiceHealth,
    /// Time of the last phase change.
    pub last_transition: Timestamp,
}

/// Owns one breaker per service name and runs calls through them.
///
/// Services are created lazily on first use. All bookkeeping for a service
/// happens under its own lock, so concurrent callers of the same service
/// never lose updates and callers of different services never contend.
pub struct DegradationManager {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Arc<Mutex<CircuitState>>>,
    fallbacks: DashMap<String, serde_json::Value>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for DegradationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationManager")
            .field("config", &self.config)
            .field("services", &self.circuits.len())
            .finish_non_exhaustive()
    }
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl DegradationManager {
    /// Creates a manager with the given thresholds.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            fallbacks: DashMap::new(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the sink that receives `circuit.*` events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Returns the thresholds in use.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Registers the value [`DegradationManager::call_with_degradation`]
    /// answers with while `service` is unavailable.
    pub fn register_fallback(&self, service: impl Into<String>, value: serde_json::Value) {
        self.fallbacks.insert(service.into(), value);
    }

    /// Runs `op` unless the breaker for `service` is open.
    ///
    /// # Errors
    ///
    /// Returns [`DegradationError::CircuitOpen`] when the call was skipped and
    /// [`DegradationError::Operation`] when it ran and failed.
    pub async fn call<T, E, F, Fut>(&self, service: &str, op: F) -> Result<T, DegradationError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let Some(permit) = self.admit(service) else {
            debug!(service, "circuit open, call skipped");
            return Err(DegradationError::CircuitOpen {
                service: service.to_string(),
            });
        };

        match op().await {
            Ok(value) => {
                permit.settle(true);
                Ok(value)
            }
            Err(e) => {
                debug!(service, error = %e, "guarded call failed");
                permit.settle(false);
                Err(DegradationError::Operation(e))
            }
        }
    }

    /// Runs `op` and answers with `fallback` when the call is skipped or fails.
    pub async fn call_with_fallback<T, E, F, Fut, FB>(
        &self,
        service: &str,
        op: F,
        fallback: FB,
    ) -> CallOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        FB: FnOnce(DegradationError<E>) -> T,
    {
        match self.call(service, op).await {
            Ok(value) => CallOutcome::Live(value),
            Err(err) => {
                self.note_fallback(service, &err);
                CallOutcome::Fallback(fallback(err))
            }
        }
    }

    /// Runs `op` and answers with the registered fallback for `service`, or
    /// a failure marker object when none is registered.
    pub async fn call_with_degradation<E, F, Fut>(
        &self,
        service: &str,
        op: F,
    ) -> CallOutcome<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
        E: fmt::Display,
    {
        let registered = self.fallbacks.get(service).map(|v| v.value().clone());
        self.call_with_fallback(service, op, |err| {
            registered.unwrap_or_else(|| {
                serde_json::json!({
                    "degraded": true,
                    "service": service,
                    "circuit_open": err.is_circuit_open(),
                    "error": err.to_string(),
                })
            })
        })
        .await
    }

    /// Current phase of `service`; closed for unknown services. An open
    /// breaker past its cool-down reports half-open.
    #[must_use]
    pub fn phase(&self, service: &str) -> CircuitPhase {
        self.circuits
            .get(service)
            .map_or(CircuitPhase::Closed, |s| s.lock().phase_at(Instant::now(), &self.config))
    }

    /// Current health of `service`; healthy for unknown services.
    #[must_use]
    pub fn health(&self, service: &str) -> ServiceHealth {
        self.circuits
            .get(service)
            .map_or(ServiceHealth::Healthy, |s| s.lock().health(&self.config))
    }

    /// Returns statistics for one service, or all of them sorted by name.
    #[must_use]
    pub fn get_summary(&self, service: Option<&str>) -> Vec<ServiceSummary> {
        let now = Instant::now();
        let mut summaries: Vec<ServiceSummary> = self
            .circuits
            .iter()
            .filter(|entry| service.map_or(true, |s| entry.key() == s))
            .map(|entry| {
                let state = entry.value().lock();
                ServiceSummary {
                    service: entry.key().clone(),
                    attempts: state.attempts(),
                    successes: state.successes(),
                    failures: state.failures(),
                    fallbacks: state.fallbacks(),
                    skipped: state.skipped(),
                    success_rate: state.success_rate(),
                    degradation_rate: state.degradation_rate(),
                    phase: state.phase_at(now, &self.config),
                    health: state.health_at(now, &self.config),
                    last_transition: state.last_transition(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.service.cmp(&b.service));
        summaries
    }

    /// Forgets all state for `service`.
    pub fn reset(&self, service: &str) {
        if self.circuits.remove(service).is_some() {
            info!(service, "circuit reset");
        }
    }

    fn state(&self, service: &str) -> Arc<Mutex<CircuitState>> {
        if let Some(state) = self.circuits.get(service) {
            return Arc::clone(state.value());
        }
        Arc::clone(
            self.circuits
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitState::new(self.config.window_size))))
                .value(),
        )
    }

    fn admit(&self, service: &str) -> Option<Permit<'_>> {
        let state = self.state(service);
        let (admission, change) = state.lock().admit(Instant::now(), &self.config);
        if let Some(phase) = change {
            self.announce(service, phase, &state);
        }
        match admission {
            Admission::Allowed { trial } => Some(Permit {
                manager: self,
                service: service.to_string(),
                state,
                trial,
                settled: false,
            }),
            Admission::Rejected => None,
        }
    }

    fn note_fallback(&self, service: &str, err: &dyn fmt::Display) {
        self.state(service).lock().record_fallback();
        warn!(service, reason = %err, "serving fallback");
    }

    fn announce(&self, service: &str, phase: CircuitPhase, state: &Mutex<CircuitState>) {
        let (failures, consecutive) = {
            let s = state.lock();
            (s.failures(), s.consecutive_failures())
        };
        let kind = match phase {
            CircuitPhase::Open => {
                warn!(service, consecutive_failures = consecutive, "circuit opened");
                EventKind::CircuitOpened
            }
            CircuitPhase::HalfOpen => {
                info!(service, "circuit half-open, admitting trial call");
                EventKind::CircuitHalfOpen
            }
            CircuitPhase::Closed => {
                info!(service, "circuit closed");
                EventKind::CircuitClosed
            }
        };
        self.events.try_emit(PipelineEvent::global(
            kind,
            serde_json::json!({
                "service": service,
                "phase": phase,
                "failures": failures,
                "consecutive_failures": consecutive,
            }),
        ));
    }
}

/// An admitted call. Dropping it unsettled counts as a failure, so a
/// cancelled trial call cannot leave the breaker stuck in half-open.
struct Permit<'a> {
    manager: &'a DegradationManager,
    service: String,
    state: Arc<Mutex<CircuitState>>,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.finish(success);
    }

    fn finish(&self, success: bool) {
        let change = self.state.lock().record(
            success,
            self.trial,
            Instant::now(),
            &self.manager.config,
        );
        if let Some(phase) = change {
            self.manager.announce(&self.service, phase, &self.state);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.finish(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager(cool_down_ms: u64) -> DegradationManager {
        DegradationManager::new(
            CircuitBreakerConfig::default().with_cool_down(Duration::from_millis(cool_down_ms)),
        )
    }

    async fn failing() -> Result<u32, String> {
        Err("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_call_passes_through() {
        let m = manager(1_000);
        let value = m.call("db", || async { Ok::<_, String>(7) }).await;
        assert_eq!(value.ok(), Some(7));
        let summary = &m.get_summary(Some("db"))[0];
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.success_rate, 1.0);
        assert_eq!(summary.health, ServiceHealth::Healthy);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_and_serves_fallback() {
        let m = manager(60_000);
        for _ in 0..3 {
            let err = m.call("llm", failing).await.unwrap_err();
            assert!(!err.is_circuit_open());
        }
        assert_eq!(m.phase("llm"), CircuitPhase::Open);

        let invoked = AtomicUsize::new(0);
        let outcome = m
            .call_with_fallback(
                "llm",
                || async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(1)
                },
                |err| {
                    assert!(err.is_circuit_open());
                    42
                },
            )
            .await;

        assert_eq!(outcome, CallOutcome::Fallback(42));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let summary = &m.get_summary(Some("llm"))[0];
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.fallbacks, 1);
        assert_eq!(summary.health, ServiceHealth::Failed);
    }

    #[tokio::test]
    async fn test_single_trial_after_cool_down() {
        let sink = Arc::new(CollectingEventSink::new());
        let m = Arc::new(manager(50).with_event_sink(sink.clone()));
        for _ in 0..3 {
            let _ = m.call("search", failing).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let m = Arc::clone(&m);
            tokio::spawn(async move {
                m.call("search", || async move {
                    let _ = release_rx.await;
                    Ok::<_, String>("ok")
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(m.phase("search"), CircuitPhase::HalfOpen);

        let second = m.call("search", || async { Ok::<_, String>("second") }).await;
        assert!(second.unwrap_err().is_circuit_open());

        let _ = release_tx.send(());
        assert_eq!(trial.await.unwrap().ok(), Some("ok"));
        assert_eq!(m.phase("search"), CircuitPhase::Closed);

        assert_eq!(
            sink.kinds(),
            vec![EventKind::CircuitOpened, EventKind::CircuitHalfOpen, EventKind::CircuitClosed]
        );
    }

    #[tokio::test]
    async fn test_summary_reports_half_open_once_cool_down_expires() {
        let m = manager(40);
        for _ in 0..3 {
            let _ = m.call("mailer", failing).await;
        }
        assert_eq!(m.phase("mailer"), CircuitPhase::Open);
        assert_eq!(m.health("mailer"), ServiceHealth::Failed);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(m.phase("mailer"), CircuitPhase::HalfOpen);
        assert_eq!(m.health("mailer"), ServiceHealth::Degraded);
        let summary = &m.get_summary(Some("mailer"))[0];
        assert_eq!(summary.phase, CircuitPhase::HalfOpen);
        assert_eq!(summary.health, ServiceHealth::Degraded);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn test_call_with_degradation_uses_registered_fallback() {
        let m = manager(60_000);
        m.register_fallback("pricing", serde_json::json!({"price": 0}));

        let outcome = m
            .call_with_degradation("pricing", || async { Err::<serde_json::Value, _>("timeout") })
            .await;
        assert!(outcome.is_fallback());
        assert_eq!(outcome.into_inner(), serde_json::json!({"price": 0}));

        let outcome = m
            .call_with_degradation("inventory", || async { Err::<serde_json::Value, _>("timeout") })
            .await;
        let marker = outcome.into_inner();
        assert_eq!(marker["degraded"], true);
        assert_eq!(marker["service"], "inventory");
    }

    #[tokio::test]
    async fn test_dropped_trial_counts_as_failure() {
        let m = manager(200);
        for _ in 0..3 {
            let _ = m.call("slow", failing).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        let pending = m.call("slow", || std::future::pending::<Result<(), String>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        assert_eq!(m.phase("slow"), CircuitPhase::Open);
    }

    #[tokio::test]
    async fn test_summary_is_sorted_and_reset_forgets() {
        let m = manager(1_000);
        let _ = m.call("b", || async { Ok::<_, String>(()) }).await;
        let _ = m.call("a", || async { Ok::<_, String>(()) }).await;
        let names: Vec<_> = m.get_summary(None).into_iter().map(|s| s.service).collect();
        assert_eq!(names, vec!["a", "b"]);

        m.reset("a");
        assert_eq!(m.get_summary(None).len(), 1);
        assert_eq!(m.phase("a"), CircuitPhase::Closed);
    }
}
