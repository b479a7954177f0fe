//! Runtime configuration.
//!
//! Every section deserializes with per-field defaults, so a partial JSON
//! document (or none at all) yields a usable configuration. Environment
//! overrides use the `PIPEFORGE_` prefix.

use crate::core::AgentType;
use crate::errors::{ConfigurationError, ErrorInfo};
use crate::pipeline::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Diagnostic code for an unusable configuration value.
pub const CONFIG_INVALID: &str = "CONFIG-001-INVALID";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipeforgeConfig {
    /// Orchestrator behaviour.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Log store sizing and tail behaviour.
    #[serde(default)]
    pub log_store: LogStoreConfig,
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// SQLite database file. `None` keeps everything in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl PipeforgeConfig {
    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| invalid("json", format!("configuration is not valid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from defaults overlaid with `PIPEFORGE_*`
    /// environment variables.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`PipeforgeConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<f64, _>(&lookup, "PIPEFORGE_QUALITY_THRESHOLD")? {
            config.orchestrator.quality_threshold = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "PIPEFORGE_MAX_RETRIES")? {
            config.orchestrator.max_retries = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "PIPEFORGE_STAGE_TIMEOUT_SECS")? {
            config.orchestrator.stage_timeout_seconds = Some(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "PIPEFORGE_COOL_DOWN_MS")? {
            config.circuit_breaker.cool_down_ms = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "PIPEFORGE_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "PIPEFORGE_MEMORY_LOG_CAPACITY")? {
            config.log_store.memory_capacity_per_execution = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "PIPEFORGE_REPLAY_BUFFER")? {
            config.log_store.replay_buffer_capacity = v;
        }
        if let Some(path) = lookup("PIPEFORGE_DATABASE_PATH").filter(|p| !p.trim().is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.orchestrator.validate()?;
        self.log_store.validate()?;
        self.circuit_breaker.validate()
    }

    /// Sets the orchestrator section.
    #[must_use]
    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Sets the log store section.
    #[must_use]
    pub fn with_log_store(mut self, log_store: LogStoreConfig) -> Self {
        self.log_store = log_store;
        self
    }

    /// Sets the circuit breaker section.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Sets the database path.
    #[must_use]
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }
}

/// Orchestrator behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Minimum quality score a completed result needs to be accepted.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Retries allowed per stage after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Optional per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_seconds: Option<f64>,
    /// Delay between retries.
    #[serde(default)]
    pub retry_backoff: RetryPolicy,
    /// Route agent calls through the circuit breaker as `agent.<stage>`.
    #[serde(default = "default_true")]
    pub guard_agents: bool,
    /// Stage order. Every listed stage needs a registered agent.
    #[serde(default = "AgentType::default_order")]
    pub stage_order: Vec<AgentType>,
}

fn default_quality_threshold() -> f64 {
    0.7
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            max_retries: default_max_retries(),
            stage_timeout_seconds: None,
            retry_backoff: RetryPolicy::default(),
            guard_agents: true,
            stage_order: AgentType::default_order(),
        }
    }
}

impl OrchestratorConfig {
    /// Sets the quality threshold.
    #[must_use]
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    /// Sets the retry bound.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    /// Sets the retry delay policy.
    #[must_use]
    pub fn with_retry_backoff(mut self, policy: RetryPolicy) -> Self {
        self.retry_backoff = policy;
        self
    }

    /// Enables or disables breaker protection around agent calls.
    #[must_use]
    pub fn with_guard_agents(mut self, guard: bool) -> Self {
        self.guard_agents = guard;
        self
    }

    /// Sets the stage order.
    #[must_use]
    pub fn with_stage_order(mut self, order: Vec<AgentType>) -> Self {
        self.stage_order = order;
        self
    }

    /// Returns the stage timeout as a duration.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(invalid(
                "orchestrator.quality_threshold",
                format!("quality_threshold must be within [0, 1], got {}", self.quality_threshold),
            ));
        }
        if let Some(t) = self.stage_timeout_seconds {
            if !t.is_finite() || t <= 0.0 {
                return Err(invalid(
                    "orchestrator.stage_timeout_seconds",
                    format!("stage_timeout_seconds must be positive, got {t}"),
                ));
            }
        }
        if self.retry_backoff.base_delay_ms > self.retry_backoff.max_delay_ms {
            return Err(invalid(
                "orchestrator.retry_backoff",
                "retry_backoff.base_delay_ms exceeds max_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Log store sizing and tail behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStoreConfig {
    /// Entries kept in memory per execution; the oldest are evicted first.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity_per_execution: usize,
    /// Entries held for replay while the durable backend is unreachable.
    #[serde(default = "default_replay_capacity")]
    pub replay_buffer_capacity: usize,
    /// Page size used when a query does not set a limit.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    /// Upper bound on any page size.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// Poll interval of streaming tails in milliseconds.
    #[serde(default = "default_tail_poll_ms")]
    pub tail_poll_interval_ms: u64,
}

fn default_memory_capacity() -> usize {
    10_000
}

fn default_replay_capacity() -> usize {
    1_000
}

fn default_page_size() -> usize {
    100
}

fn default_max_page_size() -> usize {
    1_000
}

fn default_tail_poll_ms() -> u64 {
    500
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            memory_capacity_per_execution: default_memory_capacity(),
            replay_buffer_capacity: default_replay_capacity(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            tail_poll_interval_ms: default_tail_poll_ms(),
        }
    }
}

impl LogStoreConfig {
    /// Sets the per-execution memory capacity.
    #[must_use]
    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity_per_execution = capacity;
        self
    }

    /// Sets the replay buffer capacity.
    #[must_use]
    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_buffer_capacity = capacity;
        self
    }

    /// Sets the tail poll interval.
    #[must_use]
    pub fn with_tail_poll_interval(mut self, interval: Duration) -> Self {
        self.tail_poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the tail poll interval.
    #[must_use]
    pub fn tail_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tail_poll_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.memory_capacity_per_execution == 0 {
            return Err(invalid(
                "log_store.memory_capacity_per_execution",
                "memory_capacity_per_execution must be at least 1",
            ));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(invalid(
                "log_store.default_page_size",
                "default_page_size must be within [1, max_page_size]",
            ));
        }
        if self.tail_poll_interval_ms == 0 {
            return Err(invalid(
                "log_store.tail_poll_interval_ms",
                "tail_poll_interval_ms must be positive",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Window failure rate that trips the breaker.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    /// Number of recent calls in the rolling window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Calls required in the window before the rate rule applies.
    #[serde(default = "default_min_calls")]
    pub min_calls_for_rate: usize,
    /// Time the breaker stays open before admitting a trial call.
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,
    /// Window failure rate at which a closed breaker reports degraded health.
    #[serde(default = "default_degraded_failure_rate")]
    pub degraded_failure_rate: f64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_window_size() -> usize {
    20
}

fn default_min_calls() -> usize {
    10
}

fn default_cool_down_ms() -> u64 {
    30_000
}

fn default_degraded_failure_rate() -> f64 {
    0.2
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_rate_threshold: default_failure_rate_threshold(),
            window_size: default_window_size(),
            min_calls_for_rate: default_min_calls(),
            cool_down_ms: default_cool_down_ms(),
            degraded_failure_rate: default_degraded_failure_rate(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the consecutive failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the cool-down.
    #[must_use]
    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down_ms = u64::try_from(cool_down.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the rolling window size and the minimum calls for the rate rule.
    #[must_use]
    pub fn with_window(mut self, window_size: usize, min_calls_for_rate: usize) -> Self {
        self.window_size = window_size;
        self.min_calls_for_rate = min_calls_for_rate;
        self
    }

    /// Sets the failure rate threshold.
    #[must_use]
    pub fn with_failure_rate_threshold(mut self, rate: f64) -> Self {
        self.failure_rate_threshold = rate;
        self
    }

    /// Returns the cool-down as a duration.
    #[must_use]
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.failure_threshold == 0 {
            return Err(invalid(
                "circuit_breaker.failure_threshold",
                "failure_threshold must be at least 1",
            ));
        }
        if self.window_size == 0 || self.min_calls_for_rate > self.window_size {
            return Err(invalid(
                "circuit_breaker.window_size",
                "window_size must be positive and at least min_calls_for_rate",
            ));
        }
        for (field, rate) in [
            ("circuit_breaker.failure_rate_threshold", self.failure_rate_threshold),
            ("circuit_breaker.degraded_failure_rate", self.degraded_failure_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(invalid(field, format!("{field} must be within [0, 1], got {rate}")));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigurationError {
    let message = message.into();
    ConfigurationError::new(message.clone()).with_error_info(
        ErrorInfo::new(CONFIG_INVALID, message).with_context_entry("field", field),
    )
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, format!("{key}={raw:?} is not valid: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PipeforgeConfig::default();
        assert_eq!(config.orchestrator.quality_threshold, 0.7);
        assert_eq!(config.orchestrator.max_retries, 3);
        assert_eq!(config.orchestrator.stage_order.len(), 7);
        assert_eq!(config.log_store.memory_capacity_per_execution, 10_000);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.cool_down(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PipeforgeConfig::from_json_str(
            r#"{"orchestrator": {"max_retries": 1, "stage_order": ["backend", "frontend"]}}"#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.max_retries, 1);
        assert_eq!(
            config.orchestrator.stage_order,
            vec![AgentType::Backend, AgentType::Frontend]
        );
        assert_eq!(config.orchestrator.quality_threshold, 0.7);
        assert_eq!(config.log_store, LogStoreConfig::default());
    }

    #[test]
    fn test_invalid_json_values_rejected() {
        let err = PipeforgeConfig::from_json_str(r#"{"orchestrator": {"quality_threshold": 1.5}}"#)
            .unwrap_err();
        assert_eq!(err.code(), Some(CONFIG_INVALID));

        assert!(PipeforgeConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PIPEFORGE_QUALITY_THRESHOLD", "0.5"),
            ("PIPEFORGE_MAX_RETRIES", "1"),
            ("PIPEFORGE_STAGE_TIMEOUT_SECS", "2.5"),
            ("PIPEFORGE_COOL_DOWN_MS", "100"),
            ("PIPEFORGE_DATABASE_PATH", "/tmp/pipeforge.db"),
        ]);
        let config =
            PipeforgeConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();

        assert_eq!(config.orchestrator.quality_threshold, 0.5);
        assert_eq!(config.orchestrator.max_retries, 1);
        assert_eq!(config.orchestrator.stage_timeout(), Some(Duration::from_millis(2_500)));
        assert_eq!(config.circuit_breaker.cool_down_ms, 100);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/pipeforge.db")));
    }

    #[test]
    fn test_env_malformed_value() {
        let err = PipeforgeConfig::from_lookup(|k| {
            (k == "PIPEFORGE_MAX_RETRIES").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.message.contains("PIPEFORGE_MAX_RETRIES"));
    }

    #[test]
    fn test_breaker_validation() {
        let config = CircuitBreakerConfig::default().with_window(5, 10);
        assert!(config.validate().is_err());
        let config = CircuitBreakerConfig::default().with_failure_threshold(0);
        assert!(config.validate().is_err());
    }
}
