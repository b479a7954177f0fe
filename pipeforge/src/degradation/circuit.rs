//! Per-service breaker state.

use crate::config::CircuitBreakerConfig;
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

/// Breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Calls flow normally.
    #[default]
    Closed,
    /// Calls are skipped until the cool-down expires.
    Open,
    /// A single trial call is in flight or permitted.
    HalfOpen,
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Coarse health derived from the breaker phase and recent failure rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    /// Closed with a low recent failure rate.
    Healthy,
    /// Closed with an elevated failure rate, or probing in half-open.
    Degraded,
    /// Open.
    Failed,
}

/// Whether a call may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Run the call. `trial` is set for the single half-open probe.
    Allowed { trial: bool },
    /// Skip the call.
    Rejected,
}

/// Rolling call statistics and phase for one service.
#[derive(Debug, Clone)]
pub struct CircuitState {
    phase: CircuitPhase,
    window: VecDeque<bool>,
    window_size: usize,
    consecutive_failures: u32,
    attempts: u64,
    successes: u64,
    failures: u64,
    fallbacks: u64,
    skipped: u64,
    opened_at: Option<Instant>,
    last_transition: Timestamp,
    trial_in_flight: bool,
}

impl CircuitState {
    /// Creates a closed breaker with an empty window.
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        Self {
            phase: CircuitPhase::Closed,
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            consecutive_failures: 0,
            attempts: 0,
            successes: 0,
            failures: 0,
            fallbacks: 0,
            skipped: 0,
            opened_at: None,
            last_transition: now_utc(),
            trial_in_flight: false,
        }
    }

    /// Current phase, without applying the cool-down.
    #[must_use]
    pub fn phase(&self) -> CircuitPhase {
        self.phase
    }

    /// Time of the last phase change.
    #[must_use]
    pub fn last_transition(&self) -> Timestamp {
        self.last_transition
    }

    /// Calls that ran.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Calls that ran and succeeded.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes
    }

    /// Calls that ran and failed.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Calls answered from a fallback.
    #[must_use]
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    /// Calls skipped because the breaker was open.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Consecutive failures since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Success fraction of all attempted calls; 1.0 before the first call.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            1.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    /// Fraction of requests answered from a fallback.
    #[must_use]
    pub fn degradation_rate(&self) -> f64 {
        let requests = self.attempts + self.skipped;
        if requests == 0 {
            0.0
        } else {
            self.fallbacks as f64 / requests as f64
        }
    }

    /// Failure fraction of the rolling window.
    #[must_use]
    pub fn window_failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    /// Phase as observed at `now`: an open breaker whose cool-down has
    /// expired reads as half-open, since the next call will be a trial.
    #[must_use]
    pub fn phase_at(&self, now: Instant, config: &CircuitBreakerConfig) -> CircuitPhase {
        match self.phase {
            CircuitPhase::Open if self.cool_down_expired(now, config) => CircuitPhase::HalfOpen,
            phase => phase,
        }
    }

    /// Health for the summary, as observed now.
    #[must_use]
    pub fn health(&self, config: &CircuitBreakerConfig) -> ServiceHealth {
        self.health_at(Instant::now(), config)
    }

    /// Health as observed at `now`.
    #[must_use]
    pub fn health_at(&self, now: Instant, config: &CircuitBreakerConfig) -> ServiceHealth {
        match self.phase_at(now, config) {
            CircuitPhase::Open => ServiceHealth::Failed,
            CircuitPhase::HalfOpen => ServiceHealth::Degraded,
            CircuitPhase::Closed => {
                if self.consecutive_failures > 0
                    || (!self.window.is_empty()
                        && self.window_failure_rate() >= config.degraded_failure_rate
                        && config.degraded_failure_rate > 0.0)
                {
                    ServiceHealth::Degraded
                } else {
                    ServiceHealth::Healthy
                }
            }
        }
    }

    /// Decides whether a call may run now. Moves an expired open breaker to
    /// half-open and hands out its single trial.
    pub(crate) fn admit(&mut self, now: Instant, config: &CircuitBreakerConfig) -> (Admission, Option<CircuitPhase>) {
        match self.phase {
            CircuitPhase::Closed => (Admission::Allowed { trial: false }, None),
            CircuitPhase::Open => {
                if self.cool_down_expired(now, config) {
                    self.transition(CircuitPhase::HalfOpen);
                    self.trial_in_flight = true;
                    (Admission::Allowed { trial: true }, Some(CircuitPhase::HalfOpen))
                } else {
                    self.skipped += 1;
                    (Admission::Rejected, None)
                }
            }
            CircuitPhase::HalfOpen => {
                if self.trial_in_flight {
                    self.skipped += 1;
                    (Admission::Rejected, None)
                } else {
                    self.trial_in_flight = true;
                    (Admission::Allowed { trial: true }, None)
                }
            }
        }
    }

    /// Records the outcome of an admitted call and returns the new phase if
    /// it changed.
    pub(crate) fn record(
        &mut self,
        success: bool,
        trial: bool,
        now: Instant,
        config: &CircuitBreakerConfig,
    ) -> Option<CircuitPhase> {
        self.attempts += 1;
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);

        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        if trial {
            self.trial_in_flight = false;
            if self.phase == CircuitPhase::HalfOpen {
                return if success {
                    self.window.clear();
                    self.transition(CircuitPhase::Closed)
                } else {
                    self.opened_at = Some(now);
                    self.transition(CircuitPhase::Open)
                };
            }
            return None;
        }

        if !success && self.phase == CircuitPhase::Closed && self.should_trip(config) {
            self.opened_at = Some(now);
            return self.transition(CircuitPhase::Open);
        }
        None
    }

    /// Counts a request answered from a fallback.
    pub(crate) fn record_fallback(&mut self) {
        self.fallbacks += 1;
    }

    fn cool_down_expired(&self, now: Instant, config: &CircuitBreakerConfig) -> bool {
        self.opened_at
            .map_or(true, |at| now.saturating_duration_since(at) >= config.cool_down())
    }

    fn should_trip(&self, config: &CircuitBreakerConfig) -> bool {
        if self.consecutive_failures >= config.failure_threshold {
            return true;
        }
        self.window.len() >= config.min_calls_for_rate
            && config.min_calls_for_rate > 0
            && self.window_failure_rate() > config.failure_rate_threshold
    }

    fn transition(&mut self, phase: CircuitPhase) -> Option<CircuitPhase> {
        if self.phase == phase {
            return None;
        }
        self.phase = phase;
        self.last_transition = now_utc();
        if phase == CircuitPhase::Closed {
            self.opened_at = None;
        }
        Some(phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default().with_cool_down(Duration::from_millis(100))
    }

    fn fail(state: &mut CircuitState, now: Instant) -> Option<CircuitPhase> {
        let (admission, _) = state.admit(now, &config());
        let trial = matches!(admission, Admission::Allowed { trial: true });
        state.record(false, trial, now, &config())
    }

    #[test]
    fn test_trips_after_consecutive_failures() {
        let mut state = CircuitState::new(20);
        let now = Instant::now();
        assert_eq!(fail(&mut state, now), None);
        assert_eq!(fail(&mut state, now), None);
        assert_eq!(fail(&mut state, now), Some(CircuitPhase::Open));
        assert_eq!(state.health(&config()), ServiceHealth::Failed);

        let (admission, _) = state.admit(now, &config());
        assert_eq!(admission, Admission::Rejected);
        assert_eq!(state.skipped(), 1);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut state = CircuitState::new(20);
        let now = Instant::now();
        fail(&mut state, now);
        fail(&mut state, now);
        state.record(true, false, now, &config());
        assert_eq!(fail(&mut state, now), None);
        assert_eq!(state.phase(), CircuitPhase::Closed);
        assert_eq!(state.health(&config()), ServiceHealth::Degraded);
    }

    #[test]
    fn test_trips_on_failure_rate() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(100)
            .with_window(10, 4)
            .with_failure_rate_threshold(0.5);
        let mut state = CircuitState::new(10);
        let now = Instant::now();
        for ok in [true, false, true, false] {
            state.record(ok, false, now, &config);
        }
        assert_eq!(state.phase(), CircuitPhase::Closed);
        assert_eq!(state.record(false, false, now, &config), Some(CircuitPhase::Open));
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let mut state = CircuitState::new(20);
        let start = Instant::now();
        for _ in 0..3 {
            fail(&mut state, start);
        }

        let later = start + Duration::from_millis(150);
        let (first, change) = state.admit(later, &config());
        assert_eq!(first, Admission::Allowed { trial: true });
        assert_eq!(change, Some(CircuitPhase::HalfOpen));

        let (second, _) = state.admit(later, &config());
        assert_eq!(second, Admission::Rejected);

        assert_eq!(state.record(true, true, later, &config()), Some(CircuitPhase::Closed));
        assert_eq!(state.health(&config()), ServiceHealth::Healthy);
    }

    #[test]
    fn test_expired_cool_down_reads_as_half_open() {
        let mut state = CircuitState::new(20);
        let start = Instant::now();
        for _ in 0..3 {
            fail(&mut state, start);
        }
        let within = start + Duration::from_millis(50);
        assert_eq!(state.phase_at(within, &config()), CircuitPhase::Open);
        assert_eq!(state.health_at(within, &config()), ServiceHealth::Failed);

        let later = start + Duration::from_millis(150);
        assert_eq!(state.phase_at(later, &config()), CircuitPhase::HalfOpen);
        assert_eq!(state.health_at(later, &config()), ServiceHealth::Degraded);
        // Nothing was admitted, so the stored phase has not moved.
        assert_eq!(state.phase(), CircuitPhase::Open);
        assert_eq!(state.skipped(), 0);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let mut state = CircuitState::new(20);
        let start = Instant::now();
        for _ in 0..3 {
            fail(&mut state, start);
        }
        let later = start + Duration::from_millis(150);
        assert_eq!(fail(&mut state, later), Some(CircuitPhase::Open));

        let (admission, _) = state.admit(later + Duration::from_millis(10), &config());
        assert_eq!(admission, Admission::Rejected);
    }

    #[test]
    fn test_rates() {
        let mut state = CircuitState::new(20);
        assert_eq!(state.success_rate(), 1.0);
        assert_eq!(state.degradation_rate(), 0.0);

        let now = Instant::now();
        state.record(true, false, now, &config());
        state.record(false, false, now, &config());
        state.record_fallback();
        assert_eq!(state.success_rate(), 0.5);
        assert_eq!(state.degradation_rate(), 0.5);
    }
}
