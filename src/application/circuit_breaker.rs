//! Circuit breaker for one protected downstream dependency.
//!
//! The breaker is a pure local decision device: it never calls the
//! dependency itself. Callers ask [`CircuitBreaker::can_request`] before an
//! attempt and report the outcome with `record_success`/`record_failure`.
//!
//! ```text
//!  CLOSED --(sample >= minimum_requests && threshold reached)--> OPEN
//!  OPEN   --(cooldown elapsed, one caller gets the probe)-------> HALF_OPEN
//!  HALF_OPEN --probe success--> CLOSED (sample reset)
//!  HALF_OPEN --probe failure--> OPEN (cooldown restarts)
//! ```

use crate::application::ports::Clock;
use crate::error::ConfigError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are refused until the cooldown elapses
    Open,
    /// One probe request is in flight
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// What `failure_threshold` is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripMode {
    /// Failures / outcomes in the rolling sample, tripping at `>= failure_threshold`
    #[default]
    FailureRatio,
    /// Consecutive failures, tripping at `>= failure_threshold`
    ConsecutiveFailures,
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Name of the protected dependency, used in logs and errors
    pub name: String,
    pub mode: TripMode,
    /// A ratio in `(0, 1]` or a failure count, depending on `mode`
    pub failure_threshold: f64,
    /// Outcomes needed in the sample before the breaker may trip
    pub minimum_requests: u32,
    /// Number of most recent outcomes kept in the rolling sample
    pub sample_size: u32,
    /// How long the circuit stays open before probing
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "downstream".to_string(),
            mode: TripMode::FailureRatio,
            failure_threshold: 0.5,
            minimum_requests: 10,
            sample_size: 20,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Ratio-mode breaker for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_failure_ratio(mut self, threshold: f64, minimum_requests: u32) -> Self {
        self.mode = TripMode::FailureRatio;
        self.failure_threshold = threshold;
        self.minimum_requests = minimum_requests;
        self.sample_size = self.sample_size.max(minimum_requests);
        self
    }

    pub fn with_consecutive_failures(mut self, failures: u32) -> Self {
        self.mode = TripMode::ConsecutiveFailures;
        self.failure_threshold = f64::from(failures);
        self.minimum_requests = self.minimum_requests.min(failures);
        self.sample_size = self.sample_size.max(self.minimum_requests);
        self
    }

    pub fn with_sample_size(mut self, sample_size: u32) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            TripMode::FailureRatio if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) => {
                return Err(ConfigError::OutOfRange {
                    field: "failure_threshold",
                    detail: format!("ratio {} is not in (0, 1]", self.failure_threshold),
                });
            }
            TripMode::ConsecutiveFailures if self.failure_threshold < 1.0 => {
                return Err(ConfigError::OutOfRange {
                    field: "failure_threshold",
                    detail: format!("failure count {} is below 1", self.failure_threshold),
                });
            }
            _ => {}
        }
        if self.minimum_requests == 0 {
            return Err(ConfigError::Zero {
                field: "minimum_requests",
            });
        }
        if self.sample_size < self.minimum_requests {
            return Err(ConfigError::OutOfRange {
                field: "sample_size",
                detail: format!(
                    "{} is below minimum_requests ({})",
                    self.sample_size, self.minimum_requests
                ),
            });
        }
        if self.cooldown_ms == 0 {
            return Err(ConfigError::Zero {
                field: "cooldown_ms",
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    /// `true` marks a failure
    sample: VecDeque<bool>,
    failures_in_sample: u32,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            sample: VecDeque::new(),
            failures_in_sample: 0,
            opened_at: None,
            probe_started_at: None,
        }
    }

    fn push(&mut self, failed: bool, sample_size: usize) {
        self.sample.push_back(failed);
        if failed {
            self.failures_in_sample += 1;
        }
        while self.sample.len() > sample_size {
            if self.sample.pop_front() == Some(true) {
                self.failures_in_sample -= 1;
            }
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.sample.is_empty() {
            0.0
        } else {
            f64::from(self.failures_in_sample) / self.sample.len() as f64
        }
    }
}

/// Read-only view of a breaker for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests_in_sample: u32,
    pub failures_in_sample: u32,
    /// Milliseconds since the circuit last opened, while open or half-open
    pub opened_at_ms_ago: Option<u64>,
}

/// Rolling-outcome circuit breaker.
pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// # Errors
    /// Returns the first invalid field of `config`.
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Mutex::new(BreakerState::closed()),
            config,
            clock,
        })
    }

    /// Whether the caller may attempt a request now.
    ///
    /// When the cooldown has elapsed, exactly one caller receives `true` and
    /// becomes the probe. If that probe never reports, the next caller after
    /// another cooldown becomes the probe instead.
    pub fn can_request(&self) -> bool {
        let now = self.clock.now();
        let cooldown = self.config.cooldown();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let ready = inner
                    .opened_at
                    .map_or(true, |opened| now.saturating_duration_since(opened) >= cooldown);
                if ready {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started_at = Some(now);
                    tracing::info!(breaker = %self.config.name, "circuit half-open, sending probe");
                }
                ready
            }
            CircuitState::HalfOpen => {
                let stale_probe = inner
                    .probe_started_at
                    .map_or(true, |started| now.saturating_duration_since(started) >= cooldown);
                if stale_probe {
                    inner.probe_started_at = Some(now);
                    tracing::debug!(breaker = %self.config.name, "probe never reported, re-arming");
                }
                stale_probe
            }
        }
    }

    /// Report a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                *inner = BreakerState::closed();
                tracing::info!(breaker = %self.config.name, "circuit closed");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.push(false, self.sample_size());
                self.evaluate(&mut inner);
            }
            // A late report from before the trip
            CircuitState::Open => {}
        }
    }

    /// Report a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                self.trip(&mut inner, "probe failed");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.push(true, self.sample_size());
                self.evaluate(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Hand back a half-open trial that was answered without calling the
    /// dependency, so the next caller may try at once.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_started_at.is_some() {
            inner.probe_started_at = None;
            tracing::debug!(breaker = %self.config.name, "half-open trial released unused");
        }
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get the number of consecutive failures.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.config.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_requests_in_sample: u32::try_from(inner.sample.len()).unwrap_or(u32::MAX),
            failures_in_sample: inner.failures_in_sample,
            opened_at_ms_ago: inner.opened_at.map(|opened| {
                u64::try_from(now.saturating_duration_since(opened).as_millis()).unwrap_or(u64::MAX)
            }),
        }
    }

    /// Administrative clear back to a fresh closed breaker.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
        tracing::info!(breaker = %self.config.name, "circuit reset");
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn sample_size(&self) -> usize {
        self.config.sample_size as usize
    }

    fn evaluate(&self, inner: &mut BreakerState) {
        if (inner.sample.len() as u64) < u64::from(self.config.minimum_requests) {
            return;
        }
        let tripped = match self.config.mode {
            TripMode::FailureRatio => inner.failure_ratio() >= self.config.failure_threshold,
            TripMode::ConsecutiveFailures => {
                f64::from(inner.consecutive_failures) >= self.config.failure_threshold
            }
        };
        if tripped {
            self.trip(inner, "failure threshold reached");
        }
    }

    fn trip(&self, inner: &mut BreakerState, cause: &'static str) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(self.clock.now());
        inner.probe_started_at = None;
        tracing::info!(
            breaker = %self.config.name,
            cause,
            failure_ratio = inner.failure_ratio(),
            consecutive_failures = inner.consecutive_failures,
            cooldown_ms = self.config.cooldown_ms,
            "circuit opened"
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const COOLDOWN: Duration = Duration::from_secs(10);

    fn ratio_breaker(clock: &MockClock) -> CircuitBreaker {
        let config = CircuitBreakerConfig::new("llm")
            .with_failure_ratio(0.5, 4)
            .with_cooldown(COOLDOWN);
        CircuitBreaker::new(config, Arc::new(clock.clone())).unwrap()
    }

    fn open(cb: &CircuitBreaker) {
        for _ in 0..2 {
            cb.record_success();
        }
        for _ in 0..2 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_initial_state() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.can_request());
    }

    #[test]
    fn test_half_failures_in_full_sample_opens() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);

        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_request());
    }

    #[test]
    fn test_minimum_requests_prevents_early_trip() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);

        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_exactly_one_probe_after_cooldown() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);
        open(&cb);

        clock.advance(COOLDOWN - Duration::from_millis(1));
        assert!(!cb.can_request());

        clock.advance(Duration::from_millis(1));
        assert!(cb.can_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_request());
        assert!(!cb.can_request());
    }

    #[test]
    fn test_probe_success_closes_and_resets_sample() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);
        open(&cb);

        clock.advance(COOLDOWN);
        assert!(cb.can_request());
        cb.record_success();

        assert_eq!(cb.state(), CircuitState::Closed);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.total_requests_in_sample, 0);
        assert_eq!(snapshot.opened_at_ms_ago, None);
        assert!(cb.can_request());
    }

    #[test]
    fn test_probe_failure_restarts_cooldown() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);
        open(&cb);

        clock.advance(COOLDOWN);
        assert!(cb.can_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().opened_at_ms_ago, Some(0));

        clock.advance(COOLDOWN / 2);
        assert!(!cb.can_request());
        clock.advance(COOLDOWN / 2);
        assert!(cb.can_request());
    }

    #[test]
    fn test_silent_probe_is_rearmed() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);
        open(&cb);

        clock.advance(COOLDOWN);
        assert!(cb.can_request());
        clock.advance(COOLDOWN - Duration::from_millis(1));
        assert!(!cb.can_request());
        clock.advance(Duration::from_millis(1));
        assert!(cb.can_request());
        assert!(!cb.can_request());
    }

    #[test]
    fn test_released_trial_is_granted_again() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);
        open(&cb);
        clock.advance(COOLDOWN);

        assert!(cb.can_request());
        assert!(!cb.can_request());
        cb.release_trial();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_request());
        assert!(!cb.can_request());

        // No effect outside half-open
        cb.record_success();
        cb.release_trial();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_consecutive_mode() {
        let clock = MockClock::new(Instant::now());
        let config = CircuitBreakerConfig::new("vision")
            .with_consecutive_failures(3)
            .with_cooldown(COOLDOWN);
        let cb = CircuitBreaker::new(config, Arc::new(clock)).unwrap();

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.consecutive_failures(), 3);
    }

    #[test]
    fn test_rolling_sample_forgets_old_outcomes() {
        let clock = MockClock::new(Instant::now());
        let config = CircuitBreakerConfig::new("pricing")
            .with_failure_ratio(0.5, 4)
            .with_sample_size(4);
        let cb = CircuitBreaker::new(config, Arc::new(clock)).unwrap();

        cb.record_failure();
        for _ in 0..4 {
            cb.record_success();
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failures_in_sample, 1);
    }

    #[test]
    fn test_reset() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);
        open(&cb);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.can_request());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new(Instant::now()));
        let bad_ratio = CircuitBreakerConfig::new("x").with_failure_ratio(1.5, 4);
        assert!(CircuitBreaker::new(bad_ratio, Arc::clone(&clock)).is_err());

        let no_cooldown = CircuitBreakerConfig::new("x").with_cooldown(Duration::ZERO);
        assert!(CircuitBreaker::new(no_cooldown, Arc::clone(&clock)).is_err());

        let small_sample = CircuitBreakerConfig::new("x")
            .with_failure_ratio(0.5, 10)
            .with_sample_size(5);
        assert!(CircuitBreaker::new(small_sample, clock).is_err());
    }

    #[test]
    fn test_concurrent_callers_get_one_probe() {
        let clock = MockClock::new(Instant::now());
        let cb = Arc::new(ratio_breaker(&clock));
        open(&cb);
        clock.advance(COOLDOWN);

        let granted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = Arc::clone(&cb);
                let granted = Arc::clone(&granted);
                thread::spawn(move || {
                    if cb.can_request() {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_serializes_state() {
        let clock = MockClock::new(Instant::now());
        let cb = ratio_breaker(&clock);
        let json = serde_json::to_value(cb.snapshot()).unwrap();
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["name"], "llm");
    }
}
