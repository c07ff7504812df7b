//! Admission pipeline: quota, then rate limit, then breaker, then cache.
//!
//! The pipeline owns no state of its own. It holds the four components by
//! `Arc` (explicit injection, no globals) and runs them in order for each
//! request:
//!
//! ```text
//! QuotaLedger::consume ─deny─> QUOTA_EXCEEDED
//!        │
//! SlidingWindowLimiter::consume ─deny─> RATE_LIMITED      (quota refunded)
//!        │
//! CircuitBreaker::can_request ─open─> DEPENDENCY_UNAVAILABLE (quota refunded)
//!        │
//! ResultCache::get_or_compute(compute + breaker reporting)
//! ```

use crate::application::cache::{CacheConfig, ResultCache};
use crate::application::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::application::limiter::{RateLimitConfig, SlidingWindowLimiter};
use crate::application::metrics::{CacheStats, LimiterStats, QuotaStats};
use crate::application::ports::Clock;
use crate::application::quota::{QuotaConfig, QuotaLedger};
use crate::application::sweeper::{ShutdownError, SweeperHandle};
use crate::domain::decision::{Admission, Denial};
use crate::error::{BoxError, ConfigError, Error};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration of every pipeline component.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub quota: QuotaConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    /// Interval of the quota expiry and rate-window GC sweeps
    pub sweep_interval_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            rate_limit: RateLimitConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            sweep_interval_ms: 60 * 1_000,
        }
    }
}

impl AdmissionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quota.validate()?;
        self.rate_limit.validate()?;
        self.breaker.validate()?;
        self.cache.validate()?;
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "sweep_interval_ms",
            });
        }
        Ok(())
    }
}

/// Keys identifying one inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdmissionRequest {
    /// Key charged against the daily quota (device id, user id)
    pub accounting_key: String,
    /// Key for the short-window rate limit (IP, API key)
    pub admission_key: String,
}

impl AdmissionRequest {
    pub fn new(accounting_key: impl Into<String>, admission_key: impl Into<String>) -> Self {
        Self {
            accounting_key: accounting_key.into(),
            admission_key: admission_key.into(),
        }
    }

    /// Use one key for both quota and rate limit.
    pub fn for_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            accounting_key: key.clone(),
            admission_key: key,
        }
    }
}

/// Aggregated snapshot for a monitoring endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub quota: QuotaStats,
    pub rate_limit: LimiterStats,
    pub breaker: BreakerSnapshot,
    pub cache: CacheStats,
}

/// Composes the admission components in front of one downstream dependency.
pub struct AdmissionPipeline<T> {
    quota: Arc<QuotaLedger>,
    limiter: Arc<SlidingWindowLimiter>,
    breaker: Arc<CircuitBreaker>,
    cache: ResultCache<T>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    sweepers: Mutex<Vec<SweeperHandle>>,
}

impl<T> AdmissionPipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Assemble a pipeline from existing components.
    pub fn new(
        quota: Arc<QuotaLedger>,
        limiter: Arc<SlidingWindowLimiter>,
        breaker: Arc<CircuitBreaker>,
        cache: ResultCache<T>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            quota,
            limiter,
            breaker,
            cache,
            clock,
            sweep_interval: AdmissionConfig::default().sweep_interval(),
            sweepers: Mutex::new(Vec::new()),
        }
    }

    /// Build every component from one configuration, sharing `clock`.
    pub fn from_config(config: &AdmissionConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut pipeline = Self::new(
            Arc::new(QuotaLedger::new(config.quota.clone(), Arc::clone(&clock))?),
            Arc::new(SlidingWindowLimiter::new(
                config.rate_limit.clone(),
                Arc::clone(&clock),
            )?),
            Arc::new(CircuitBreaker::new(config.breaker.clone(), Arc::clone(&clock))?),
            ResultCache::new(config.cache.clone(), Arc::clone(&clock))?,
            clock,
        );
        pipeline.sweep_interval = config.sweep_interval();
        Ok(pipeline)
    }

    /// Run quota, rate limit and breaker checks for `request`.
    ///
    /// A request refused after the quota was charged gets its quota unit
    /// back, since no downstream call is made for it.
    pub fn admit(&self, request: &AdmissionRequest) -> Admission {
        let quota = self.quota.consume(&request.accounting_key);
        if !quota.allowed {
            let retry_after = quota.retry_after_seconds(self.clock.utc_now()) as f64;
            return self.deny(
                request,
                Denial::new(
                    Error::QuotaExceeded {
                        reset_at: quota.reset_at,
                    },
                    Some(retry_after),
                ),
            );
        }

        let rate = self.limiter.consume(&request.admission_key);
        if !rate.allowed {
            self.quota.refund(&request.accounting_key);
            return self.deny(
                request,
                Denial::new(
                    Error::RateLimited {
                        retry_after_seconds: rate.retry_after_seconds,
                    },
                    Some(rate.retry_after_seconds),
                ),
            );
        }

        if !self.breaker.can_request() {
            self.quota.refund(&request.accounting_key);
            return self.deny(
                request,
                Denial::new(
                    Error::DependencyUnavailable {
                        dependency: self.breaker.name().to_string(),
                    },
                    None,
                ),
            );
        }

        Admission::Admitted
    }

    /// Admit `request`, then serve `cache_key` from the cache or `compute`.
    ///
    /// The outcome of `compute` (including a panic) is reported to the
    /// breaker. A request answered without running its own `compute` (cache
    /// hit or coalesced wait) reports nothing, and hands a half-open trial
    /// back to the breaker.
    pub async fn execute<F, Fut, E>(
        &self,
        request: &AdmissionRequest,
        cache_key: &str,
        compute: F,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.admit(request).into_result()?;

        let breaker = Arc::clone(&self.breaker);
        let ran = Arc::new(AtomicBool::new(false));
        let started = Arc::clone(&ran);
        let outcome = self
            .cache
            .get_or_compute(cache_key, move || async move {
                started.store(true, Ordering::Release);
                match AssertUnwindSafe(async move { compute().await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(value)) => {
                        breaker.record_success();
                        Ok(value)
                    }
                    Ok(Err(err)) => {
                        breaker.record_failure();
                        Err(err)
                    }
                    Err(panic) => {
                        breaker.record_failure();
                        std::panic::resume_unwind(panic)
                    }
                }
            })
            .await;

        if !ran.load(Ordering::Acquire) {
            self.breaker.release_trial();
        }
        outcome
    }

    /// Like [`execute`](Self::execute), but answers with `fallback()` when
    /// the breaker is open.
    pub async fn execute_or_fallback<F, Fut, E, D>(
        &self,
        request: &AdmissionRequest,
        cache_key: &str,
        compute: F,
        fallback: D,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        D: FnOnce() -> T,
    {
        match self.execute(request, cache_key, compute).await {
            Err(Error::DependencyUnavailable { dependency }) => {
                tracing::debug!(dependency = %dependency, "serving fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            quota: self.quota.stats(),
            rate_limit: self.limiter.stats(),
            breaker: self.breaker.snapshot(),
            cache: self.cache.stats(),
        }
    }

    /// Start the quota, rate-window and cache sweeps.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_sweepers(&self) -> Result<(), ConfigError> {
        let handles = vec![
            self.quota.start_sweeper(self.sweep_interval)?,
            self.limiter.start_sweeper(self.sweep_interval)?,
            self.cache.start_sweeper()?,
        ];
        self.sweepers.lock().extend(handles);
        Ok(())
    }

    /// Stop every sweep and abort computations still in flight.
    ///
    /// Stops all sweepers even if one fails, and returns the first failure.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let handles: Vec<SweeperHandle> = self.sweepers.lock().drain(..).collect();
        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                tracing::error!(error = %e, "sweeper did not stop cleanly");
                first_error.get_or_insert(e);
            }
        }
        self.cache.stop();
        first_error.map_or(Ok(()), Err)
    }

    pub fn quota(&self) -> &Arc<QuotaLedger> {
        &self.quota
    }

    pub fn limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cache(&self) -> &ResultCache<T> {
        &self.cache
    }

    fn deny(&self, request: &AdmissionRequest, denial: Denial) -> Admission {
        tracing::debug!(
            accounting_key = %request.accounting_key,
            admission_key = %request.admission_key,
            reason = %denial.reason,
            "request denied"
        );
        Admission::Denied(denial)
    }
}

impl<T> std::fmt::Debug for AdmissionPipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("quota", &self.quota)
            .field("limiter", &self.limiter)
            .field("breaker", &self.breaker)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::circuit_breaker::CircuitState;
    use crate::error::ReasonCode;
    use crate::infrastructure::mocks::MockClock;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn noon() -> MockClock {
        MockClock::new(Instant::now()).with_utc(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap())
    }

    fn config() -> AdmissionConfig {
        AdmissionConfig {
            quota: QuotaConfig::new(3),
            rate_limit: RateLimitConfig::new(2, Duration::from_secs(60)),
            breaker: CircuitBreakerConfig::new("llm")
                .with_consecutive_failures(2)
                .with_cooldown(Duration::from_secs(30)),
            cache: CacheConfig::new(Duration::from_secs(300), 100),
            ..AdmissionConfig::default()
        }
    }

    fn pipeline(clock: &MockClock) -> AdmissionPipeline<String> {
        AdmissionPipeline::from_config(&config(), Arc::new(clock.clone())).unwrap()
    }

    fn reason(admission: Admission) -> Option<ReasonCode> {
        match admission {
            Admission::Admitted => None,
            Admission::Denied(denial) => Some(denial.reason),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock = noon();
        let mut config = config();
        config.sweep_interval_ms = 0;
        assert!(AdmissionPipeline::<String>::from_config(&config, Arc::new(clock)).is_err());
    }

    #[test]
    fn test_rate_denial_refunds_quota() {
        let clock = noon();
        let pipeline = pipeline(&clock);
        let request = AdmissionRequest::for_key("device-1");

        assert!(pipeline.admit(&request).is_admitted());
        assert!(pipeline.admit(&request).is_admitted());
        assert_eq!(reason(pipeline.admit(&request)), Some(ReasonCode::RateLimited));
        assert_eq!(pipeline.quota().usage("device-1").used, 2);

        clock.advance(Duration::from_secs(61));
        assert!(pipeline.admit(&request).is_admitted());
        assert_eq!(reason(pipeline.admit(&request)), Some(ReasonCode::QuotaExceeded));
    }

    #[test]
    fn test_quota_denial_skips_limiter() {
        let clock = noon();
        let pipeline = pipeline(&clock);

        for i in 0..3 {
            let request = AdmissionRequest::new("device-1", format!("ip-{i}"));
            assert!(pipeline.admit(&request).is_admitted());
        }
        let denied = pipeline.admit(&AdmissionRequest::new("device-1", "ip-9"));
        match denied {
            Admission::Denied(denial) => {
                assert_eq!(denial.reason, ReasonCode::QuotaExceeded);
                assert!(denial.reset_at.is_some());
                assert!(denial.retry_after_seconds.unwrap() > 0.0);
            }
            Admission::Admitted => panic!("expected quota denial"),
        }
        assert_eq!(pipeline.limiter().peek("ip-9"), 0.0);
    }

    #[tokio::test]
    async fn test_execute_caches_and_reports_to_breaker() {
        let clock = noon();
        let pipeline = pipeline(&clock);
        let calls = Arc::new(AtomicUsize::new(0));

        for i in 0..2 {
            let calls = Arc::clone(&calls);
            let value = pipeline
                .execute(&AdmissionRequest::for_key(format!("user-{i}")), "prompt-hash", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>("labels".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "labels");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = pipeline.stats();
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(stats.breaker.total_requests_in_sample, 1);
    }

    #[tokio::test]
    async fn test_failures_open_breaker_and_fallback_is_served() {
        let clock = noon();
        let pipeline = pipeline(&clock);

        for i in 0..2 {
            let err = pipeline
                .execute(&AdmissionRequest::for_key(format!("user-{i}")), &format!("k{i}"), || async {
                    Err::<String, _>("provider returned 500")
                })
                .await
                .unwrap_err();
            assert_eq!(err.reason(), ReasonCode::ComputationFailed);
        }

        let err = pipeline
            .execute(&AdmissionRequest::for_key("user-3"), "k3", || async {
                Ok::<_, BoxError>("unreachable".to_string())
            })
            .await
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::DependencyUnavailable);
        // The breaker denial does not cost quota
        assert_eq!(pipeline.quota().usage("user-3").used, 0);

        let value = pipeline
            .execute_or_fallback(
                &AdmissionRequest::for_key("user-4"),
                "k4",
                || async { Ok::<_, BoxError>("unreachable".to_string()) },
                || "degraded".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(value, "degraded");
    }

    #[tokio::test]
    async fn test_cache_hit_while_half_open_frees_the_trial() {
        let clock = noon();
        let pipeline = pipeline(&clock);
        pipeline.cache().set("cached", "labels".to_string());
        for i in 0..2 {
            let _ = pipeline
                .execute(&AdmissionRequest::for_key(format!("user-{i}")), &format!("k{i}"), || async {
                    Err::<String, _>("provider returned 500")
                })
                .await;
        }
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);
        clock.advance(Duration::from_secs(30));

        let value = pipeline
            .execute(&AdmissionRequest::for_key("user-2"), "cached", || async {
                Ok::<_, BoxError>("unused".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "labels");
        assert_eq!(pipeline.breaker().state(), CircuitState::HalfOpen);

        // The next request gets the trial instead of waiting another cooldown
        let value = pipeline
            .execute(&AdmissionRequest::for_key("user-3"), "fresh", || async {
                Ok::<_, BoxError>("recovered".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "recovered");
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_panicking_compute_counts_as_failure() {
        let clock = noon();
        let pipeline = pipeline(&clock);

        let err = pipeline
            .execute(&AdmissionRequest::for_key("user"), "k", || async {
                if true {
                    panic!("malformed response");
                }
                Ok::<String, BoxError>(String::new())
            })
            .await
            .unwrap_err();

        assert_eq!(err.reason(), ReasonCode::ComputationFailed);
        assert_eq!(pipeline.breaker().consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweepers_start_and_shut_down() {
        let clock = noon();
        let pipeline = pipeline(&clock);

        pipeline.start_sweepers().unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        pipeline.shutdown().await.unwrap();
        // Idempotent
        pipeline.shutdown().await.unwrap();
    }

    #[test]
    fn test_stats_serialize() {
        let clock = noon();
        let pipeline = pipeline(&clock);
        pipeline.admit(&AdmissionRequest::for_key("k"));

        let json = serde_json::to_value(pipeline.stats()).unwrap();
        assert_eq!(json["quota"]["allowed"], 1);
        assert_eq!(json["rate_limit"]["allowed"], 1);
        assert_eq!(json["breaker"]["state"], "CLOSED");
        assert_eq!(json["cache"]["size"], 0);
    }
}
