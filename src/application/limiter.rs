//! Sliding-window rate limiter.
//!
//! Each limiter instance gates one dimension (IP, API key, device, user) with
//! its own window, limit, backoff and key prefix. Counting is local by
//! default; with a [`SharedCounterStore`] attached, counts are read and
//! written through the store so several processes share one budget.
//!
//! # Fail-Open Behavior
//!
//! Any store error, including a panic inside the store adapter, makes the
//! call fall back to local counting. The first failure of an outage is
//! logged at `warn`, later ones at `debug`, and the first success after it
//! at `info`. `consume` itself never fails.

use crate::application::metrics::{AdmissionMetrics, LimiterStats};
use crate::application::ports::{Clock, SharedCounterStore, Storage};
use crate::application::sweeper::{Sweeper, SweeperHandle};
use crate::domain::decision::RateDecision;
use crate::domain::window::{
    backoff_delay, elapsed_fraction, jitter_factor, weighted_estimate, RateWindowEntry,
    WindowAlgorithm,
};
use crate::error::{panic_message, ConfigError, StoreError};
use crate::infrastructure::storage::ShardedStorage;
use serde::Deserialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for one rate limiter instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of the trailing window
    pub window_ms: u64,
    /// Requests allowed per window
    pub max: u64,
    /// Backoff after the first denial, doubled per consecutive denial
    pub base_backoff_ms: u64,
    /// Upper bound on the backoff before jitter
    pub max_backoff_ms: u64,
    /// Prepended to every key, so limiters can share a store
    pub key_prefix: String,
    pub algorithm: WindowAlgorithm,
    /// Minimum idle time before a key is garbage-collected; never below the window
    pub idle_gc_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max: 60,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            key_prefix: String::new(),
            algorithm: WindowAlgorithm::SlidingLog,
            idle_gc_ms: 0,
        }
    }
}

impl RateLimitConfig {
    /// Allow `max` requests per `window`.
    pub fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self.max_backoff_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_algorithm(mut self, algorithm: WindowAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn idle_after(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(self.idle_gc_ms))
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_ms == 0 {
            return Err(ConfigError::Zero { field: "window_ms" });
        }
        if self.max == 0 {
            return Err(ConfigError::Zero { field: "max" });
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Zero {
                field: "base_backoff_ms",
            });
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::OutOfRange {
                field: "max_backoff_ms",
                detail: format!(
                    "{} is below base_backoff_ms ({})",
                    self.max_backoff_ms, self.base_backoff_ms
                ),
            });
        }
        Ok(())
    }
}

/// Per-key sliding-window limiter with exponential retry backoff.
pub struct SlidingWindowLimiter<S = Arc<ShardedStorage<String, RateWindowEntry>>>
where
    S: Storage<String, RateWindowEntry>,
{
    storage: S,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    shared: Option<Arc<dyn SharedCounterStore>>,
    metrics: AdmissionMetrics,
    degraded: AtomicBool,
}

impl SlidingWindowLimiter {
    /// Create a limiter with local sharded storage.
    ///
    /// # Errors
    /// Returns the first invalid field of `config`.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        Self::with_storage(Arc::new(ShardedStorage::new()), config, clock)
    }
}

impl<S> SlidingWindowLimiter<S>
where
    S: Storage<String, RateWindowEntry>,
{
    /// Create a limiter over custom storage.
    pub fn with_storage(
        storage: S,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            storage,
            clock,
            config,
            shared: None,
            metrics: AdmissionMetrics::new(),
            degraded: AtomicBool::new(false),
        })
    }

    /// Count through a shared store instead of local memory.
    ///
    /// Shared counting always uses weighted counters on windows aligned to
    /// the Unix epoch, so every instance agrees on bucket boundaries.
    pub fn with_shared_store(mut self, store: Arc<dyn SharedCounterStore>) -> Self {
        self.shared = Some(store);
        self
    }

    /// Record one request for `key` if the window allows it.
    pub fn consume(&self, key: &str) -> RateDecision {
        let full_key = self.full_key(key);
        let now = self.clock.now();

        if let Some(store) = &self.shared {
            match self.guarded(|| self.consume_shared(store.as_ref(), &full_key)) {
                Ok(admitted) => {
                    self.mark_recovered();
                    return self.settle(full_key, now, admitted);
                }
                Err(e) => {
                    self.mark_degraded(&e, &full_key);
                    self.metrics.record_degraded();
                }
            }
        }

        self.consume_local(full_key, now)
    }

    /// Current estimate for `key` without recording a request.
    pub fn peek(&self, key: &str) -> f64 {
        let full_key = self.full_key(key);
        if let Some(store) = &self.shared {
            if let Ok(estimate) = self.guarded(|| self.shared_estimate(store.as_ref(), &full_key)) {
                return estimate;
            }
        }
        let now = self.clock.now();
        let window = self.config.window();
        self.storage
            .read(&full_key, RateWindowEntry::clone)
            .map_or(0.0, |mut entry| entry.estimate(now, window))
    }

    /// Drop local state for keys idle past the window. Returns the number removed.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let idle = self.config.idle_after();
        let mut removed = 0;
        self.storage.retain(|_, entry| {
            let keep = !entry.is_idle(now, idle);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Start a background task running [`purge_idle`](Self::purge_idle) every `interval`.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> Result<SweeperHandle, ConfigError>
    where
        S: 'static,
    {
        let limiter = Arc::downgrade(self);
        let name = format!("rate-window-gc:{}", self.config.key_prefix);
        Ok(Sweeper::new(name, interval)?
            .start(move || limiter.upgrade().map_or(0, |l| l.purge_idle())))
    }

    /// Whether the shared store is currently failing.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            tracked_keys: self.storage.len(),
            allowed: self.metrics.allowed(),
            denied: self.metrics.denied(),
            degraded: self.metrics.degraded(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn new_entry(&self, now: Instant) -> RateWindowEntry {
        RateWindowEntry::new(self.config.algorithm, now)
    }

    fn consume_local(&self, full_key: String, now: Instant) -> RateDecision {
        let window = self.config.window();
        let max = self.config.max;
        let (admitted, estimate, violations) = self.storage.with_entry_mut(
            full_key.clone(),
            || self.new_entry(now),
            |entry| {
                let estimate = entry.estimate(now, window);
                let admitted = entry.try_admit(now, window, max);
                (admitted, estimate, entry.consecutive_violations())
            },
        );
        self.decide(&full_key, admitted, estimate, violations)
    }

    /// Read-check-increment against the shared store, outside any local lock.
    ///
    /// Two instances may both pass the check before either increments; the
    /// overshoot is bounded by the number of instances.
    fn consume_shared(
        &self,
        store: &dyn SharedCounterStore,
        full_key: &str,
    ) -> Result<(bool, f64), StoreError> {
        let (index, fraction) = self.shared_window();
        let (current, previous) = store.window_counts(full_key, index)?;
        let estimate = weighted_estimate(current, previous, fraction);
        if estimate + 1.0 > self.config.max as f64 {
            return Ok((false, estimate));
        }
        store.increment(full_key, index, self.config.window() * 2)?;
        Ok((true, estimate))
    }

    fn shared_estimate(&self, store: &dyn SharedCounterStore, full_key: &str) -> Result<f64, StoreError> {
        let (index, fraction) = self.shared_window();
        let (current, previous) = store.window_counts(full_key, index)?;
        Ok(weighted_estimate(current, previous, fraction))
    }

    /// Epoch-aligned window index and the fraction of it already elapsed.
    fn shared_window(&self) -> (u64, f64) {
        let now_ms = u64::try_from(self.clock.utc_now().timestamp_millis()).unwrap_or(0);
        let window_ms = self.config.window_ms;
        let into_window = Duration::from_millis(now_ms % window_ms);
        (
            now_ms / window_ms,
            elapsed_fraction(into_window, self.config.window()),
        )
    }

    fn settle(&self, full_key: String, now: Instant, (admitted, estimate): (bool, f64)) -> RateDecision {
        let violations = self.storage.with_entry_mut(
            full_key.clone(),
            || self.new_entry(now),
            |entry| {
                if admitted {
                    entry.record_admitted(now);
                } else {
                    entry.record_violation();
                }
                entry.consecutive_violations()
            },
        );
        self.decide(&full_key, admitted, estimate, violations)
    }

    fn decide(&self, full_key: &str, admitted: bool, estimate: f64, violations: u32) -> RateDecision {
        if admitted {
            self.metrics.record_allowed();
            return RateDecision::allow(estimate, self.config.max);
        }

        let retry_after = backoff_delay(
            violations,
            Duration::from_millis(self.config.base_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
            jitter_factor(),
        )
        .as_secs_f64();
        self.metrics.record_denied();
        tracing::debug!(
            key = %full_key,
            estimate,
            violations,
            retry_after_seconds = retry_after,
            "rate limited"
        );
        RateDecision::deny(estimate, self.config.max, retry_after)
    }

    /// Run a store operation, turning an adapter panic into a store error.
    fn guarded<T>(&self, op: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
        panic::catch_unwind(AssertUnwindSafe(op)).unwrap_or_else(|payload| {
            Err(StoreError::Unavailable(format!(
                "store adapter panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }

    fn mark_degraded(&self, error: &StoreError, full_key: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                error = %error,
                key = %full_key,
                "shared counter store unavailable, failing open to local counting"
            );
        } else {
            tracing::debug!(error = %error, key = %full_key, "counting locally while store is down");
        }
    }

    fn mark_recovered(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!(prefix = %self.config.key_prefix, "shared counter store recovered");
        }
    }
}

impl<S> std::fmt::Debug for SlidingWindowLimiter<S>
where
    S: Storage<String, RateWindowEntry>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("config", &self.config)
            .field("shared", &self.shared.is_some())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}
