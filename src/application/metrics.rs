//! Counters behind the stats snapshots of each component.
//!
//! All counters use relaxed atomics: each value is individually exact, but a
//! snapshot taken under concurrent traffic is not a single consistent cut.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Decision counters for a rate limiter or quota ledger.
#[derive(Debug, Clone, Default)]
pub struct AdmissionMetrics {
    inner: Arc<AdmissionMetricsInner>,
}

#[derive(Debug, Default)]
struct AdmissionMetricsInner {
    allowed: AtomicU64,
    denied: AtomicU64,
    degraded: AtomicU64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        bump(&self.inner.allowed);
    }

    pub(crate) fn record_denied(&self) {
        bump(&self.inner.denied);
    }

    /// A decision made locally because the shared store failed.
    pub(crate) fn record_degraded(&self) {
        bump(&self.inner.degraded);
    }

    pub fn allowed(&self) -> u64 {
        read(&self.inner.allowed)
    }

    pub fn denied(&self) -> u64 {
        read(&self.inner.denied)
    }

    pub fn degraded(&self) -> u64 {
        read(&self.inner.degraded)
    }
}

/// Snapshot of a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Keys with local window state
    pub tracked_keys: usize,
    pub allowed: u64,
    pub denied: u64,
    /// Decisions made locally while the shared store was failing
    pub degraded: u64,
}

/// Snapshot of a quota ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaStats {
    pub tracked_keys: usize,
    pub allowed: u64,
    pub denied: u64,
}

/// Usage counters for the result cache.
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    inner: Arc<CacheMetricsInner>,
}

#[derive(Debug, Default)]
struct CacheMetricsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    sets: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        bump(&self.inner.hits);
    }

    pub(crate) fn record_miss(&self) {
        bump(&self.inner.misses);
    }

    pub(crate) fn record_coalesced(&self) {
        bump(&self.inner.coalesced);
    }

    pub(crate) fn record_eviction(&self) {
        bump(&self.inner.evictions);
    }

    pub(crate) fn record_expirations(&self, n: usize) {
        self.inner
            .expirations
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_set(&self) {
        bump(&self.inner.sets);
    }

    /// Get a snapshot of all counters, with the current entry count.
    pub fn snapshot(&self, size: usize) -> CacheStats {
        CacheStats {
            size,
            hits: read(&self.inner.hits),
            misses: read(&self.inner.misses),
            coalesced: read(&self.inner.coalesced),
            evictions: read(&self.inner.evictions),
            expirations: read(&self.inner.expirations),
            sets: read(&self.inner.sets),
        }
    }
}

/// A point-in-time snapshot of the result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Fresh entries currently stored (in-flight computations excluded)
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Callers that joined a computation already in flight
    pub coalesced: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub sets: u64,
}

impl CacheStats {
    /// Fraction of lookups served without starting a computation.
    ///
    /// Coalesced waits count as hits. Returns 0.0 if nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits.saturating_add(self.coalesced);
        let total = served.saturating_add(self.misses);
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

/// Lifecycle counters for the staged job tracker.
#[derive(Debug, Clone, Default)]
pub struct JobMetrics {
    inner: Arc<JobMetricsInner>,
}

#[derive(Debug, Default)]
struct JobMetricsInner {
    total: AtomicU64,
    completed: AtomicU64,
    errored: AtomicU64,
    timed_out: AtomicU64,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_created(&self) {
        bump(&self.inner.total);
    }

    pub(crate) fn record_completed(&self) {
        bump(&self.inner.completed);
    }

    pub(crate) fn record_errored(&self) {
        bump(&self.inner.errored);
    }

    pub(crate) fn record_timed_out(&self) {
        bump(&self.inner.timed_out);
    }

    /// Get a snapshot, with the number of jobs not yet terminal.
    pub fn snapshot(&self, active_requests: usize) -> JobStats {
        JobStats {
            active_requests,
            total_requests: read(&self.inner.total),
            completed: read(&self.inner.completed),
            errored: read(&self.inner.errored),
            timed_out: read(&self.inner.timed_out),
        }
    }
}

/// A point-in-time snapshot of the staged job tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobStats {
    /// Jobs not yet in a terminal stage
    pub active_requests: usize,
    /// Jobs ever created
    pub total_requests: u64,
    pub completed: u64,
    /// Jobs failed by their producer (timeouts excluded)
    pub errored: u64,
    pub timed_out: u64,
}
