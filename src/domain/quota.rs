//! Calendar-day quota accounting.
//!
//! Quotas reset at the next UTC midnight after an entry is created, not on a
//! rolling 24h window.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// The first instant of the UTC day following `now`.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    match now.date_naive().succ_opt() {
        Some(tomorrow) => Utc.from_utc_datetime(&tomorrow.and_time(NaiveTime::MIN)),
        None => DateTime::<Utc>::MAX_UTC,
    }
}

/// Daily counter for one accounting key.
#[derive(Debug, Clone)]
pub struct QuotaEntry {
    count: u32,
    reset_at: DateTime<Utc>,
    last_seen: Instant,
}

impl QuotaEntry {
    /// Create an empty entry whose period ends at the next UTC midnight.
    pub fn new(utc_now: DateTime<Utc>, now: Instant) -> Self {
        Self {
            count: 0,
            reset_at: next_utc_midnight(utc_now),
            last_seen: now,
        }
    }

    /// Start a new period in place if the current one has ended.
    ///
    /// Returns `true` if the entry was reset.
    pub fn roll_over(&mut self, utc_now: DateTime<Utc>) -> bool {
        if utc_now < self.reset_at {
            return false;
        }
        self.count = 0;
        self.reset_at = next_utc_midnight(utc_now);
        true
    }

    /// Consume one unit if the limit allows it. Never pushes `count` past `limit`.
    pub fn try_consume(&mut self, limit: u32, now: Instant) -> bool {
        self.last_seen = now;
        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }

    /// Give back one unit consumed in the current period.
    pub fn refund(&mut self) {
        self.count = self.count.saturating_sub(1);
    }

    /// Units used in the current period.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Units left in the current period.
    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.count)
    }

    /// End of the current period.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// Whether the period has ended and the key has been idle for `idle`.
    pub fn is_stale(&self, utc_now: DateTime<Utc>, now: Instant, idle: Duration) -> bool {
        utc_now >= self.reset_at && now.saturating_duration_since(self.last_seen) >= idle
    }
}

/// Outcome of a quota consume or check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl QuotaDecision {
    /// Whole seconds until the quota resets, for a `Retry-After` header.
    ///
    /// Zero when the request was allowed.
    pub fn retry_after_seconds(&self, utc_now: DateTime<Utc>) -> u64 {
        if self.allowed {
            return 0;
        }
        let secs = (self.reset_at - utc_now).num_seconds().max(1);
        u64::try_from(secs).unwrap_or(1)
    }
}

/// Read-only usage report for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub used: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}
