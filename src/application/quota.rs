//! Per-key daily quota ledger.
//!
//! Counts are atomic per key: `consume` does its read-increment-check while
//! holding the key's shard lock, so concurrent calls can never push a key
//! past `daily_limit`. Ledgers are cheap; create one per accounting
//! dimension (per-device feature quota, per-user quota, ...).

use crate::application::metrics::{AdmissionMetrics, QuotaStats};
use crate::application::ports::{Clock, Storage};
use crate::application::sweeper::{Sweeper, SweeperHandle};
use crate::domain::quota::{next_utc_midnight, QuotaDecision, QuotaEntry, QuotaUsage};
use crate::error::ConfigError;
use crate::infrastructure::storage::ShardedStorage;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one quota ledger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub daily_limit: u32,
    pub key_prefix: String,
    /// How long an expired entry must sit unused before the sweep drops it
    pub idle_ttl_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 1_000,
            key_prefix: String::new(),
            idle_ttl_ms: 60 * 60 * 1_000,
        }
    }
}

impl QuotaConfig {
    pub fn new(daily_limit: u32) -> Self {
        Self {
            daily_limit,
            ..Self::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl_ms = u64::try_from(idle_ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daily_limit == 0 {
            return Err(ConfigError::Zero {
                field: "daily_limit",
            });
        }
        Ok(())
    }
}

/// Calendar-day allowance per accounting key.
pub struct QuotaLedger<S = Arc<ShardedStorage<String, QuotaEntry>>>
where
    S: Storage<String, QuotaEntry>,
{
    storage: S,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
    metrics: AdmissionMetrics,
}

impl QuotaLedger {
    /// Create a ledger with local sharded storage.
    pub fn new(config: QuotaConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        Self::with_storage(Arc::new(ShardedStorage::new()), config, clock)
    }
}

impl<S> QuotaLedger<S>
where
    S: Storage<String, QuotaEntry>,
{
    /// Create a ledger over custom storage.
    pub fn with_storage(
        storage: S,
        config: QuotaConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            storage,
            clock,
            config,
            metrics: AdmissionMetrics::new(),
        })
    }

    /// Use one unit of `key`'s daily allowance if any is left.
    pub fn consume(&self, key: &str) -> QuotaDecision {
        let full_key = self.full_key(key);
        let limit = self.config.daily_limit;
        let utc_now = self.clock.utc_now();
        let now = self.clock.now();

        let decision = self.storage.with_entry_mut(
            full_key.clone(),
            || QuotaEntry::new(utc_now, now),
            |entry| {
                entry.roll_over(utc_now);
                let allowed = entry.try_consume(limit, now);
                QuotaDecision {
                    allowed,
                    remaining: entry.remaining(limit),
                    reset_at: entry.reset_at(),
                }
            },
        );

        if decision.allowed {
            self.metrics.record_allowed();
        } else {
            self.metrics.record_denied();
            tracing::debug!(key = %full_key, reset_at = %decision.reset_at, "daily quota exhausted");
        }
        decision
    }

    /// What `consume` would decide, without using anything.
    pub fn check(&self, key: &str) -> QuotaDecision {
        let usage = self.usage(key);
        QuotaDecision {
            allowed: usage.used < usage.limit,
            remaining: usage.limit.saturating_sub(usage.used),
            reset_at: usage.reset_at,
        }
    }

    /// Units used today by `key`.
    ///
    /// An entry whose period has ended reads as fresh.
    pub fn usage(&self, key: &str) -> QuotaUsage {
        let utc_now = self.clock.utc_now();
        let limit = self.config.daily_limit;
        let current = self
            .storage
            .read(&self.full_key(key), |entry| {
                (utc_now < entry.reset_at()).then(|| (entry.count(), entry.reset_at()))
            })
            .flatten();

        let (used, reset_at) = current.unwrap_or_else(|| (0, next_utc_midnight(utc_now)));
        QuotaUsage {
            used,
            limit,
            reset_at,
        }
    }

    /// Return one unit to `key`, for a request admitted here but refused downstream.
    pub fn refund(&self, key: &str) {
        let full_key = self.full_key(key);
        let utc_now = self.clock.utc_now();
        let now = self.clock.now();
        self.storage.with_entry_mut(
            full_key,
            || QuotaEntry::new(utc_now, now),
            |entry| {
                if !entry.roll_over(utc_now) {
                    entry.refund();
                }
            },
        );
    }

    /// Drop entries whose period ended and that have been idle past `idle_ttl_ms`.
    pub fn purge_expired(&self) -> usize {
        let utc_now = self.clock.utc_now();
        let now = self.clock.now();
        let idle = Duration::from_millis(self.config.idle_ttl_ms);
        let mut removed = 0;
        self.storage.retain(|_, entry| {
            let keep = !entry.is_stale(utc_now, now, idle);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Start a background task running [`purge_expired`](Self::purge_expired) every `interval`.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> Result<SweeperHandle, ConfigError>
    where
        S: 'static,
    {
        let ledger = Arc::downgrade(self);
        let name = format!("quota-expiry:{}", self.config.key_prefix);
        Ok(Sweeper::new(name, interval)?
            .start(move || ledger.upgrade().map_or(0, |l| l.purge_expired())))
    }

    pub fn stats(&self) -> QuotaStats {
        QuotaStats {
            tracked_keys: self.storage.len(),
            allowed: self.metrics.allowed(),
            denied: self.metrics.denied(),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

impl<S> std::fmt::Debug for QuotaLedger<S>
where
    S: Storage<String, QuotaEntry>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
