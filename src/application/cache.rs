//! TTL result cache with in-flight request coalescing.
//!
//! Every key maps to a single [`Slot`]: either a ready value or a pending
//! computation. Because both live in the same map, the miss -> pending and
//! pending -> ready transitions happen under the key's shard lock, so at
//! most one computation per key is ever outstanding.
//!
//! Computations run in their own tokio task. A caller that stops awaiting
//! (client disconnect, timeout) does not cancel the work; the other callers
//! coalesced onto it still receive the outcome, and a success is still
//! stored. Invalidating or clearing a key that is still computing only
//! marks the computation: later callers keep joining it, and its value is
//! handed out but not stored.

use crate::application::metrics::{CacheMetrics, CacheStats};
use crate::application::ports::{Clock, EvictionCandidate, EvictionPolicy, Storage};
use crate::application::sweeper::{Sweeper, SweeperHandle};
use crate::error::{panic_message, BoxError, ConfigError, Error};
use crate::infrastructure::eviction::LruEviction;
use crate::infrastructure::storage::ShardedStorage;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;

/// Configuration for a result cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a stored value
    pub ttl_ms: u64,
    /// Ready entries kept before the eviction policy runs
    pub max_entries: usize,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1_000,
            max_entries: 1_000,
            sweep_interval_ms: 60 * 1_000,
        }
    }
}

impl CacheConfig {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            max_entries,
            ..Self::default()
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_ms == 0 {
            return Err(ConfigError::Zero { field: "ttl_ms" });
        }
        if self.max_entries == 0 {
            return Err(ConfigError::Zero {
                field: "max_entries",
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "sweep_interval_ms",
            });
        }
        Ok(())
    }
}

/// Kind of a cache usage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEventKind {
    Hit,
    Miss,
    /// The caller joined a computation already in flight
    Coalesced,
    Set,
    Evicted,
    Expired,
}

impl CacheEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEventKind::Hit => "hit",
            CacheEventKind::Miss => "miss",
            CacheEventKind::Coalesced => "coalesced",
            CacheEventKind::Set => "set",
            CacheEventKind::Evicted => "evicted",
            CacheEventKind::Expired => "expired",
        }
    }
}

/// A structured cache usage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheEvent<'a> {
    pub kind: CacheEventKind,
    pub key: &'a str,
}

/// Callback receiving every [`CacheEvent`].
///
/// Called synchronously, sometimes while a shard lock is held: it must not
/// call back into the cache.
pub type CacheEventListener = Arc<dyn Fn(&CacheEvent<'_>) + Send + Sync>;

type SharedCompute<T> = Shared<BoxFuture<'static, Result<T, Error>>>;

struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
    expires_at: Instant,
    last_access: Instant,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

enum Slot<T> {
    Ready(CacheEntry<T>),
    Pending {
        round: u64,
        future: SharedCompute<T>,
        abort: AbortHandle,
        /// Set by invalidate or clear: the value must not be stored
        discard: bool,
    },
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Ready(entry) => f
                .debug_struct("Ready")
                .field("stored_at", &entry.stored_at)
                .field("expires_at", &entry.expires_at)
                .finish_non_exhaustive(),
            Slot::Pending { round, discard, .. } => f
                .debug_struct("Pending")
                .field("round", round)
                .field("discard", discard)
                .finish_non_exhaustive(),
        }
    }
}

enum Lookup<T> {
    Hit(T),
    Join(SharedCompute<T>),
    Start,
}

struct CacheInner<T> {
    slots: ShardedStorage<String, Slot<T>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    eviction: Arc<dyn EvictionPolicy<String>>,
    listener: Option<CacheEventListener>,
    metrics: CacheMetrics,
    rounds: AtomicU64,
    /// Number of `Slot::Ready` entries, only changed under the key's shard lock
    ready: AtomicUsize,
}

/// Builder for a [`ResultCache`] with a custom eviction policy or listener.
pub struct ResultCacheBuilder {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    eviction: Option<Arc<dyn EvictionPolicy<String>>>,
    listener: Option<CacheEventListener>,
}

impl ResultCacheBuilder {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            eviction: None,
            listener: None,
        }
    }

    /// Replace the default LRU policy.
    pub fn eviction_policy(mut self, policy: Arc<dyn EvictionPolicy<String>>) -> Self {
        self.eviction = Some(policy);
        self
    }

    pub fn listener(mut self, listener: CacheEventListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build<T>(self) -> Result<ResultCache<T>, ConfigError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.config.validate()?;
        let eviction = self
            .eviction
            .unwrap_or_else(|| Arc::new(LruEviction::new(self.config.max_entries)));
        Ok(ResultCache {
            inner: Arc::new(CacheInner {
                slots: ShardedStorage::new(),
                config: self.config,
                clock: self.clock,
                eviction,
                listener: self.listener,
                metrics: CacheMetrics::new(),
                rounds: AtomicU64::new(0),
                ready: AtomicUsize::new(0),
            }),
        })
    }
}

/// TTL cache whose misses are computed at most once per key at a time.
///
/// Cloning is cheap and clones share the same entries.
pub struct ResultCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for ResultCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ResultCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cache with LRU eviction and no listener.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        ResultCacheBuilder::new(config, clock).build()
    }

    /// Fresh value for `key`, if any. Never starts a computation.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = self.inner.clock.now();
        let mut expired = false;
        let value = self.inner.slots.get_mut(key).and_then(|mut slot| match &mut *slot {
            Slot::Ready(entry) if entry.is_fresh(now) => {
                entry.last_access = now;
                Some(entry.value.clone())
            }
            Slot::Ready(_) => {
                expired = true;
                None
            }
            Slot::Pending { .. } => None,
        });

        if expired {
            self.inner.drop_expired(key, now);
        }
        match value {
            Some(value) => {
                self.inner.record(CacheEventKind::Hit, key);
                Some(value)
            }
            None => {
                self.inner.record(CacheEventKind::Miss, key);
                None
            }
        }
    }

    /// Store `value` under `key` for one TTL.
    ///
    /// A computation in flight for `key` still resolves its own callers, but
    /// will not overwrite this value.
    pub fn set(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        self.inner.make_room(&key);
        let now = self.inner.clock.now();
        let entry = Slot::Ready(self.inner.new_entry(value, now));
        match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Slot::Pending { .. } = occupied.insert(entry) {
                    self.inner.ready.fetch_add(1, Ordering::Relaxed);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                self.inner.ready.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.inner.record(CacheEventKind::Set, &key);
    }

    /// Return the fresh value for `key`, or compute it.
    ///
    /// Concurrent callers for the same key share a single invocation of
    /// `compute` and all receive the same value or the same error. Errors are
    /// not cached; a panic inside `compute` becomes
    /// [`Error::ComputationFailed`].
    ///
    /// Must be called from within a tokio runtime.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let now = self.inner.clock.now();
        let future = match self.inner.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let lookup = match occupied.get_mut() {
                    Slot::Ready(entry) if entry.is_fresh(now) => {
                        entry.last_access = now;
                        Lookup::Hit(entry.value.clone())
                    }
                    Slot::Ready(_) => Lookup::Start,
                    Slot::Pending { future, .. } => Lookup::Join(future.clone()),
                };
                match lookup {
                    Lookup::Hit(value) => {
                        drop(occupied);
                        self.inner.record(CacheEventKind::Hit, key);
                        return Ok(value);
                    }
                    Lookup::Join(future) => {
                        drop(occupied);
                        self.inner.record(CacheEventKind::Coalesced, key);
                        future
                    }
                    Lookup::Start => {
                        let (slot, future) = self.launch(key, compute);
                        occupied.insert(slot);
                        self.inner.ready.fetch_sub(1, Ordering::Relaxed);
                        self.inner.record(CacheEventKind::Expired, key);
                        self.inner.record(CacheEventKind::Miss, key);
                        future
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (slot, future) = self.launch(key, compute);
                vacant.insert(slot);
                self.inner.record(CacheEventKind::Miss, key);
                future
            }
        };

        future.await
    }

    /// Remove the value stored under `key`.
    ///
    /// A computation in flight for `key` keeps coalescing callers, but its
    /// value will not be stored. Returns whether there was anything to drop.
    pub fn invalidate(&self, key: &str) -> bool {
        let Entry::Occupied(mut occupied) = self.inner.slots.entry(key.to_string()) else {
            return false;
        };
        if let Slot::Pending { discard, .. } = occupied.get_mut() {
            *discard = true;
            return true;
        }
        occupied.remove();
        self.inner.ready.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Remove every stored value. Computations in flight still resolve their
    /// callers but are no longer stored.
    pub fn clear(&self) {
        Storage::retain(&self.inner.slots, |_, slot| match slot {
            Slot::Ready(_) => {
                self.inner.ready.fetch_sub(1, Ordering::Relaxed);
                false
            }
            Slot::Pending { discard, .. } => {
                *discard = true;
                true
            }
        });
    }

    /// Number of ready entries, fresh or not yet swept.
    pub fn len(&self) -> usize {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut expired = Vec::new();
        Storage::retain(&self.inner.slots, |key, slot| match slot {
            Slot::Ready(entry) if !entry.is_fresh(now) => {
                self.inner.ready.fetch_sub(1, Ordering::Relaxed);
                expired.push(key.clone());
                false
            }
            _ => true,
        });
        self.inner.metrics.record_expirations(expired.len());
        for key in &expired {
            self.inner.emit(CacheEventKind::Expired, key);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.snapshot(self.len())
    }

    /// Start a background task running [`purge_expired`](Self::purge_expired)
    /// every `sweep_interval_ms`.
    pub fn start_sweeper(&self) -> Result<SweeperHandle, ConfigError> {
        let inner: Weak<CacheInner<T>> = Arc::downgrade(&self.inner);
        Ok(Sweeper::new("cache-expiry", self.inner.config.sweep_interval())?.start(move || {
            inner
                .upgrade()
                .map_or(0, |inner| ResultCache { inner }.purge_expired())
        }))
    }

    /// Abort every computation in flight and drop its slot.
    ///
    /// Callers still awaiting an aborted computation receive
    /// [`Error::ComputationFailed`]. Ready entries are kept.
    pub fn stop(&self) {
        let mut aborted = Vec::new();
        Storage::retain(&self.inner.slots, |_, slot| match slot {
            Slot::Pending { abort, .. } => {
                aborted.push(abort.clone());
                false
            }
            Slot::Ready(_) => true,
        });
        if !aborted.is_empty() {
            tracing::debug!(target: "tollgate::cache", count = aborted.len(), "aborting in-flight computations");
        }
        for abort in aborted {
            abort.abort();
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Spawn the computation and build the slot that tracks it.
    fn launch<F, Fut, E>(&self, key: &str, compute: F) -> (Slot<T>, SharedCompute<T>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let round = self.inner.rounds.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_key = key.to_string();

        let task = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(async move { compute().await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(Error::computation(err)),
                Err(payload) => Err(Error::ComputationFailed {
                    message: format!("computation panicked: {}", panic_message(payload.as_ref())),
                }),
            };
            match &outcome {
                Ok(value) => inner.store_computed(&task_key, round, value.clone()),
                Err(err) => {
                    tracing::debug!(target: "tollgate::cache", key = %task_key, error = %err, "computation failed, not cached");
                    inner.release(&task_key, round);
                }
            }
            outcome
        });

        let abort = task.abort_handle();
        let inner = Arc::clone(&self.inner);
        let joined_key = key.to_string();
        let future = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    inner.release(&joined_key, round);
                    Err(Error::ComputationFailed {
                        message: if join_error.is_cancelled() {
                            "computation cancelled".to_string()
                        } else {
                            join_error.to_string()
                        },
                    })
                }
            }
        }
        .boxed()
        .shared();

        (
            Slot::Pending {
                round,
                future: future.clone(),
                abort,
                discard: false,
            },
            future,
        )
    }
}

impl<T> CacheInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new_entry(&self, value: T, now: Instant) -> CacheEntry<T> {
        CacheEntry {
            value,
            stored_at: now,
            expires_at: now + self.config.ttl(),
            last_access: now,
        }
    }

    /// Replace the pending slot of `round` with the computed value.
    ///
    /// If the slot was invalidated, cleared or overwritten meanwhile, the
    /// value is only handed to the waiters.
    fn store_computed(&self, key: &str, round: u64, value: T) {
        self.make_room(key);
        let now = self.clock.now();
        let stored = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Pending {
                    round: current,
                    discard,
                    ..
                } if *current == round => {
                    if *discard {
                        occupied.remove();
                        false
                    } else {
                        occupied.insert(Slot::Ready(self.new_entry(value, now)));
                        self.ready.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                }
                _ => false,
            },
            Entry::Vacant(_) => false,
        };
        if stored {
            self.record(CacheEventKind::Set, key);
        }
    }

    /// Drop the pending slot of `round`, if it is still there.
    fn release(&self, key: &str, round: u64) {
        self.slots.remove_if(key, |_, slot| {
            matches!(slot, Slot::Pending { round: current, .. } if *current == round)
        });
    }

    fn drop_expired(&self, key: &str, now: Instant) {
        if self.remove_ready_if(key, |entry| !entry.is_fresh(now)) {
            self.metrics.record_expirations(1);
            self.emit(CacheEventKind::Expired, key);
        }
    }

    /// Remove the ready slot under `key` if `pred` approves it.
    fn remove_ready_if(&self, key: &str, pred: impl Fn(&CacheEntry<T>) -> bool) -> bool {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(occupied) if matches!(occupied.get(), Slot::Ready(entry) if pred(entry)) => {
                occupied.remove();
                self.ready.fetch_sub(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Ready entries other than `incoming`, which would only be replaced.
    fn ready_besides(&self, incoming: &str) -> usize {
        let replaced = matches!(self.slots.get(incoming).as_deref(), Some(Slot::Ready(_)));
        self.ready
            .load(Ordering::Relaxed)
            .saturating_sub(usize::from(replaced))
    }

    /// Evict ready entries until one more can be stored under `incoming`.
    ///
    /// Pending slots are never candidates, and neither is `incoming` itself.
    /// The candidate list is only built once eviction is due.
    fn make_room(&self, incoming: &str) {
        while self.eviction.should_evict(self.ready_besides(incoming)) {
            let candidates: Vec<EvictionCandidate<String>> = self
                .slots
                .iter()
                .filter_map(|slot| match slot.value() {
                    Slot::Ready(entry) if slot.key() != incoming => Some(EvictionCandidate {
                        key: slot.key().clone(),
                        last_access: entry.last_access,
                        inserted_at: entry.stored_at,
                    }),
                    _ => None,
                })
                .collect();

            let Some(victim) = self.eviction.select_victim(&candidates) else {
                return;
            };
            if self.remove_ready_if(&victim, |_| true) {
                self.record(CacheEventKind::Evicted, &victim);
            }
        }
    }

    fn record(&self, kind: CacheEventKind, key: &str) {
        match kind {
            CacheEventKind::Hit => self.metrics.record_hit(),
            CacheEventKind::Miss => self.metrics.record_miss(),
            CacheEventKind::Coalesced => self.metrics.record_coalesced(),
            CacheEventKind::Set => self.metrics.record_set(),
            CacheEventKind::Evicted => self.metrics.record_eviction(),
            CacheEventKind::Expired => self.metrics.record_expirations(1),
        }
        self.emit(kind, key);
    }

    fn emit(&self, kind: CacheEventKind, key: &str) {
        tracing::debug!(target: "tollgate::cache", event = kind.as_str(), key = %key, "cache usage");
        if let Some(listener) = &self.listener {
            listener(&CacheEvent { kind, key });
        }
    }
}

impl<T> std::fmt::Debug for ResultCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.inner.config)
            .field("eviction", &self.inner.eviction)
            .finish_non_exhaustive()
    }
}
