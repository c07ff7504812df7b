//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Candidate entry for eviction consideration.
#[derive(Debug, Clone)]
pub struct EvictionCandidate<K> {
    /// The key of the entry
    pub key: K,
    /// Last read or write of the entry
    pub last_access: Instant,
    /// When the entry was stored
    pub inserted_at: Instant,
}

/// Port for eviction policy decisions.
///
/// The cache delegates the choice of victim to a pluggable policy.
/// Infrastructure provides concrete implementations (`LruEviction`,
/// `OldestInsertedEviction`).
pub trait EvictionPolicy<K>: Send + Sync + Debug
where
    K: Clone,
{
    /// Select a victim from the given candidates, or `None` to skip eviction.
    fn select_victim(&self, candidates: &[EvictionCandidate<K>]) -> Option<K>;

    /// Check if eviction should be triggered before storing one more entry.
    fn should_evict(&self, current_entries: usize) -> bool;
}

/// Port for obtaining current time.
///
/// `now` drives every window, cooldown and TTL. `utc_now` is only used
/// where calendar boundaries matter (quota resets, status timestamps).
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current monotonic instant.
    fn now(&self) -> Instant;

    /// Get the current wall-clock time in UTC.
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Port for concurrent key-value storage.
///
/// Every operation that takes a key locks only that key's shard.
/// Infrastructure provides concrete implementations (ShardedStorage).
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Access an entry with mutable access, creating it if necessary.
    ///
    /// # Arguments
    /// * `key` - The key to look up
    /// * `factory` - Function to create a new value if the key doesn't exist
    /// * `accessor` - Function that gets mutable access to the value
    ///
    /// # Returns
    /// The result from the accessor function
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R;

    /// Read an existing entry without creating it.
    fn read<F, R>(&self, key: &K, reader: F) -> Option<R>
    where
        F: FnOnce(&V) -> R;

    /// Get the number of entries in the storage.
    fn len(&self) -> usize;

    /// Check if the storage is empty.
    fn is_empty(&self) -> bool;

    /// Iterate over all entries, providing access to both key and value.
    fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &V);

    /// Remove entries for which the predicate returns false.
    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool;
}

/// Port for an external counter store shared by several limiter instances.
///
/// Counters are bucketed by fixed window index (`unix_ms / window_ms`).
/// Increments are at-least-once: a retried call may count twice, which only
/// makes the limiter stricter.
pub trait SharedCounterStore: Send + Sync + Debug {
    /// Counts of the `index` window and the one before it, as `(current, previous)`.
    fn window_counts(&self, key: &str, index: u64) -> Result<(u64, u64), StoreError>;

    /// Increment the `index` window counter, expiring it after `ttl`.
    ///
    /// Returns the new count.
    fn increment(&self, key: &str, index: u64, ttl: Duration) -> Result<u64, StoreError>;
}
