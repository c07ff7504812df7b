//! In-memory shared counter store for testing.

use crate::application::ports::SharedCounterStore;
use crate::error::StoreError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counter store that lives in process memory and can be switched offline.
///
/// Clones share state, so several limiters built on clones of one store
/// behave like instances behind one Redis.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCounterStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: DashMap<(String, u64), u64>,
    unavailable: AtomicBool,
    calls: AtomicU64,
}

impl InMemoryCounterStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (`true`) or succeed again (`false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of store calls made, including failed ones.
    pub fn calls(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Current value of one window counter.
    pub fn count(&self, key: &str, index: u64) -> u64 {
        self.inner
            .counters
            .get(&(key.to_string(), index))
            .map(|c| *c)
            .unwrap_or(0)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

impl SharedCounterStore for InMemoryCounterStore {
    fn window_counts(&self, key: &str, index: u64) -> Result<(u64, u64), StoreError> {
        self.check()?;
        let previous = index.checked_sub(1).map_or(0, |p| self.count(key, p));
        Ok((self.count(key, index), previous))
    }

    fn increment(&self, key: &str, index: u64, _ttl: Duration) -> Result<u64, StoreError> {
        self.check()?;
        let mut counter = self
            .inner
            .counters
            .entry((key.to_string(), index))
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_window() {
        let store = InMemoryCounterStore::new();
        store.increment("k", 10, Duration::from_secs(1)).unwrap();
        store.increment("k", 10, Duration::from_secs(1)).unwrap();
        store.increment("k", 11, Duration::from_secs(1)).unwrap();

        assert_eq!(store.window_counts("k", 11).unwrap(), (1, 2));
        assert_eq!(store.window_counts("k", 0).unwrap(), (0, 0));
    }

    #[test]
    fn test_unavailable_toggle() {
        let store = InMemoryCounterStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.increment("k", 1, Duration::from_secs(1)),
            Err(StoreError::Unavailable(_))
        ));

        store.set_unavailable(false);
        assert_eq!(store.increment("k", 1, Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(store.calls(), 2);
    }
}
