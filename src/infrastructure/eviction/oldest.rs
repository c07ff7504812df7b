//! Oldest-inserted (FIFO) eviction adapter.

use crate::application::ports::{EvictionCandidate, EvictionPolicy};

/// Evicts the entry stored longest ago, ignoring reads.
#[derive(Debug, Clone)]
pub struct OldestInsertedEviction {
    max_entries: usize,
}

impl OldestInsertedEviction {
    /// Create a new FIFO eviction policy with the given entry limit.
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }
}

impl<K> EvictionPolicy<K> for OldestInsertedEviction
where
    K: Clone,
{
    fn select_victim(&self, candidates: &[EvictionCandidate<K>]) -> Option<K> {
        candidates
            .iter()
            .min_by_key(|candidate| candidate.inserted_at)
            .map(|candidate| candidate.key.clone())
    }

    fn should_evict(&self, current_entries: usize) -> bool {
        current_entries >= self.max_entries
    }
}
