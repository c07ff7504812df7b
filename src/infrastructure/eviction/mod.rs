//! Eviction policy adapters for the result cache.
//!
//! In hexagonal architecture, these are adapters (infrastructure layer)
//! that implement the EvictionPolicy port (application layer).

pub mod lru;
pub mod oldest;

pub use lru::LruEviction;
pub use oldest::OldestInsertedEviction;
