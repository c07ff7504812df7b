//! Application layer - the admission components and their composition.
//!
//! This layer coordinates the domain logic and owns all runtime state:
//! - Quota ledger (daily allowance per accounting key)
//! - Sliding-window rate limiter (short-window admission per key)
//! - Circuit breaker (fast failure for an unhealthy dependency)
//! - Result cache (TTL entries with coalesced computations)
//! - Staged job tracker (multi-phase work with deadlines)
//! - Admission pipeline (the components in request order)
//! - Sweeper (background expiry for all of the above)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod cache;
pub mod circuit_breaker;
pub mod jobs;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod ports;
pub mod quota;
pub mod sweeper;
