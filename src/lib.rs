//! # tollgate
//!
//! Admission control and result caching for expensive, unreliable downstream
//! calls (LLM providers, vision extraction, third-party pricing APIs).
//!
//! A request handler consults tollgate before and after each downstream call.
//! Five components share the bookkeeping, each usable on its own:
//!
//! - [`QuotaLedger`]: a daily allowance per accounting key, reset at UTC midnight
//! - [`SlidingWindowLimiter`]: a trailing-window rate limit per key, with
//!   exponential, jittered retry hints
//! - [`CircuitBreaker`]: stops calling a dependency that keeps failing
//! - [`ResultCache`]: a TTL cache where concurrent misses for one key share a
//!   single computation
//! - [`StagedJobTracker`]: multi-phase jobs with deadlines and completion waiters
//!
//! [`AdmissionPipeline`] runs the first four in request order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tollgate::{AdmissionConfig, AdmissionPipeline, AdmissionRequest, BoxError, SystemClock};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline: AdmissionPipeline<String> =
//!     AdmissionPipeline::from_config(&AdmissionConfig::default(), Arc::new(SystemClock::new()))?;
//! pipeline.start_sweepers()?;
//!
//! let request = AdmissionRequest::new("device-42", "203.0.113.7");
//! let labels = pipeline
//!     .execute_or_fallback(
//!         &request,
//!         "image-sha256:9f86d0",
//!         || async { Ok::<_, BoxError>("cat, sofa".to_string()) },
//!         || "unavailable".to_string(),
//!     )
//!     .await;
//!
//! match labels {
//!     Ok(labels) => println!("labels: {labels}"),
//!     Err(e) if e.reason().is_retryable() => println!("retry later: {}", e.reason()),
//!     Err(e) => println!("failed: {e}"),
//! }
//!
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Decisions, Not Errors
//!
//! Inside the components, a denial is an ordinary value
//! ([`RateDecision`], [`QuotaDecision`]). Only the pipeline boundary turns
//! one into an [`Error`], and every surfaced error carries a stable
//! [`ReasonCode`]:
//!
//! | Code | Raised when |
//! |------|-------------|
//! | `QUOTA_EXCEEDED` | the daily allowance is spent |
//! | `RATE_LIMITED` | the trailing window is full |
//! | `DEPENDENCY_UNAVAILABLE` | the breaker is open |
//! | `COMPUTATION_FAILED` | the protected call failed or panicked |
//! | `TIMEOUT` | a staged job missed its deadline |
//! | `NOT_FOUND` | an unknown job id |
//! | `INVALID_TRANSITION` | a stage update moved backwards or after the end |
//! | `INVALID_CONFIG` | a configuration failed validation |
//!
//! ## Coalescing
//!
//! ```rust,no_run
//! # use tollgate::{BoxError, CacheConfig, ResultCache, SystemClock};
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cache: ResultCache<String> = ResultCache::new(
//!     CacheConfig::new(Duration::from_secs(300), 10_000),
//!     Arc::new(SystemClock::new()),
//! )?;
//!
//! // However many callers ask for this key at once, the closure runs once.
//! let value = cache
//!     .get_or_compute("prompt:1f3a", || async {
//!         Ok::<_, BoxError>("expensive answer".to_string())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! A caller that stops awaiting does not cancel the computation; it keeps
//! running for the other callers and its result is still cached.
//!
//! ## Staged Jobs
//!
//! ```rust,no_run
//! # use tollgate::{JobStage, JobTrackerConfig, StagedJobTracker, SystemClock};
//! # use std::sync::Arc;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let tracker: StagedJobTracker<String> =
//!     StagedJobTracker::new(JobTrackerConfig::default(), Arc::new(SystemClock::new()))?;
//! let job = tracker.create_job();
//!
//! // Producer side
//! tracker.update_stage(job.job_id, JobStage::Processing(1), None)?;
//! tracker.update_stage(job.job_id, JobStage::PhaseDone(1), Some(serde_json::json!({"items": 3})))?;
//! tracker.complete(job.job_id, "priced".to_string())?;
//!
//! // Consumer side
//! let result = tracker.wait_for_completion(job.job_id).await?;
//! assert_eq!(result.as_deref(), Some("priced"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Shared Rate Limits
//!
//! With the `redis-store` feature, [`RedisCounterStore`] lets several
//! instances share limiter windows. Any store failure makes the limiter fall
//! back to local counting and log a warning; requests are never refused
//! because the store is down.
//!
//! ## Background Sweeps
//!
//! Expired quota entries, idle rate windows, expired cache entries and
//! retained jobs are removed by [`Sweeper`] tasks. Dropping a
//! [`SweeperHandle`] aborts its task, so sweeps never keep a runtime alive.

// Domain layer - pure admission logic
pub mod domain;

// Application layer - components and orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

pub mod error;

// Re-export commonly used types for convenience
pub use domain::{
    decision::{Admission, Denial, RateDecision},
    quota::{QuotaDecision, QuotaUsage},
    stage::{JobId, JobStage, ParseStageError},
    window::WindowAlgorithm,
};

pub use application::{
    cache::{
        CacheConfig, CacheEvent, CacheEventKind, CacheEventListener, ResultCache,
        ResultCacheBuilder,
    },
    circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, TripMode},
    jobs::{JobFailure, JobStatus, JobTrackerConfig, StagedJobTracker},
    limiter::{RateLimitConfig, SlidingWindowLimiter},
    metrics::{CacheStats, JobStats, LimiterStats, QuotaStats},
    pipeline::{AdmissionConfig, AdmissionPipeline, AdmissionRequest, PipelineStats},
    ports::{Clock, EvictionCandidate, EvictionPolicy, SharedCounterStore, Storage},
    quota::{QuotaConfig, QuotaLedger},
    sweeper::{ShutdownError, Sweeper, SweeperHandle},
};

pub use error::{BoxError, ConfigError, Error, ReasonCode, StoreError};

pub use infrastructure::{
    clock::SystemClock,
    eviction::{LruEviction, OldestInsertedEviction},
    storage::ShardedStorage,
};

#[cfg(feature = "redis-store")]
pub use infrastructure::redis_store::{RedisCounterStore, RedisCounterStoreConfig};
