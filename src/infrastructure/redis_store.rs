//! Redis-backed shared counter store.
//!
//! Lets several instances of a service share sliding-window counts, so a
//! per-key limit holds approximately across the fleet instead of per process.
//!
//! ## Layout
//!
//! - Keys: `{key_prefix}{admission_key}:{window_index}`
//! - Values: plain integer counters (`INCR`)
//! - TTL: set with `PEXPIRE` on every increment; two windows is enough
//!
//! ## Error Handling
//!
//! Every failure, including calls made outside a multi-threaded tokio runtime
//! and calls exceeding `command_timeout`, is returned as a [`StoreError`].
//! The limiter treats any error as "store unavailable" and fails open to
//! local counting.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tollgate::{RedisCounterStore, RedisCounterStoreConfig, RateLimitConfig, SlidingWindowLimiter, SystemClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RedisCounterStore::connect("redis://127.0.0.1/", RedisCounterStoreConfig::default())
//!         .await
//!         .expect("Failed to connect to Redis");
//!
//!     let limiter = SlidingWindowLimiter::new(RateLimitConfig::default(), Arc::new(SystemClock::new()))
//!         .unwrap()
//!         .with_shared_store(Arc::new(store));
//! }
//! ```

use crate::application::ports::SharedCounterStore;
use crate::error::StoreError;
use redis::aio::ConnectionManager;
use redis::Client;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Configuration for the Redis counter store.
#[derive(Debug, Clone)]
pub struct RedisCounterStoreConfig {
    /// Prefix for every Redis key (default: "tollgate:rl:")
    pub key_prefix: String,
    /// Upper bound on one round trip before the call counts as a failure
    pub command_timeout: Duration,
}

impl Default for RedisCounterStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "tollgate:rl:".to_string(),
            command_timeout: Duration::from_millis(50),
        }
    }
}

/// Shared counter store backed by Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisCounterStoreConfig,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns `StoreError::Unavailable` if the connection cannot be established.
    pub async fn connect(url: &str, config: RedisCounterStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection, config })
    }

    fn redis_key(&self, key: &str, index: u64) -> String {
        format!("{}{}:{}", self.config.key_prefix, key, index)
    }

    /// Run a Redis future from the limiter's synchronous call path.
    ///
    /// `block_in_place` needs a multi-threaded runtime; anywhere else the call
    /// fails instead of blocking or panicking.
    fn block_on<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let handle = Handle::try_current()
            .map_err(|_| StoreError::Unavailable("no tokio runtime on this thread".to_string()))?;
        if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
            return Err(StoreError::Unavailable(
                "redis store requires a multi-threaded tokio runtime".to_string(),
            ));
        }

        let timeout = self.config.command_timeout;
        tokio::task::block_in_place(|| {
            handle.block_on(async {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Unavailable(format!(
                        "redis call exceeded {}ms",
                        timeout.as_millis()
                    ))),
                }
            })
        })
    }
}

impl SharedCounterStore for RedisCounterStore {
    fn window_counts(&self, key: &str, index: u64) -> Result<(u64, u64), StoreError> {
        let current_key = self.redis_key(key, index);
        let previous_key = self.redis_key(key, index.saturating_sub(1));
        let mut conn = self.connection.clone();

        self.block_on(async move {
            let counts: Vec<Option<u64>> = redis::cmd("MGET")
                .arg(&current_key)
                .arg(&previous_key)
                .query_async(&mut conn)
                .await?;
            let counts: Result<(u64, u64), StoreError> = match counts.as_slice() {
                [current, previous] if index > 0 => {
                    Ok((current.unwrap_or(0), previous.unwrap_or(0)))
                }
                [current, _] => Ok((current.unwrap_or(0), 0)),
                other => Err(StoreError::Malformed(format!(
                    "MGET returned {} values, expected 2",
                    other.len()
                ))),
            };
            counts
        })
    }

    fn increment(&self, key: &str, index: u64, ttl: Duration) -> Result<u64, StoreError> {
        let redis_key = self.redis_key(key, index);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.connection.clone();

        self.block_on(async move {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .cmd("INCR")
                .arg(&redis_key)
                .cmd("PEXPIRE")
                .arg(&redis_key)
                .arg(ttl_ms)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok::<_, StoreError>(count)
        })
    }
}
