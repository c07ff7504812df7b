//! Error types and stable reason codes.
//!
//! Every error that leaves the crate carries a [`ReasonCode`]: a small,
//! exhaustive set of machine-readable codes that callers can `match` on to
//! build client responses, plus a human-readable `Display` message.

use crate::domain::stage::{JobId, JobStage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Boxed error accepted from compute functions and job producers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Machine-readable reason attached to every surfaced error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Daily quota for the accounting key is spent
    QuotaExceeded,
    /// Short-window rate limit hit
    RateLimited,
    /// Circuit breaker is open for the dependency
    DependencyUnavailable,
    /// The protected computation returned an error or panicked
    ComputationFailed,
    /// A staged job never reached a terminal stage in time
    Timeout,
    /// No such job
    NotFound,
    /// Stage transition would move a job backwards or out of a terminal stage
    InvalidTransition,
    /// Configuration rejected by validation
    InvalidConfig,
}

impl ReasonCode {
    /// The stable string form, e.g. `"RATE_LIMITED"`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
            ReasonCode::ComputationFailed => "COMPUTATION_FAILED",
            ReasonCode::Timeout => "TIMEOUT",
            ReasonCode::NotFound => "NOT_FOUND",
            ReasonCode::InvalidTransition => "INVALID_TRANSITION",
            ReasonCode::InvalidConfig => "INVALID_CONFIG",
        }
    }

    /// Whether a client may retry the same request later.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReasonCode::QuotaExceeded
                | ReasonCode::RateLimited
                | ReasonCode::DependencyUnavailable
                | ReasonCode::Timeout
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the admission core.
///
/// `Clone` so that every caller coalesced onto one computation, and every
/// waiter on one job, receives its own copy of the same outcome.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("daily quota exhausted, resets at {reset_at}")]
    QuotaExceeded { reset_at: DateTime<Utc> },

    #[error("rate limited, retry after {retry_after_seconds:.2}s")]
    RateLimited { retry_after_seconds: f64 },

    #[error("dependency `{dependency}` is unavailable (circuit open)")]
    DependencyUnavailable { dependency: String },

    #[error("computation failed: {message}")]
    ComputationFailed { message: String },

    #[error("job {job_id} timed out after {}ms", .timeout.as_millis())]
    Timeout { job_id: JobId, timeout: Duration },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStage,
        to: JobStage,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Wrap an arbitrary failure from a compute function or producer.
    pub fn computation(err: impl Into<BoxError>) -> Self {
        Error::ComputationFailed {
            message: err.into().to_string(),
        }
    }

    /// The reason code for this error.
    pub fn reason(&self) -> ReasonCode {
        match self {
            Error::QuotaExceeded { .. } => ReasonCode::QuotaExceeded,
            Error::RateLimited { .. } => ReasonCode::RateLimited,
            Error::DependencyUnavailable { .. } => ReasonCode::DependencyUnavailable,
            Error::ComputationFailed { .. } => ReasonCode::ComputationFailed,
            Error::Timeout { .. } => ReasonCode::Timeout,
            Error::JobNotFound(_) => ReasonCode::NotFound,
            Error::InvalidTransition { .. } => ReasonCode::InvalidTransition,
            Error::Config(_) => ReasonCode::InvalidConfig,
        }
    }
}

/// Error returned when a component configuration fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A size, count or duration that must be positive was zero
    #[error("{field} must be greater than 0")]
    Zero { field: &'static str },

    /// A value outside its accepted range
    #[error("{field} is out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },
}

/// Error reported by a shared counter store.
///
/// Never reaches callers of the limiter: any store error makes the limiter
/// fall back to local counting.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("backing store returned malformed data: {0}")]
    Malformed(String),
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() || e.is_io_error() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Malformed(e.to_string())
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_are_stable_strings() {
        assert_eq!(ReasonCode::QuotaExceeded.as_str(), "QUOTA_EXCEEDED");
        assert_eq!(ReasonCode::Timeout.to_string(), "TIMEOUT");
        assert_eq!(
            serde_json::to_string(&ReasonCode::DependencyUnavailable).unwrap(),
            "\"DEPENDENCY_UNAVAILABLE\""
        );
    }

    #[test]
    fn test_error_reason_mapping() {
        let err = Error::RateLimited {
            retry_after_seconds: 1.5,
        };
        assert_eq!(err.reason(), ReasonCode::RateLimited);
        assert!(err.reason().is_retryable());

        let err = Error::computation("upstream returned 502");
        assert_eq!(err.reason(), ReasonCode::ComputationFailed);
        assert_eq!(err.to_string(), "computation failed: upstream returned 502");
        assert!(!err.reason().is_retryable());

        let err: Error = ConfigError::Zero { field: "max" }.into();
        assert_eq!(err.reason(), ReasonCode::InvalidConfig);
        assert_eq!(err.to_string(), "max must be greater than 0");
    }

    #[test]
    fn test_timeout_is_distinct_from_failure() {
        let id = JobId::new();
        let timeout = Error::Timeout {
            job_id: id,
            timeout: Duration::from_millis(100),
        };
        assert_eq!(timeout.reason(), ReasonCode::Timeout);
        assert_ne!(timeout.reason(), Error::computation("boom").reason());
        assert!(timeout.to_string().ends_with("timed out after 100ms"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
