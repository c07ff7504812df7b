//! Typed allow/deny results.
//!
//! Denials are ordinary values inside the components. Only the pipeline
//! boundary turns them into [`Error`]s.

use crate::error::{Error, ReasonCode};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of a rate limiter consume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds to wait before retrying; zero when allowed.
    pub retry_after_seconds: f64,
    /// Requests counted in the trailing window, before this one.
    pub estimate: f64,
    pub limit: u64,
}

impl RateDecision {
    pub(crate) fn allow(estimate: f64, limit: u64) -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0.0,
            estimate,
            limit,
        }
    }

    pub(crate) fn deny(estimate: f64, limit: u64, retry_after_seconds: f64) -> Self {
        Self {
            allowed: false,
            retry_after_seconds,
            estimate,
            limit,
        }
    }

    /// `retry_after_seconds` rounded up, for a `Retry-After` header.
    pub fn retry_after_header(&self) -> u64 {
        if self.allowed {
            0
        } else {
            self.retry_after_seconds.ceil().max(1.0) as u64
        }
    }
}

/// Why a request was turned away, ready for a 429/503-style response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Denial {
    pub reason: ReasonCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    error: Error,
}

impl Denial {
    pub(crate) fn new(error: Error, retry_after_seconds: Option<f64>) -> Self {
        let reset_at = match &error {
            Error::QuotaExceeded { reset_at } => Some(*reset_at),
            _ => None,
        };
        Self {
            reason: error.reason(),
            message: error.to_string(),
            retry_after_seconds,
            reset_at,
            error,
        }
    }

    /// The underlying error.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Convert into the crate error.
    pub fn into_error(self) -> Error {
        self.error
    }
}

impl From<Denial> for Error {
    fn from(denial: Denial) -> Self {
        denial.into_error()
    }
}

/// Result of running the admission sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    Denied(Denial),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    /// `Ok(())` when admitted, otherwise the denial as an error.
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            Admission::Admitted => Ok(()),
            Admission::Denied(denial) => Err(denial.into_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_header_rounds_up() {
        assert_eq!(RateDecision::deny(5.0, 5, 0.55).retry_after_header(), 1);
        assert_eq!(RateDecision::deny(5.0, 5, 2.01).retry_after_header(), 3);
        assert_eq!(RateDecision::allow(1.0, 5).retry_after_header(), 0);
    }

    #[test]
    fn test_quota_denial_carries_reset_at() {
        let reset_at = DateTime::parse_from_rfc3339("2026-10-17T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let denial = Denial::new(Error::QuotaExceeded { reset_at }, Some(3600.0));

        assert_eq!(denial.reason, ReasonCode::QuotaExceeded);
        assert_eq!(denial.reset_at, Some(reset_at));
        assert!(matches!(denial.into_error(), Error::QuotaExceeded { .. }));
    }

    #[test]
    fn test_denial_serializes_reason_code() {
        let denial = Denial::new(
            Error::RateLimited {
                retry_after_seconds: 1.5,
            },
            Some(1.5),
        );
        let json = serde_json::to_value(Admission::Denied(denial)).unwrap();
        assert_eq!(json["outcome"], "denied");
        assert_eq!(json["reason"], "RATE_LIMITED");
        assert_eq!(json["retry_after_seconds"], 1.5);
        assert!(json.get("reset_at").is_none());
    }
}
