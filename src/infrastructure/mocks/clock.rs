//! Mock clock for testing.

use crate::application::ports::Clock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Mock clock for testing.
///
/// Controls both the monotonic instant and the UTC wall clock, so window,
/// cooldown and TTL logic as well as calendar-day quota resets can be tested
/// deterministically. `advance` moves both together.
///
/// # Examples
///
/// ```
/// use tollgate::infrastructure::mocks::MockClock;
/// use tollgate::application::ports::Clock;
/// use chrono::{TimeZone, Utc};
/// use std::time::{Duration, Instant};
///
/// let start = Instant::now();
/// let clock = MockClock::new(start)
///     .with_utc(Utc.with_ymd_and_hms(2026, 10, 16, 23, 59, 0).unwrap());
///
/// clock.advance(Duration::from_secs(60));
/// assert_eq!(clock.now(), start + Duration::from_secs(60));
/// assert_eq!(clock.utc_now(), Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap());
/// ```
///
/// # Thread Safety
///
/// All clones share the same underlying time value, so advancing time in
/// one clone affects all clones.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<(Instant, DateTime<Utc>)>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific instant.
    ///
    /// The wall clock starts at the real current UTC time; use
    /// [`with_utc`](Self::with_utc) to pin it.
    pub fn new(start: Instant) -> Self {
        Self {
            current: Arc::new(Mutex::new((start, Utc::now()))),
        }
    }

    /// Pin the wall clock to `utc`.
    pub fn with_utc(self, utc: DateTime<Utc>) -> Self {
        self.set_utc(utc);
        self
    }

    /// Advance both clocks by a duration.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock();
        current.0 += duration;
        if let Ok(delta) = chrono::Duration::from_std(duration) {
            current.1 += delta;
        }
    }

    /// Set the monotonic clock to a specific instant. The wall clock is untouched.
    pub fn set(&self, instant: Instant) {
        self.current.lock().0 = instant;
    }

    /// Set the wall clock. The monotonic clock is untouched.
    pub fn set_utc(&self, utc: DateTime<Utc>) {
        self.current.lock().1 = utc;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.current.lock().0
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.current.lock().1
    }
}
