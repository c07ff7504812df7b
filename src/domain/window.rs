//! Per-key request windows for the sliding-window limiter.
//!
//! A [`RateWindowEntry`] tracks the requests admitted for one key inside the
//! trailing window, plus the count of consecutive denials that scales the
//! retry backoff. Two algorithms are available:
//!
//! - [`WindowAlgorithm::SlidingLog`] keeps one timestamp per admitted request.
//!   It is exact: no interval of width `window` ever contains more than `max`
//!   admitted requests.
//! - [`WindowAlgorithm::WeightedCounter`] keeps two adjacent fixed-window
//!   counters and estimates the trailing count as
//!   `current + previous * (1 - elapsed_fraction)`. Constant memory per key,
//!   and the only form that can be shared through a counter store.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Lower bound of the retry jitter factor (inclusive).
pub const JITTER_MIN: f64 = 1.0;
/// Upper bound of the retry jitter factor (exclusive).
pub const JITTER_MAX: f64 = 1.3;

/// Counting algorithm used for a limiter's local windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlgorithm {
    /// Exact timestamp log
    #[default]
    SlidingLog,
    /// Two-window linear interpolation
    WeightedCounter,
}

#[derive(Debug, Clone)]
enum WindowState {
    Log(VecDeque<Instant>),
    Counter {
        current_start: Instant,
        current: u64,
        previous: u64,
    },
}

/// Window state owned by the limiter for a single admission key.
#[derive(Debug, Clone)]
pub struct RateWindowEntry {
    state: WindowState,
    consecutive_violations: u32,
    last_seen: Instant,
}

impl RateWindowEntry {
    /// Create an empty window starting at `now`.
    pub fn new(algorithm: WindowAlgorithm, now: Instant) -> Self {
        let state = match algorithm {
            WindowAlgorithm::SlidingLog => WindowState::Log(VecDeque::new()),
            WindowAlgorithm::WeightedCounter => WindowState::Counter {
                current_start: now,
                current: 0,
                previous: 0,
            },
        };
        Self {
            state,
            consecutive_violations: 0,
            last_seen: now,
        }
    }

    /// Estimated number of admitted requests in the window ending at `now`.
    pub fn estimate(&mut self, now: Instant, window: Duration) -> f64 {
        self.roll(now, window);
        match &self.state {
            WindowState::Log(stamps) => stamps.len() as f64,
            WindowState::Counter {
                current_start,
                current,
                previous,
            } => {
                let elapsed = now.saturating_duration_since(*current_start);
                weighted_estimate(*current, *previous, elapsed_fraction(elapsed, window))
            }
        }
    }

    /// Admit one request if it fits under `max`, updating the violation streak.
    pub fn try_admit(&mut self, now: Instant, window: Duration, max: u64) -> bool {
        self.last_seen = now;
        if self.estimate(now, window) + 1.0 > max as f64 {
            self.record_violation();
            return false;
        }
        match &mut self.state {
            WindowState::Log(stamps) => stamps.push_back(now),
            WindowState::Counter { current, .. } => *current += 1,
        }
        self.consecutive_violations = 0;
        true
    }

    /// Record a denial decided elsewhere (for example by a shared store).
    pub fn record_violation(&mut self) {
        self.consecutive_violations = self.consecutive_violations.saturating_add(1);
    }

    /// Record an admission decided elsewhere.
    pub fn record_admitted(&mut self, now: Instant) {
        self.last_seen = now;
        self.consecutive_violations = 0;
    }

    /// Number of denials since the last admitted request.
    pub fn consecutive_violations(&self) -> u32 {
        self.consecutive_violations
    }

    /// Last time this key was consulted.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Whether the key has been idle for at least `idle`.
    pub fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= idle
    }

    fn roll(&mut self, now: Instant, window: Duration) {
        match &mut self.state {
            WindowState::Log(stamps) => {
                while let Some(&oldest) = stamps.front() {
                    if now.saturating_duration_since(oldest) > window {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }
            }
            WindowState::Counter {
                current_start,
                current,
                previous,
            } => {
                let elapsed = now.saturating_duration_since(*current_start);
                if window.is_zero() || elapsed < window {
                    return;
                }
                let windows_passed = elapsed.as_nanos() / window.as_nanos();
                *previous = if windows_passed == 1 { *current } else { 0 };
                *current = 0;
                let step = window.as_nanos().saturating_mul(windows_passed);
                *current_start += Duration::from_nanos(u64::try_from(step).unwrap_or(u64::MAX));
            }
        }
    }
}

/// `current + previous * (1 - elapsed_fraction)`.
pub fn weighted_estimate(current: u64, previous: u64, elapsed_fraction: f64) -> f64 {
    let weight = (1.0 - elapsed_fraction).clamp(0.0, 1.0);
    current as f64 + previous as f64 * weight
}

/// Fraction of `window` covered by `elapsed`, clamped to `[0, 1]`.
pub fn elapsed_fraction(elapsed: Duration, window: Duration) -> f64 {
    if window.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / window.as_secs_f64()).clamp(0.0, 1.0)
}

/// Backoff after `violations` consecutive denials:
/// `min(max, base * 2^violations) * jitter`.
pub fn backoff_delay(violations: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    let factor = 2u32.checked_pow(violations).unwrap_or(u32::MAX);
    let capped = base.saturating_mul(factor).min(max);
    capped.mul_f64(jitter.max(0.0))
}

/// Draw a jitter factor uniformly from `[1.0, 1.3)`.
pub fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_sliding_log_admits_up_to_max() {
        let now = Instant::now();
        let mut entry = RateWindowEntry::new(WindowAlgorithm::SlidingLog, now);

        for _ in 0..3 {
            assert!(entry.try_admit(now, WINDOW, 3));
        }
        assert!(!entry.try_admit(now, WINDOW, 3));
        assert_eq!(entry.consecutive_violations(), 1);
        assert!(!entry.try_admit(now, WINDOW, 3));
        assert_eq!(entry.consecutive_violations(), 2);
    }

    #[test]
    fn test_sliding_log_expires_old_requests() {
        let now = Instant::now();
        let mut entry = RateWindowEntry::new(WindowAlgorithm::SlidingLog, now);
        assert!(entry.try_admit(now, WINDOW, 1));

        // Exactly one window later the first request still counts
        assert!(!entry.try_admit(now + WINDOW, WINDOW, 1));

        let later = now + WINDOW + Duration::from_millis(1);
        assert!(entry.try_admit(later, WINDOW, 1));
        assert_eq!(entry.consecutive_violations(), 0);
    }

    #[test]
    fn test_weighted_counter_interpolates_previous_window() {
        let start = Instant::now();
        let mut entry = RateWindowEntry::new(WindowAlgorithm::WeightedCounter, start);

        for _ in 0..10 {
            assert!(entry.try_admit(start, WINDOW, 10));
        }
        assert!(!entry.try_admit(start, WINDOW, 10));

        // A quarter into the next window, 75% of the previous count still weighs in
        let quarter = start + WINDOW + WINDOW / 4;
        assert!((entry.estimate(quarter, WINDOW) - 7.5).abs() < 1e-9);
        assert!(entry.try_admit(quarter, WINDOW, 10));
        assert!(entry.try_admit(quarter, WINDOW, 10));
        assert!(!entry.try_admit(quarter, WINDOW, 10));
    }

    #[test]
    fn test_weighted_counter_forgets_after_two_windows() {
        let start = Instant::now();
        let mut entry = RateWindowEntry::new(WindowAlgorithm::WeightedCounter, start);
        for _ in 0..5 {
            entry.try_admit(start, WINDOW, 5);
        }

        let much_later = start + WINDOW * 3;
        assert_eq!(entry.estimate(much_later, WINDOW), 0.0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);

        assert_eq!(backoff_delay(0, base, max, 1.0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1, base, max, 1.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, base, max, 1.0), Duration::from_secs(4));
        assert_eq!(backoff_delay(10, base, max, 1.0), max);
        assert_eq!(backoff_delay(u32::MAX, base, max, 1.0), max);
    }

    #[test]
    fn test_backoff_applies_jitter() {
        let base = Duration::from_secs(1);
        let delay = backoff_delay(1, base, Duration::from_secs(60), 1.25);
        assert_eq!(delay, Duration::from_millis(2500));
    }

    #[test]
    fn test_jitter_range() {
        for _ in 0..1_000 {
            let j = jitter_factor();
            assert!((JITTER_MIN..JITTER_MAX).contains(&j));
        }
    }

    #[test]
    fn test_idle_detection() {
        let now = Instant::now();
        let entry = RateWindowEntry::new(WindowAlgorithm::SlidingLog, now);
        assert!(!entry.is_idle(now + Duration::from_secs(59), WINDOW));
        assert!(entry.is_idle(now + WINDOW, WINDOW));
    }
}
