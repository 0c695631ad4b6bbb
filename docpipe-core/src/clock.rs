//! Time source abstraction.
//!
//! Cache expiry and circuit-breaker cool-downs read time through [`Clock`]
//! so tests can drive them with a [`ManualClock`] instead of sleeping.

use crate::Timestamp;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
///
/// Stored as microseconds since the epoch so it can be shared across threads
/// without a lock.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    /// Start at the given instant.
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    /// Start at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let micros = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: Timestamp) {
        self.micros.store(to.timestamp_micros(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_now()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let micros = self.micros.load(Ordering::SeqCst);
        chrono::DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }
}

/// Non-negative duration between two instants.
pub fn elapsed_between(earlier: Timestamp, later: Timestamp) -> Duration {
    later
        .signed_duration_since(earlier)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Instant at which something stored at `now` with `ttl` expires.
///
/// Saturates at the latest representable timestamp.
pub fn expires_after(now: Timestamp, ttl: Duration) -> Timestamp {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        clock.advance(Duration::from_secs(90));
        assert_eq!(elapsed_between(start, clock.now()), Duration::from_secs(90));
    }

    #[test]
    fn test_elapsed_between_never_negative() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(5);
        assert_eq!(elapsed_between(now, earlier), Duration::ZERO);
    }

    #[test]
    fn test_expires_after() {
        let now = Utc::now();
        let at = expires_after(now, Duration::from_secs(300));
        assert_eq!(elapsed_between(now, at), Duration::from_secs(300));
        assert_eq!(
            expires_after(now, Duration::MAX),
            chrono::DateTime::<Utc>::MAX_UTC
        );
    }
}
