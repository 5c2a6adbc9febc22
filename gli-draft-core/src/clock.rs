//! Wall-clock abstraction.
//!
//! Every timestamp the engine writes (draft `updatedAt`, snapshot
//! `lastSaved`, collaboration ordering keys) comes from an injected
//! [`Clock`], so tests can pin and step time deterministically.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Start at a fixed, arbitrary instant (2024-01-01T00:00:00Z).
    pub fn at_epoch_2024() -> Self {
        Self::from_millis(1_704_067_200_000)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn advance_millis(&self, ms: i64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_epoch_2024();
        let start = clock.now_millis();
        clock.advance_millis(1500);
        assert_eq!(clock.now_millis(), start + 1500);
        clock.advance(Duration::seconds(2));
        assert_eq!(clock.now_millis(), start + 3500);
    }

    #[test]
    fn test_manual_clock_set_and_now_agree() {
        let clock = ManualClock::at_epoch_2024();
        let target = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        clock.set(target);
        assert_eq!(clock.now(), target);
        assert_eq!(clock.now_millis(), target.timestamp_millis());
    }
}
