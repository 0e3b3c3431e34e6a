//! Wall-clock abstraction.
//!
//! Skew detection compares server timestamps against local wall time, so the clock here is a
//! `SystemTime` source rather than a monotonic one. [`ManualClock`] lets tests pin "now".

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> SystemTime;
}

/// Clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Settable clock for tests. Clones share the same reading.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Start at `start`. Times before the epoch clamp to the epoch.
    pub fn new(start: SystemTime) -> Self {
        Self { millis: Arc::new(AtomicI64::new(to_millis(start))) }
    }

    pub fn set(&self, now: SystemTime) {
        self.millis.store(to_millis(now), Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        let millis = self.millis.load(Ordering::Acquire).max(0) as u64;
        UNIX_EPOCH + Duration::from_millis(millis)
    }
}

fn to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), t0 + Duration::from_secs(90));
    }

    #[test]
    fn clones_share_reading() {
        let clock = ManualClock::default();
        let other = clock.clone();
        let target = UNIX_EPOCH + Duration::from_secs(42);
        other.set(target);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn system_clock_is_after_epoch() {
        assert!(SystemClock.now() > UNIX_EPOCH);
    }
}
