//! Clock-skew detection and correction.
//!
//! Time-based request signing fails when the local clock disagrees with the server's. After a
//! faulted attempt the [`ClockSkewCorrector`] inspects the service fault: if it looks like a
//! signing-time rejection and carries a server timestamp more than [`SKEW_THRESHOLD`] away from
//! the local send time, the shared [`ClockSkewOffset`] is overwritten with `local - server`.
//! Signing then uses `now - offset` for every later attempt of every call on the client.
//!
//! The offset is one `AtomicI64` of milliseconds: concurrent corrections are last-writer-wins
//! and readers never observe a torn value.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::clock::Clock;
use crate::error::{SdkError, ServiceFault};

/// Disagreement above which the offset is adjusted.
pub const SKEW_THRESHOLD: Duration = Duration::from_secs(4 * 60);

const SKEW_ERROR_CODES: &[&str] = &[
    "RequestTimeTooSkewed",
    "RequestExpired",
    "RequestInTheFuture",
    "InvalidSignatureException",
    "SignatureDoesNotMatch",
    "AuthFailure",
];

/// True when the service explicitly rejected the request's signing time.
pub fn has_clock_skew_code(fault: &ServiceFault) -> bool {
    fault.code().map(|code| SKEW_ERROR_CODES.contains(&code)).unwrap_or(false)
}

/// True for service faults that may have been caused by a skewed signing time.
pub fn is_clock_skew_fault(fault: &ServiceFault) -> bool {
    has_clock_skew_code(fault) || matches!(fault.status(), 401 | 403)
}

/// Per-client correction, in milliseconds: positive means the local clock runs ahead.
#[derive(Debug, Default)]
pub struct ClockSkewOffset {
    millis: AtomicI64,
}

impl ClockSkewOffset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn millis(&self) -> i64 {
        self.millis.load(Ordering::Acquire)
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::Release);
    }

    /// `now` corrected to the server's clock.
    pub fn apply(&self, now: SystemTime) -> SystemTime {
        shift(now, self.millis())
    }
}

fn shift(time: SystemTime, offset_millis: i64) -> SystemTime {
    let magnitude = Duration::from_millis(offset_millis.unsigned_abs());
    let shifted = if offset_millis >= 0 {
        time.checked_sub(magnitude)
    } else {
        time.checked_add(magnitude)
    };
    shifted.unwrap_or(UNIX_EPOCH)
}

/// Signed `a - b` in milliseconds.
fn signed_millis_between(a: SystemTime, b: SystemTime) -> i64 {
    match a.duration_since(b) {
        Ok(ahead) => i64::try_from(ahead.as_millis()).unwrap_or(i64::MAX),
        Err(behind) => -i64::try_from(behind.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

/// Detects skew from faulted attempts and maintains the shared offset.
#[derive(Debug, Clone)]
pub struct ClockSkewCorrector {
    offset: Arc<ClockSkewOffset>,
    clock: Arc<dyn Clock>,
}

impl ClockSkewCorrector {
    pub fn new(offset: Arc<ClockSkewOffset>, clock: Arc<dyn Clock>) -> Self {
        Self { offset, clock }
    }

    pub fn offset(&self) -> &Arc<ClockSkewOffset> {
        &self.offset
    }

    /// Local time right now, uncorrected.
    pub fn local_now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Time to sign with: local time corrected by the current offset.
    pub fn signing_time(&self) -> SystemTime {
        self.offset.apply(self.clock.now())
    }

    /// Inspect a faulted attempt sent at `local_send_time`. Returns the new offset when it
    /// changed.
    pub fn observe(&self, fault: &SdkError, local_send_time: SystemTime) -> Option<i64> {
        let service = fault.as_service_fault()?;
        if !is_clock_skew_fault(service) {
            return None;
        }
        let server_time = service.server_time()?;
        let skew = signed_millis_between(local_send_time, server_time);
        if skew.unsigned_abs() <= SKEW_THRESHOLD.as_millis() as u64 {
            return None;
        }
        let previous = self.offset.millis();
        if previous == skew {
            return None;
        }
        self.offset.set_millis(skew);
        tracing::warn!(
            previous_offset_ms = previous,
            offset_ms = skew,
            status = service.status(),
            code = service.code().unwrap_or_default(),
            "clock skew detected; adjusting signing time offset"
        );
        Some(skew)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{TransportFault, TransportFaultKind};

    fn corrector(clock: &ManualClock) -> ClockSkewCorrector {
        ClockSkewCorrector::new(Arc::new(ClockSkewOffset::new()), Arc::new(clock.clone()))
    }

    fn skew_fault(server_time: SystemTime) -> SdkError {
        ServiceFault::new(403, "Signature expired")
            .with_code("RequestTimeTooSkewed")
            .with_server_time(server_time)
            .into()
    }

    #[test]
    fn large_disagreement_sets_offset_and_corrects_signing_time() {
        let clock = ManualClock::default();
        let corrector = corrector(&clock);
        let local = clock.now();
        let server = local - Duration::from_secs(15 * 60);

        assert_eq!(corrector.observe(&skew_fault(server), local), Some(15 * 60 * 1000));
        assert_eq!(corrector.signing_time(), server);
        assert_eq!(corrector.observe(&skew_fault(server), local), None, "unchanged");
    }

    #[test]
    fn server_ahead_gives_negative_offset() {
        let clock = ManualClock::default();
        let corrector = corrector(&clock);
        let local = clock.now();
        let server = local + Duration::from_secs(10 * 60);
        assert_eq!(corrector.observe(&skew_fault(server), local), Some(-(10 * 60 * 1000)));
        assert_eq!(corrector.signing_time(), server);
    }

    #[test]
    fn small_disagreement_is_ignored() {
        let clock = ManualClock::default();
        let corrector = corrector(&clock);
        let local = clock.now();
        assert_eq!(corrector.observe(&skew_fault(local - Duration::from_secs(60)), local), None);
        assert_eq!(corrector.offset().millis(), 0);
    }

    #[test]
    fn unrelated_faults_are_ignored() {
        let clock = ManualClock::default();
        let corrector = corrector(&clock);
        let local = clock.now();
        let far = local - Duration::from_secs(3600);
        let throttled: SdkError =
            ServiceFault::new(429, "slow").with_code("Throttling").with_server_time(far).into();
        let transport: SdkError = TransportFault::new(TransportFaultKind::Io, "reset").into();
        assert_eq!(corrector.observe(&throttled, local), None);
        assert_eq!(corrector.observe(&transport, local), None);
        let no_date: SdkError = ServiceFault::new(403, "denied").into();
        assert_eq!(corrector.observe(&no_date, local), None);
    }

    #[test]
    fn status_alone_marks_candidate() {
        assert!(is_clock_skew_fault(&ServiceFault::new(401, "unauthorized")));
        assert!(is_clock_skew_fault(&ServiceFault::new(400, "x").with_code("RequestExpired")));
        assert!(!is_clock_skew_fault(&ServiceFault::new(400, "x").with_code("ValidationError")));
    }

    #[test]
    fn concurrent_writers_never_tear() {
        let offset = Arc::new(ClockSkewOffset::new());
        let handles: Vec<_> = [i64::MAX / 3, -(i64::MAX / 5)]
            .into_iter()
            .map(|value| {
                let offset = offset.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        offset.set_millis(value);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let seen = offset.millis();
        assert!(seen == i64::MAX / 3 || seen == -(i64::MAX / 5));
    }
}
