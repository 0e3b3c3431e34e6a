//! Backoff waits.
//!
//! Both execution models wait through a [`Sleeper`] so tests can run retry loops without real
//! delays. The blocking wait takes the cancellation token it must observe and reports whether it
//! was cut short; the async wait is raced against the token by the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::cancel::CancellationToken;
use crate::timer::{ScheduledTask, TimerService};

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Non-blocking wait.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Block the calling thread for `duration`. Returns `true` if `token` was signalled before
    /// the wait completed.
    fn sleep_blocking(&self, duration: Duration, token: &CancellationToken) -> bool;
}

/// Production sleeper: tokio timers for async waits, a condition wait for blocking ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn sleep_blocking(&self, duration: Duration, token: &CancellationToken) -> bool {
        if duration.is_zero() {
            return token.is_cancelled();
        }
        token.wait_timeout(duration)
    }
}

/// Async waits scheduled on a [`TimerService`], the way the non-blocking driver spaces its
/// retries. Dropping the wait cancels the scheduled callback.
#[derive(Debug, Clone)]
pub struct TimerSleeper {
    timer: TimerService,
}

impl TimerSleeper {
    pub fn new(timer: TimerService) -> Self {
        Self { timer }
    }
}

struct CancelOnDrop(ScheduledTask);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl Sleeper for TimerSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let (tx, rx) = oneshot::channel();
        let task = self.timer.schedule(duration, move || {
            let _ = tx.send(());
        });
        Box::pin(async move {
            let _guard = CancelOnDrop(task);
            let _ = rx.await;
        })
    }

    fn sleep_blocking(&self, duration: Duration, token: &CancellationToken) -> bool {
        TokioSleeper.sleep_blocking(duration, token)
    }
}

/// Test sleeper that doesn't actually sleep
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }

    fn sleep_blocking(&self, _duration: Duration, token: &CancellationToken) -> bool {
        token.is_cancelled()
    }
}

/// Test sleeper that records every requested delay and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn record(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.record(duration);
        Box::pin(async {})
    }

    fn sleep_blocking(&self, duration: Duration, token: &CancellationToken) -> bool {
        self.record(duration);
        token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn instant_sleeper_doesnt_sleep() {
        let start = Instant::now();
        InstantSleeper.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn tracking_sleeper_records_both_flavors() {
        let sleeper = TrackingSleeper::new();
        let token = CancellationToken::new();
        futures::executor::block_on(sleeper.sleep(Duration::from_millis(100)));
        assert!(!sleeper.sleep_blocking(Duration::from_millis(200), &token));
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
        sleeper.clear();
        assert!(sleeper.calls().is_empty());
    }

    #[test]
    fn blocking_sleep_is_cut_short_by_cancellation() {
        let token = CancellationToken::new();
        let signaller = token.clone();
        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaller.cancel();
        });
        assert!(TokioSleeper.sleep_blocking(Duration::from_secs(30), &token));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn blocking_sleep_runs_to_completion_without_signal() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!TokioSleeper.sleep_blocking(Duration::from_millis(30), &token));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_sleeper_waits_on_timer_service() {
        let sleeper = TimerSleeper::new(TimerService::current().unwrap());
        let start = tokio::time::Instant::now();
        sleeper.sleep(Duration::from_secs(2)).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_follows_paused_clock() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_secs(5)).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
