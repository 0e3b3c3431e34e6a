//! Client-side send-rate limiter for the adaptive retry mode.
//!
//! Dormant until the first throttling fault. From then on every attempt withdraws one token from
//! a bucket refilled at `fill_rate` tokens per second; an empty bucket turns into a delay before
//! the attempt is sent. The fill rate follows a CUBIC curve: cut by [`BETA`] on throttling, then
//! grown back toward (and past) the rate at which throttling last happened.
//!
//! State is an immutable snapshot swapped with `ArcSwap::rcu`, so concurrent calls never hold a
//! lock and every update is computed from a consistent view.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

const MIN_FILL_RATE: f64 = 0.5;
const MIN_CAPACITY: f64 = 1.0;
const SMOOTH: f64 = 0.8;
/// Multiplicative decrease applied on throttling.
pub const BETA: f64 = 0.7;
const SCALE_CONSTANT: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq)]
struct LimiterState {
    enabled: bool,
    fill_rate: f64,
    max_capacity: f64,
    current_capacity: f64,
    last_refill: Option<f64>,
    measured_tx_rate: f64,
    last_tx_rate_bucket: f64,
    request_count: u64,
    last_max_rate: f64,
    last_throttle_time: f64,
    time_window: f64,
}

impl Default for LimiterState {
    fn default() -> Self {
        Self {
            enabled: false,
            fill_rate: MIN_FILL_RATE,
            max_capacity: MIN_CAPACITY,
            current_capacity: 0.0,
            last_refill: None,
            measured_tx_rate: 0.0,
            last_tx_rate_bucket: 0.0,
            request_count: 0,
            last_max_rate: 0.0,
            last_throttle_time: 0.0,
            time_window: 0.0,
        }
    }
}

impl LimiterState {
    fn refill(&mut self, now: f64) {
        if let Some(last) = self.last_refill {
            let added = (now - last).max(0.0) * self.fill_rate;
            self.current_capacity = (self.current_capacity + added).min(self.max_capacity);
        }
        self.last_refill = Some(now);
    }

    /// Reserve one token; a negative balance is the wait owed by this caller.
    fn acquire(mut self, now: f64) -> (Self, Duration) {
        if !self.enabled {
            return (self, Duration::ZERO);
        }
        self.refill(now);
        self.current_capacity -= 1.0;
        let delay = if self.current_capacity >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.current_capacity / self.fill_rate)
        };
        (self, delay)
    }

    fn update_measured_rate(&mut self, now: f64) {
        let bucket = (now * 2.0).floor() / 2.0;
        self.request_count += 1;
        if bucket > self.last_tx_rate_bucket {
            let current_rate = self.request_count as f64 / (bucket - self.last_tx_rate_bucket);
            self.measured_tx_rate = current_rate * SMOOTH + self.measured_tx_rate * (1.0 - SMOOTH);
            self.request_count = 0;
            self.last_tx_rate_bucket = bucket;
        }
    }

    fn update(mut self, throttled: bool, now: f64) -> Self {
        self.update_measured_rate(now);
        let calculated = if throttled {
            let rate_to_use = if self.enabled {
                self.measured_tx_rate.min(self.fill_rate)
            } else {
                self.measured_tx_rate
            };
            self.last_max_rate = rate_to_use;
            self.time_window = self.compute_time_window();
            self.last_throttle_time = now;
            self.enabled = true;
            rate_to_use * BETA
        } else {
            self.time_window = self.compute_time_window();
            self.last_max_rate
                + SCALE_CONSTANT * (now - self.last_throttle_time - self.time_window).powi(3)
        };
        let new_rate = calculated.min(2.0 * self.measured_tx_rate);
        self.refill(now);
        self.fill_rate = new_rate.max(MIN_FILL_RATE);
        self.max_capacity = new_rate.max(MIN_CAPACITY);
        self.current_capacity = self.current_capacity.min(self.max_capacity);
        self
    }

    fn compute_time_window(&self) -> f64 {
        (self.last_max_rate * (1.0 - BETA) / SCALE_CONSTANT).cbrt()
    }
}

/// Adaptive send-rate limiter shared by the calls of one client.
pub struct SendRateLimiter {
    state: ArcSwap<LimiterState>,
    origin: Instant,
}

impl fmt::Debug for SendRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load();
        f.debug_struct("SendRateLimiter")
            .field("enabled", &state.enabled)
            .field("fill_rate", &state.fill_rate)
            .field("measured_tx_rate", &state.measured_tx_rate)
            .finish()
    }
}

impl Default for SendRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SendRateLimiter {
    pub fn new() -> Self {
        Self { state: ArcSwap::from_pointee(LimiterState::default()), origin: Instant::now() }
    }

    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Take a send token; the returned delay must elapse before the attempt is sent.
    pub fn acquire(&self) -> Duration {
        self.acquire_at(self.now())
    }

    /// Feed the outcome of an attempt.
    pub fn record(&self, throttled: bool) {
        self.record_at(throttled, self.now());
    }

    pub fn is_enabled(&self) -> bool {
        self.state.load().enabled
    }

    /// Current refill rate, tokens per second.
    pub fn fill_rate(&self) -> f64 {
        self.state.load().fill_rate
    }

    pub(crate) fn acquire_at(&self, now: f64) -> Duration {
        let previous = self.state.rcu(|state| state.acquire(now).0);
        previous.acquire(now).1
    }

    pub(crate) fn record_at(&self, throttled: bool, now: f64) {
        let previous = self.state.rcu(|state| state.update(throttled, now));
        if throttled {
            let next = previous.update(throttled, now);
            tracing::debug!(
                fill_rate = next.fill_rate,
                measured_tx_rate = next.measured_tx_rate,
                "send rate reduced after throttling"
            );
        }
    }
}
