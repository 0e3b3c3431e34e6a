//! The retry/token engine.
//!
//! Pure decision logic shared by both execution models. Drivers call, per call:
//!
//! 1. [`RetryStrategy::acquire_initial_token`] once, waiting out the returned delay;
//! 2. [`RetryStrategy::starting_attempt`] before every send;
//! 3. [`RetryStrategy::classify`] with the outcome, then finish, wait and retry, or give up.
//!
//! A faulted attempt is retried only if the policy says the fault is retryable, the attempt
//! count is below the policy maximum, and the shared [`TokenBucket`] can cover the fault's cost,
//! checked in that order. The delay is the server's `Retry-After` hint verbatim when present,
//! otherwise jittered exponential backoff from the normal or throttling base.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::context::{ExecutionContext, SdkResponse};
use crate::error::{BuildError, ExhaustionReason, SdkError};
use crate::jitter::Jitter;
use crate::retry::mode::{RetryCosts, RetryMode};
use crate::retry::policy::{DefaultRetryPolicy, RetryPolicy};
use crate::retry::rate_limiter::SendRateLimiter;
use crate::retry::token_bucket::TokenBucket;

/// Lifecycle of a [`RetryToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenState {
    InProgress,
    Succeeded,
    MaxAttemptsReached,
    NonRetryable,
    CapacityExhausted,
}

impl From<ExhaustionReason> for TokenState {
    fn from(reason: ExhaustionReason) -> Self {
        match reason {
            ExhaustionReason::NonRetryable => TokenState::NonRetryable,
            ExhaustionReason::MaxAttemptsReached => TokenState::MaxAttemptsReached,
            ExhaustionReason::CapacityExhausted => TokenState::CapacityExhausted,
        }
    }
}

/// Per-call bookkeeping owned by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryToken {
    attempt: u32,
    max_attempts: u32,
    capacity_acquired: u32,
    capacity_remaining: u32,
    state: TokenState,
}

impl RetryToken {
    /// Attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Capacity withdrawn for the most recent retry.
    pub fn capacity_acquired(&self) -> u32 {
        self.capacity_acquired
    }

    /// Pool capacity observed at the last withdrawal or release.
    pub fn capacity_remaining(&self) -> u32 {
        self.capacity_remaining
    }

    pub fn state(&self) -> TokenState {
        self.state
    }
}

/// What the driver does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Success,
    Retry(Duration),
    Exhausted(ExhaustionReason),
}

/// Retry/token engine. Cheap to share behind an `Arc`.
#[derive(Clone)]
pub struct RetryStrategy {
    mode: RetryMode,
    policy: Arc<dyn RetryPolicy>,
    backoff: Backoff,
    throttling_backoff: Backoff,
    jitter: Jitter,
    costs: RetryCosts,
    capacity_enabled: bool,
    bucket: Arc<TokenBucket>,
    rate_limiter: Option<Arc<SendRateLimiter>>,
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryStrategy")
            .field("mode", &self.mode)
            .field("policy", &self.policy)
            .field("backoff", &self.backoff)
            .field("throttling_backoff", &self.throttling_backoff)
            .field("jitter", &self.jitter)
            .field("costs", &self.costs)
            .field("capacity", &self.bucket.current())
            .finish()
    }
}

impl RetryStrategy {
    pub fn builder() -> RetryStrategyBuilder {
        RetryStrategyBuilder::new(RetryMode::Standard)
    }

    /// Builder preloaded with `mode`'s defaults.
    pub fn for_mode(mode: RetryMode) -> RetryStrategyBuilder {
        RetryStrategyBuilder::new(mode)
    }

    pub fn mode(&self) -> RetryMode {
        self.mode
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts()
    }

    pub fn token_bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    pub fn rate_limiter(&self) -> Option<&Arc<SendRateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Start a call. Never consumes retry capacity; the delay is non-zero only when the adaptive
    /// limiter is active and out of send tokens.
    pub fn acquire_initial_token(&self) -> (RetryToken, Duration) {
        let delay = self.rate_limiter.as_ref().map(|l| l.acquire()).unwrap_or(Duration::ZERO);
        let token = RetryToken {
            attempt: 0,
            max_attempts: self.policy.max_attempts(),
            capacity_acquired: 0,
            capacity_remaining: self.bucket.current(),
            state: TokenState::InProgress,
        };
        tracing::debug!(
            mode = %self.mode,
            delay_ms = delay.as_millis() as u64,
            capacity = token.capacity_remaining,
            "request attempt 1 token acquired"
        );
        (token, delay)
    }

    /// Record the start of the next attempt and stamp its identifiers on the context.
    pub fn starting_attempt(&self, token: &mut RetryToken, ctx: &mut ExecutionContext) -> u32 {
        token.attempt += 1;
        ctx.begin_attempt(token.attempt, token.max_attempts);
        tracing::debug!(
            invocation_id = %ctx.invocation_id(),
            attempt = token.attempt,
            max_attempts = token.max_attempts,
            capacity = self.bucket.current(),
            "starting attempt"
        );
        token.attempt
    }

    /// Classify the outcome of the attempt that just finished.
    pub fn classify(
        &self,
        token: &mut RetryToken,
        outcome: Result<&SdkResponse, &SdkError>,
    ) -> RetryDecision {
        match outcome {
            Ok(_) => {
                self.record_success(token);
                RetryDecision::Success
            }
            Err(fault) => self.classify_fault(token, fault),
        }
    }

    fn record_success(&self, token: &mut RetryToken) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.record(false);
        }
        let released = if self.capacity_enabled { self.costs.success_increment } else { 0 };
        token.capacity_remaining = self.bucket.release(released);
        token.capacity_acquired = 0;
        token.state = TokenState::Succeeded;
        tracing::debug!(
            attempt = token.attempt,
            released,
            capacity = token.capacity_remaining,
            max_capacity = self.bucket.max_capacity(),
            "request succeeded"
        );
    }

    fn classify_fault(&self, token: &mut RetryToken, fault: &SdkError) -> RetryDecision {
        if !self.policy.is_retryable(fault) {
            return self.give_up(token, ExhaustionReason::NonRetryable, fault);
        }
        if token.attempt >= token.max_attempts {
            return self.give_up(token, ExhaustionReason::MaxAttemptsReached, fault);
        }

        let throttling = self.policy.is_throttling(fault);
        let cost = self.cost_of(fault, throttling);
        let acquire = self.bucket.try_acquire(cost);
        token.capacity_remaining = acquire.remaining;
        if !acquire.acquired {
            return self.give_up(token, ExhaustionReason::CapacityExhausted, fault);
        }
        token.capacity_acquired = acquire.amount;

        if let Some(limiter) = &self.rate_limiter {
            if throttling {
                limiter.record(true);
            }
        }

        let delay = match fault.retry_after() {
            Some(hint) => hint,
            None => {
                let backoff = if throttling { self.throttling_backoff } else { self.backoff };
                let computed = self.jitter.apply(backoff.delay(token.attempt));
                let paced = self.rate_limiter.as_ref().map(|l| l.acquire()).unwrap_or_default();
                computed.saturating_add(paced)
            }
        };
        tracing::debug!(
            attempt = token.attempt,
            next_attempt = token.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            cost = acquire.amount,
            capacity = acquire.remaining,
            max_capacity = self.bucket.max_capacity(),
            throttling,
            error = %fault,
            "retrying after failure"
        );
        RetryDecision::Retry(delay)
    }

    fn cost_of(&self, fault: &SdkError, throttling: bool) -> u32 {
        if !self.capacity_enabled {
            return 0;
        }
        if throttling {
            self.costs.throttling
        } else if fault.is_attempt_timeout() {
            self.costs.timeout
        } else {
            self.costs.failure
        }
    }

    fn give_up(
        &self,
        token: &mut RetryToken,
        reason: ExhaustionReason,
        fault: &SdkError,
    ) -> RetryDecision {
        token.state = reason.into();
        token.capacity_acquired = 0;
        match reason {
            ExhaustionReason::CapacityExhausted => tracing::warn!(
                attempt = token.attempt,
                capacity = token.capacity_remaining,
                max_capacity = self.bucket.max_capacity(),
                error = %fault,
                "request will not be retried: retry capacity exhausted"
            ),
            _ => tracing::debug!(
                attempt = token.attempt,
                max_attempts = token.max_attempts,
                reason = %reason,
                error = %fault,
                "request will not be retried"
            ),
        }
        RetryDecision::Exhausted(reason)
    }
}

/// Builder for [`RetryStrategy`].
pub struct RetryStrategyBuilder {
    mode: RetryMode,
    max_attempts: u32,
    base_delay: Duration,
    throttling_base_delay: Duration,
    max_backoff: Duration,
    jitter: Jitter,
    capacity: u32,
    costs: RetryCosts,
    policy: Option<Arc<dyn RetryPolicy>>,
    bucket: Option<Arc<TokenBucket>>,
    rate_limiter: Option<Arc<SendRateLimiter>>,
}

impl RetryStrategyBuilder {
    pub fn new(mode: RetryMode) -> Self {
        let defaults = mode.defaults();
        Self {
            mode,
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay,
            throttling_base_delay: defaults.throttling_base_delay,
            max_backoff: defaults.max_backoff,
            jitter: Jitter::Full,
            capacity: defaults.capacity,
            costs: defaults.costs,
            policy: None,
            bucket: None,
            rate_limiter: None,
        }
    }

    /// Total attempts for the default policy. Ignored when a custom policy is supplied.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn throttling_base_delay(mut self, delay: Duration) -> Self {
        self.throttling_base_delay = delay;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Size of a new capacity pool. Ignored when a shared bucket is supplied.
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Cost of an ordinary failure. Zero turns capacity accounting off entirely.
    pub fn failure_cost(mut self, cost: u32) -> Self {
        self.costs.failure = cost;
        self
    }

    pub fn throttling_cost(mut self, cost: u32) -> Self {
        self.costs.throttling = cost;
        self
    }

    pub fn timeout_cost(mut self, cost: u32) -> Self {
        self.costs.timeout = cost;
        self
    }

    pub fn success_increment(mut self, amount: u32) -> Self {
        self.costs.success_increment = amount;
        self
    }

    pub fn policy<P>(mut self, policy: P) -> Self
    where
        P: RetryPolicy + 'static,
    {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Share an existing capacity pool.
    pub fn shared_bucket(mut self, bucket: Arc<TokenBucket>) -> Self {
        self.bucket = Some(bucket);
        self
    }

    /// Share an existing send-rate limiter (adaptive mode only).
    pub fn shared_rate_limiter(mut self, limiter: Arc<SendRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn build(self) -> Result<RetryStrategy, BuildError> {
        let policy = match self.policy {
            Some(policy) => policy,
            None => Arc::new(
                DefaultRetryPolicy::builder()
                    .max_attempts(self.max_attempts)
                    .build()?,
            ),
        };
        if policy.max_attempts() == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        let bucket = match self.bucket {
            Some(bucket) => bucket,
            None => Arc::new(TokenBucket::new(self.capacity)?),
        };
        let backoff = Backoff::exponential(self.base_delay).with_max(self.max_backoff)?;
        let throttling_backoff =
            Backoff::exponential(self.throttling_base_delay).with_max(self.max_backoff)?;
        let rate_limiter = if self.mode.is_adaptive() {
            Some(self.rate_limiter.unwrap_or_default())
        } else {
            None
        };
        Ok(RetryStrategy {
            mode: self.mode,
            policy,
            backoff,
            throttling_backoff,
            jitter: self.jitter,
            costs: self.costs,
            capacity_enabled: self.costs.failure > 0,
            bucket,
            rate_limiter,
        })
    }
}
