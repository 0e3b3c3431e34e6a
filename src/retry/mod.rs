//! Retry admission: the engine, its capacity pool, the policy collaborator, mode presets and the
//! adaptive send-rate limiter.

pub mod mode;
pub mod policy;
pub mod rate_limiter;
pub mod strategy;
pub mod token_bucket;

pub use mode::{ModeDefaults, RetryCosts, RetryMode};
pub use policy::{
    is_retryable_by_default, is_throttling_fault, DefaultRetryPolicy, DefaultRetryPolicyBuilder,
    RetryPolicy,
};
pub use rate_limiter::SendRateLimiter;
pub use strategy::{RetryDecision, RetryStrategy, RetryStrategyBuilder, RetryToken, TokenState};
pub use token_bucket::{Acquire, TokenBucket};
