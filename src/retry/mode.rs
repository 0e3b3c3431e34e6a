//! Retry mode presets.

use std::time::Duration;

/// Preset bundle of retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RetryMode {
    /// Three attempts, uniform capacity costs.
    #[default]
    Standard,
    /// Four attempts; throttled retries are free, timeouts cost double.
    Legacy,
    /// Standard plus a client-side send-rate limiter driven by throttling.
    Adaptive,
}

/// Capacity withdrawn per failure class, and returned per success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCosts {
    pub failure: u32,
    pub throttling: u32,
    pub timeout: u32,
    pub success_increment: u32,
}

/// Concrete parameters of a [`RetryMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDefaults {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub throttling_base_delay: Duration,
    pub max_backoff: Duration,
    pub capacity: u32,
    pub costs: RetryCosts,
}

const MAX_BACKOFF: Duration = Duration::from_secs(20);
const CAPACITY: u32 = 500;

impl RetryMode {
    pub fn defaults(self) -> ModeDefaults {
        match self {
            RetryMode::Standard | RetryMode::Adaptive => ModeDefaults {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                throttling_base_delay: Duration::from_secs(1),
                max_backoff: MAX_BACKOFF,
                capacity: CAPACITY,
                costs: RetryCosts { failure: 5, throttling: 5, timeout: 5, success_increment: 1 },
            },
            RetryMode::Legacy => ModeDefaults {
                max_attempts: 4,
                base_delay: Duration::from_millis(100),
                throttling_base_delay: Duration::from_millis(500),
                max_backoff: MAX_BACKOFF,
                capacity: CAPACITY,
                costs: RetryCosts { failure: 5, throttling: 0, timeout: 10, success_increment: 1 },
            },
        }
    }

    pub fn is_adaptive(self) -> bool {
        matches!(self, RetryMode::Adaptive)
    }
}

impl std::fmt::Display for RetryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryMode::Standard => f.write_str("standard"),
            RetryMode::Legacy => f.write_str("legacy"),
            RetryMode::Adaptive => f.write_str("adaptive"),
        }
    }
}
