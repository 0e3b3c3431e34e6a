//! Jitter applied on top of computed backoff.
//!
//! - `None`: exact backoff, for deterministic tests.
//! - `Full`: uniform in `[0, delay]`, the default for every retry mode.
//!
//! Server-supplied `Retry-After` hints bypass jitter entirely; the retry engine only calls
//! [`Jitter::apply`] on computed backoff.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Full jitter: random between 0 and delay
    #[default]
    Full,
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Apply jitter to a delay using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let nanos = Self::as_nanos_saturated(delay);
                if nanos == 0 {
                    return Duration::ZERO;
                }
                Duration::from_nanos(rng.random_range(0..=nanos))
            }
        }
    }

    fn as_nanos_saturated(duration: Duration) -> u64 {
        duration.as_nanos().try_into().unwrap_or(u64::MAX)
    }
}
