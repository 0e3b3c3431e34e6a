//! Shared retry capacity.
//!
//! Failed attempts withdraw a cost before they may be retried; successful calls put a fixed
//! increment back. The pool never goes below zero and never blocks: a withdrawal that does not
//! fit is simply denied and the call gives up. One bucket is normally shared by every call made
//! through a client (or several clients, by passing the same `Arc`).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::BuildError;

/// Result of a withdrawal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    /// Whether the requested amount was withdrawn.
    pub acquired: bool,
    /// Amount actually withdrawn (0 when denied).
    pub amount: u32,
    /// Capacity left after the operation.
    pub remaining: u32,
}

/// Lock-free bounded counter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: AtomicU32,
    max_capacity: u32,
}

impl TokenBucket {
    /// A full bucket holding `max_capacity` tokens.
    pub fn new(max_capacity: u32) -> Result<Self, BuildError> {
        if max_capacity == 0 {
            return Err(BuildError::InvalidCapacity(max_capacity));
        }
        Ok(Self { capacity: AtomicU32::new(max_capacity), max_capacity })
    }

    /// Withdraw `amount` if at least that much is available. Zero always succeeds.
    pub fn try_acquire(&self, amount: u32) -> Acquire {
        let mut current = self.capacity.load(Ordering::Acquire);
        loop {
            if amount > current {
                return Acquire { acquired: false, amount: 0, remaining: current };
            }
            let next = current - amount;
            match self.capacity.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Acquire { acquired: true, amount, remaining: next },
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `amount` tokens, saturating at the maximum. Returns the new capacity.
    pub fn release(&self, amount: u32) -> u32 {
        if amount == 0 {
            return self.current();
        }
        let max = self.max_capacity;
        let previous = self
            .capacity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(amount).min(max))
            })
            .unwrap_or(max);
        previous.saturating_add(amount).min(max)
    }

    pub fn current(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }
}
