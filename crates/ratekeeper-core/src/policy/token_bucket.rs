//! Token bucket: bursts up to `capacity`, continuous refill.

use std::time::Duration;

use crate::domain::{BucketState, Decision, RateLimitState};
use crate::error::{RateLimitError, Result};

use super::Evaluation;

/// Validated token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate_per_second: f64,
    initial_tokens: f64,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn new(capacity: f64, refill_rate_per_second: f64) -> Result<Self> {
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(RateLimitError::Configuration(format!(
                "token bucket capacity must be a positive number, got {capacity}"
            )));
        }
        if !(refill_rate_per_second.is_finite() && refill_rate_per_second > 0.0) {
            return Err(RateLimitError::Configuration(format!(
                "token bucket refill rate must be a positive number, got {refill_rate_per_second}"
            )));
        }

        Ok(Self {
            capacity,
            refill_rate_per_second,
            initial_tokens: capacity,
        })
    }

    pub fn with_initial_tokens(mut self, initial_tokens: f64) -> Result<Self> {
        if !(0.0..=self.capacity).contains(&initial_tokens) {
            return Err(RateLimitError::Configuration(format!(
                "initial tokens must lie in [0, {}], got {initial_tokens}",
                self.capacity
            )));
        }
        self.initial_tokens = initial_tokens;
        Ok(self)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_rate_per_second
    }

    pub fn initial_tokens(&self) -> f64 {
        self.initial_tokens
    }

    pub fn namespace(&self) -> String {
        format!(
            "tb:c{}:r{}:i{}",
            self.capacity, self.refill_rate_per_second, self.initial_tokens
        )
    }

    /// State of a key that has never been written.
    pub fn fresh_state(&self, now: f64) -> BucketState {
        BucketState {
            tokens: self.initial_tokens,
            last_refill_at: now,
        }
    }

    /// Refill, compare and debit.
    ///
    /// The Redis script mirrors this arithmetic operation for operation;
    /// keep the two in step.
    pub fn evaluate(&self, state: Option<&BucketState>, now: f64, cost: u64) -> Evaluation {
        let state = state.copied().unwrap_or_else(|| self.fresh_state(now));
        let cost = cost as f64;

        let elapsed = (now - state.last_refill_at).max(0.0);
        let refilled = (state.tokens + elapsed * self.refill_rate_per_second).min(self.capacity);

        let (allowed, tokens, retry_after_seconds) = if cost > self.capacity {
            (false, refilled, f64::INFINITY)
        } else if refilled >= cost {
            (true, refilled - cost, 0.0)
        } else {
            (
                false,
                refilled,
                ((cost - refilled) / self.refill_rate_per_second).max(0.0),
            )
        };

        let refill_time = (self.capacity - tokens) / self.refill_rate_per_second;
        let decision = Decision {
            allowed,
            remaining: tokens,
            retry_after_seconds,
            reset_at: now + refill_time,
        };

        // A zero-cost call observes without mutating.
        let next_state = (cost > 0.0).then(|| {
            RateLimitState::TokenBucket(BucketState {
                tokens,
                last_refill_at: state.last_refill_at.max(now),
            })
        });

        Evaluation {
            decision,
            next_state,
            ttl: Duration::from_millis(ttl_millis(refill_time)),
        }
    }
}

/// Milliseconds until the state can no longer influence a decision, never zero.
pub(crate) fn ttl_millis(seconds: f64) -> u64 {
    ((seconds * 1000.0).ceil() as u64).max(1)
}
