//! Rate limiting policies - pure functions from (state, now, cost) to a decision.

mod sliding_window;
mod token_bucket;

use std::time::Duration;

pub use sliding_window::{DEFAULT_SLOTS, SlidingWindow, WindowPrecision};
pub use token_bucket::TokenBucket;

use crate::domain::{Decision, RateLimitState};
use crate::error::{RateLimitError, Result};

/// Result of evaluating a policy against the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    /// State to persist on consume. `None` means the stored state stays as is.
    pub next_state: Option<RateLimitState>,
    /// How long `next_state` can still influence a future decision.
    pub ttl: Duration,
}

/// A stored state whose kind does not match the evaluating policy.
#[derive(Debug, thiserror::Error)]
#[error("stored {found} state cannot be evaluated by a {expected} policy")]
pub struct StateKindMismatch {
    pub expected: &'static str,
    pub found: &'static str,
}

/// The policy a limiter enforces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Policy {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow),
}

impl Policy {
    pub fn token_bucket(capacity: f64, refill_rate_per_second: f64) -> Result<Self> {
        TokenBucket::new(capacity, refill_rate_per_second).map(Self::TokenBucket)
    }

    pub fn sliding_window(limit: u64, window_seconds: f64) -> Result<Self> {
        SlidingWindow::new(limit, window_seconds).map(Self::SlidingWindow)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenBucket(_) => "token_bucket",
            Self::SlidingWindow(_) => "sliding_window",
        }
    }

    /// Namespace derived from the parameters, keeping differently
    /// configured limiters apart in a shared store.
    pub fn namespace(&self) -> String {
        match self {
            Self::TokenBucket(p) => p.namespace(),
            Self::SlidingWindow(p) => p.namespace(),
        }
    }

    /// Largest cost that can ever be admitted.
    pub fn max_cost(&self) -> f64 {
        match self {
            Self::TokenBucket(p) => p.capacity(),
            Self::SlidingWindow(p) => p.limit() as f64,
        }
    }

    pub fn requires_exact_log(&self) -> bool {
        matches!(self, Self::SlidingWindow(p) if p.precision() == WindowPrecision::Exact)
    }

    pub fn ensure_satisfiable(&self, cost: u64) -> Result<()> {
        let max = self.max_cost();
        if cost as f64 > max {
            return Err(RateLimitError::Unsatisfiable { cost, max });
        }
        Ok(())
    }

    pub fn evaluate(
        &self,
        state: Option<&RateLimitState>,
        now: f64,
        cost: u64,
    ) -> std::result::Result<Evaluation, StateKindMismatch> {
        match (self, state) {
            (Self::TokenBucket(p), None) => Ok(p.evaluate(None, now, cost)),
            (Self::TokenBucket(p), Some(RateLimitState::TokenBucket(s))) => {
                Ok(p.evaluate(Some(s), now, cost))
            }
            (Self::SlidingWindow(p), None) => Ok(p.evaluate(None, now, cost)),
            (Self::SlidingWindow(p), Some(RateLimitState::SlidingWindow(s))) => {
                Ok(p.evaluate(Some(s), now, cost))
            }
            (_, Some(found)) => Err(StateKindMismatch {
                expected: self.kind(),
                found: found.kind(),
            }),
        }
    }
}

impl From<TokenBucket> for Policy {
    fn from(policy: TokenBucket) -> Self {
        Self::TokenBucket(policy)
    }
}

impl From<SlidingWindow> for Policy {
    fn from(policy: SlidingWindow) -> Self {
        Self::SlidingWindow(policy)
    }
}
