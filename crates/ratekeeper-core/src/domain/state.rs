//! Persisted per-key state.
//!
//! The JSON encoding of these types is the stored layout for the NATS and
//! Postgres backends; renaming a field resets every counter on upgrade.

use serde::{Deserialize, Serialize};

/// Mutable record kept for one storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateLimitState {
    TokenBucket(BucketState),
    SlidingWindow(WindowState),
}

impl RateLimitState {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenBucket(_) => "token_bucket",
            Self::SlidingWindow(_) => "sliding_window",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    /// Unix seconds.
    pub last_refill_at: f64,
}

/// Admission counts inside the trailing window, ordered by `start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    pub entries: Vec<WindowEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    /// Slot start (bucketed) or admission instant (exact), unix seconds.
    pub start: f64,
    pub count: u64,
}

impl WindowState {
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| e.count).sum()
    }
}

/// State plus the instant after which it no longer affects any decision.
///
/// Used by backends without native per-key expiry; an entry read after
/// `expires_at` is treated as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub state: RateLimitState,
    pub expires_at: f64,
}

impl StoredState {
    pub fn is_live(&self, now: f64) -> bool {
        now < self.expires_at
    }

    /// The state if it has not yet expired.
    pub fn live(self, now: f64) -> Option<RateLimitState> {
        self.is_live(now).then_some(self.state)
    }
}
