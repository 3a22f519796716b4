use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a `consume` or `peek`. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    /// Tokens (token bucket) or count headroom (sliding window) left.
    pub remaining: f64,
    /// Zero when allowed; otherwise the wait until the same cost fits.
    pub retry_after_seconds: f64,
    /// Unix seconds at which the key is back to full capacity / zero count.
    pub reset_at: f64,
}

impl Decision {
    pub fn retry_after(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_after_seconds).unwrap_or(Duration::MAX)
    }

    pub fn reset_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros((self.reset_at * 1_000_000.0).round() as i64)
    }
}
