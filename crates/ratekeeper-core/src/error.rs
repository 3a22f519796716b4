//! Rate limiting error types.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the rate limiter and its state stores.
///
/// Backend failures are always propagated. Whether to admit or deny a
/// request when the store is unreachable is the caller's decision.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Invalid policy or store parameters. Raised at construction only.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The store could not be reached or refused the operation.
    /// The request was not applied.
    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable {
        backend: &'static str,
        message: String,
    },

    /// A client-side deadline fired while the request may have been in flight.
    /// The state mutation may or may not have been applied.
    #[error("Backend '{backend}' timed out after {after:?}; outcome unknown")]
    Timeout {
        backend: &'static str,
        after: Duration,
    },

    /// Optimistic concurrency conflicts persisted past the retry budget.
    #[error("Backend '{backend}' gave up after {attempts} conflicting writes")]
    ConcurrencyExhausted {
        backend: &'static str,
        attempts: u32,
    },

    /// The requested cost can never be satisfied by the configured policy.
    #[error("Cost {cost} exceeds the policy maximum of {max}")]
    Unsatisfiable { cost: u64, max: f64 },

    /// A persisted value could not be decoded.
    #[error("Corrupt state in backend '{backend}': {message}")]
    CorruptState {
        backend: &'static str,
        message: String,
    },
}

impl RateLimitError {
    pub fn backend(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable {
            backend,
            message: err.to_string(),
        }
    }

    pub fn corrupt(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Self::CorruptState {
            backend,
            message: err.to_string(),
        }
    }

    /// Transient failures where a fresh attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::Timeout { .. } | Self::ConcurrencyExhausted { .. }
        )
    }

    /// Whether the failed call might still have consumed capacity.
    pub fn may_have_applied(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, RateLimitError>;
