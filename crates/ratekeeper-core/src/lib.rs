//! # Ratekeeper Core
//!
//! The decision layer of Ratekeeper: token bucket and sliding window
//! policies, the per-key state model, and the [`ports::AtomicStateStore`]
//! port every backend implements. No infrastructure dependencies.

pub mod domain;
pub mod error;
pub mod limiter;
pub mod policy;
pub mod ports;

pub use domain::{Decision, RateLimitKey, RateLimitState, StorageKey};
pub use error::RateLimitError;
pub use limiter::RateLimiter;
pub use policy::{Policy, SlidingWindow, TokenBucket, WindowPrecision};
