//! Domain model - keys, persisted state and decisions.

mod decision;
mod key;
mod state;

pub use decision::Decision;
pub use key::{RateLimitKey, StorageKey};
pub use state::{BucketState, RateLimitState, StoredState, WindowEntry, WindowState};
