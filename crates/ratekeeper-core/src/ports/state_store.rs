//! Atomic state store port.

use async_trait::async_trait;

use crate::domain::{Decision, StorageKey};
use crate::error::Result;
use crate::policy::Policy;

/// Whether the evaluated state is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Read, evaluate and persist as one indivisible step.
    Consume,
    /// Read and evaluate only. Nothing observable by other callers changes.
    Peek,
}

/// Atomic state store trait - the "atomic apply" capability every backend
/// provides with its own concurrency primitive.
///
/// Implementations never cache state between calls: each `apply` reads the
/// store afresh so decisions are never based on superseded data.
#[async_trait]
pub trait AtomicStateStore: Send + Sync {
    /// Short backend name used in errors and logs.
    fn backend(&self) -> &'static str;

    /// Whether the exact timestamp-log sliding window may be stored here.
    fn supports_exact_window(&self) -> bool {
        false
    }

    /// Evaluate `policy` for `key` at `now` and, in `Consume` mode, persist
    /// the resulting state. Absent or expired state is a fresh key.
    async fn apply(
        &self,
        key: &StorageKey,
        policy: &Policy,
        now: f64,
        cost: u64,
        mode: ApplyMode,
    ) -> Result<Decision>;

    /// Delete the state for `key`.
    async fn reset(&self, key: &StorageKey) -> Result<()>;

    /// Release pooled connections. Later calls fail as unavailable.
    async fn close(&self) -> Result<()>;
}
