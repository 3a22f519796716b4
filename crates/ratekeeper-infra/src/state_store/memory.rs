//! In-memory state store - a single-process authority.
//!
//! Exact and lock-based, but provides no guarantee across processes: two
//! instances each holding their own store each admit the full quota.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use ratekeeper_core::domain::{Decision, StorageKey, StoredState};
use ratekeeper_core::error::{RateLimitError, Result};
use ratekeeper_core::policy::Policy;
use ratekeeper_core::ports::{ApplyMode, AtomicStateStore};

const BACKEND: &str = "memory";

type Slot = Arc<Mutex<Option<StoredState>>>;

/// In-memory store with one async mutex per key, so unrelated keys never
/// wait on each other. Supports the exact sliding-window log.
pub struct InMemoryStateStore {
    slots: RwLock<HashMap<String, Slot>>,
    closed: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of keys currently tracked, expired or not.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every key whose state expired before `now`. Returns how many
    /// were removed.
    pub async fn purge_expired(&self, now: f64) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        // Slots are only cloned under the map lock, so a count of one means
        // no caller is between lookup and update.
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => guard.as_ref().is_some_and(|s| s.is_live(now)),
                Err(_) => true,
            }
        });
        let removed = before - slots.len();
        if removed > 0 {
            tracing::debug!(removed, "Purged expired rate limit state");
        }
        removed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RateLimitError::backend(BACKEND, "store is closed"));
        }
        Ok(())
    }

    async fn existing_slot(&self, key: &str) -> Option<Slot> {
        self.slots.read().await.get(key).cloned()
    }

    async fn slot(&self, key: &str) -> Slot {
        if let Some(slot) = self.existing_slot(key).await {
            return slot;
        }
        let mut slots = self.slots.write().await;
        slots.entry(key.to_string()).or_default().clone()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStateStore for InMemoryStateStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn supports_exact_window(&self) -> bool {
        true
    }

    async fn apply(
        &self,
        key: &StorageKey,
        policy: &Policy,
        now: f64,
        cost: u64,
        mode: ApplyMode,
    ) -> Result<Decision> {
        self.ensure_open()?;

        let slot = match mode {
            ApplyMode::Consume => self.slot(key.as_str()).await,
            ApplyMode::Peek => match self.existing_slot(key.as_str()).await {
                Some(slot) => slot,
                None => {
                    return policy
                        .evaluate(None, now, cost)
                        .map(|eval| eval.decision)
                        .map_err(|e| RateLimitError::corrupt(BACKEND, e));
                }
            },
        };

        let mut stored = slot.lock().await;
        let current = stored.clone().and_then(|s| s.live(now));
        let eval = policy
            .evaluate(current.as_ref(), now, cost)
            .map_err(|e| RateLimitError::corrupt(BACKEND, e))?;

        if mode == ApplyMode::Consume
            && let Some(state) = eval.next_state
        {
            *stored = Some(StoredState {
                state,
                expires_at: now + eval.ttl.as_secs_f64(),
            });
        }

        Ok(eval.decision)
    }

    async fn reset(&self, key: &StorageKey) -> Result<()> {
        self.ensure_open()?;
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get(key.as_str()).cloned() else {
            return Ok(());
        };
        *slot.lock().await = None;
        // Held by the map and by us only: no caller is mid-update, so the
        // entry can go. Otherwise the cleared slot stays for those callers.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key.as_str());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.slots.write().await.clear();
        tracing::info!("In-memory rate limit store closed");
        Ok(())
    }
}
