//! Rate limiter facade - binds one policy to one state store.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{Decision, RateLimitKey, StorageKey};
use crate::error::{RateLimitError, Result};
use crate::policy::Policy;
use crate::ports::{ApplyMode, AtomicStateStore, Clock, SystemClock};

/// Entry point for callers: `consume`, `peek`, `reset`, `close`.
///
/// A `consume` that fails with [`RateLimitError::Timeout`] may already have
/// been applied. Calling `consume` again is a new, independent attempt and is
/// never deduplicated against the lost one.
#[derive(Clone)]
pub struct RateLimiter {
    policy: Policy,
    store: Arc<dyn AtomicStateStore>,
    clock: Arc<dyn Clock>,
    namespace: String,
    timeout: Option<Duration>,
}

impl RateLimiter {
    pub fn new(policy: impl Into<Policy>, store: Arc<dyn AtomicStateStore>) -> Result<Self> {
        let policy = policy.into();
        if policy.requires_exact_log() && !store.supports_exact_window() {
            return Err(RateLimitError::Configuration(format!(
                "backend '{}' only supports the bucketed sliding window",
                store.backend()
            )));
        }

        Ok(Self {
            namespace: policy.namespace(),
            policy,
            store,
            clock: Arc::new(SystemClock),
            timeout: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the parameter-derived namespace with an explicit one.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(RateLimitError::Configuration(
                "namespace must not be empty".to_string(),
            ));
        }
        self.namespace = namespace;
        Ok(self)
    }

    /// Default deadline applied to every store call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub async fn consume(&self, key: &str, cost: u64) -> Result<Decision> {
        self.run(key, cost, ApplyMode::Consume, self.timeout).await
    }

    pub async fn consume_with_timeout(
        &self,
        key: &str,
        cost: u64,
        timeout: Duration,
    ) -> Result<Decision> {
        self.run(key, cost, ApplyMode::Consume, Some(timeout)).await
    }

    /// What `consume` would currently yield, without persisting anything.
    pub async fn peek(&self, key: &str, cost: u64) -> Result<Decision> {
        self.run(key, cost, ApplyMode::Peek, self.timeout).await
    }

    pub async fn peek_with_timeout(
        &self,
        key: &str,
        cost: u64,
        timeout: Duration,
    ) -> Result<Decision> {
        self.run(key, cost, ApplyMode::Peek, Some(timeout)).await
    }

    /// Return `key` to its freshly initialized condition.
    pub async fn reset(&self, key: &str) -> Result<()> {
        let storage_key = self.storage_key(key)?;
        let fut = self.store.reset(&storage_key);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                RateLimitError::Timeout {
                    backend: self.store.backend(),
                    after: limit,
                }
            })??,
            None => fut.await?,
        }
        tracing::debug!(backend = self.store.backend(), key = %storage_key, "Rate limit state reset");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }

    fn storage_key(&self, key: &str) -> Result<StorageKey> {
        Ok(StorageKey::new(&self.namespace, &RateLimitKey::new(key)?))
    }

    async fn run(
        &self,
        key: &str,
        cost: u64,
        mode: ApplyMode,
        timeout: Option<Duration>,
    ) -> Result<Decision> {
        if let Err(err) = self.policy.ensure_satisfiable(cost) {
            tracing::warn!(key = %key, cost, max = self.policy.max_cost(), "Unsatisfiable rate limit cost");
            return Err(err);
        }

        // Zero cost never mutates, so it is answered as a read.
        let mode = if cost == 0 { ApplyMode::Peek } else { mode };
        let storage_key = self.storage_key(key)?;
        let now = self.clock.now();
        let backend = self.store.backend();

        let fut = self.store.apply(&storage_key, &self.policy, now, cost, mode);
        let decision = match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result?,
                Err(_) if mode == ApplyMode::Peek => {
                    return Err(RateLimitError::BackendUnavailable {
                        backend,
                        message: format!("peek timed out after {limit:?}"),
                    });
                }
                Err(_) => return Err(RateLimitError::Timeout { backend, after: limit }),
            },
            None => fut.await?,
        };

        tracing::debug!(
            backend,
            key = %storage_key,
            cost,
            peek = mode == ApplyMode::Peek,
            allowed = decision.allowed,
            remaining = decision.remaining,
            retry_after = decision.retry_after_seconds,
            "Rate limit decision"
        );

        Ok(decision)
    }
}
