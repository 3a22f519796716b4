//! Backend and policy selection from the environment.

use std::str::FromStr;
use std::sync::Arc;

use ratekeeper_core::error::{RateLimitError, Result};
use ratekeeper_core::policy::{Policy, SlidingWindow, TokenBucket, WindowPrecision};
use ratekeeper_core::ports::AtomicStateStore;

use crate::state_store::InMemoryStateStore;
#[cfg(feature = "nats")]
use crate::state_store::{NatsStateStore, NatsStoreConfig};
#[cfg(feature = "postgres")]
use crate::state_store::{PostgresStateStore, PostgresStoreConfig};
#[cfg(feature = "redis")]
use crate::state_store::{RedisStateStore, RedisStoreConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Redis,
    Nats,
    Postgres,
}

impl FromStr for BackendKind {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "nats" => Ok(Self::Nats),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(RateLimitError::Configuration(format!(
                "unknown rate limit backend '{other}'"
            ))),
        }
    }
}

/// Which store to connect to, with its settings.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Memory,
    #[cfg(feature = "redis")]
    Redis(RedisStoreConfig),
    #[cfg(feature = "nats")]
    Nats(NatsStoreConfig),
    #[cfg(feature = "postgres")]
    Postgres(PostgresStoreConfig),
}

impl BackendConfig {
    /// Read `RATE_LIMIT_BACKEND` (default `memory`) and that backend's settings.
    pub fn from_env() -> Result<Self> {
        let kind = std::env::var("RATE_LIMIT_BACKEND")
            .map(|v| v.parse())
            .unwrap_or(Ok(BackendKind::Memory))?;
        Self::for_kind(kind)
    }

    /// Environment settings for a given backend.
    pub fn for_kind(kind: BackendKind) -> Result<Self> {
        match kind {
            BackendKind::Memory => Ok(Self::Memory),
            #[cfg(feature = "redis")]
            BackendKind::Redis => Ok(Self::Redis(RedisStoreConfig::from_env())),
            #[cfg(feature = "nats")]
            BackendKind::Nats => Ok(Self::Nats(NatsStoreConfig::from_env())),
            #[cfg(feature = "postgres")]
            BackendKind::Postgres => Ok(Self::Postgres(PostgresStoreConfig::from_env())),
            #[allow(unreachable_patterns)]
            other => Err(RateLimitError::Configuration(format!(
                "backend {other:?} is not compiled in"
            ))),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Memory => BackendKind::Memory,
            #[cfg(feature = "redis")]
            Self::Redis(_) => BackendKind::Redis,
            #[cfg(feature = "nats")]
            Self::Nats(_) => BackendKind::Nats,
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => BackendKind::Postgres,
        }
    }
}

/// Connect the configured store.
///
/// The Postgres table must already exist (see the `migration` app or
/// `PostgresStateStore::ensure_schema`).
pub async fn connect_store(config: BackendConfig) -> Result<Arc<dyn AtomicStateStore>> {
    tracing::info!(backend = ?config.kind(), "Connecting rate limit store");

    let store: Arc<dyn AtomicStateStore> = match config {
        BackendConfig::Memory => Arc::new(InMemoryStateStore::new()),
        #[cfg(feature = "redis")]
        BackendConfig::Redis(config) => Arc::new(RedisStateStore::new(config).await?),
        #[cfg(feature = "nats")]
        BackendConfig::Nats(config) => Arc::new(NatsStateStore::new(config).await?),
        #[cfg(feature = "postgres")]
        BackendConfig::Postgres(config) => Arc::new(PostgresStateStore::new(config).await?),
    };
    Ok(store)
}

/// Policy parameters as read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    /// `token_bucket` or `sliding_window`
    pub policy: String,
    pub capacity: f64,
    pub refill_per_second: f64,
    pub initial_tokens: Option<f64>,
    pub limit: u64,
    pub window_seconds: f64,
    /// Slot count, or `exact` for the per-admission log.
    pub slots: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policy: "token_bucket".to_string(),
            capacity: 100.0,
            refill_per_second: 10.0,
            initial_tokens: None,
            limit: 100,
            window_seconds: 60.0,
            slots: "10".to_string(),
        }
    }
}

impl PolicyConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| std::env::var(name).ok().and_then(|s| s.parse().ok());

        Self {
            policy: std::env::var("RATE_LIMIT_POLICY").unwrap_or(defaults.policy),
            capacity: parsed("RATE_LIMIT_CAPACITY").unwrap_or(defaults.capacity),
            refill_per_second: parsed("RATE_LIMIT_REFILL_PER_SEC")
                .unwrap_or(defaults.refill_per_second),
            initial_tokens: parsed("RATE_LIMIT_INITIAL_TOKENS"),
            limit: std::env::var("RATE_LIMIT_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.limit),
            window_seconds: parsed("RATE_LIMIT_WINDOW_SECS").unwrap_or(defaults.window_seconds),
            slots: std::env::var("RATE_LIMIT_SLOTS").unwrap_or(defaults.slots),
        }
    }

    /// Validate and build the policy.
    pub fn build(&self) -> Result<Policy> {
        match self.policy.trim().to_lowercase().as_str() {
            "token_bucket" => {
                let mut bucket = TokenBucket::new(self.capacity, self.refill_per_second)?;
                if let Some(initial) = self.initial_tokens {
                    bucket = bucket.with_initial_tokens(initial)?;
                }
                Ok(bucket.into())
            }
            "sliding_window" => {
                let precision = if self.slots.trim().eq_ignore_ascii_case("exact") {
                    WindowPrecision::Exact
                } else {
                    let slots = self.slots.trim().parse().map_err(|_| {
                        RateLimitError::Configuration(format!(
                            "RATE_LIMIT_SLOTS must be a slot count or 'exact', got '{}'",
                            self.slots
                        ))
                    })?;
                    WindowPrecision::Slots(slots)
                };
                Ok(SlidingWindow::new(self.limit, self.window_seconds)?
                    .with_precision(precision)?
                    .into())
            }
            other => Err(RateLimitError::Configuration(format!(
                "unknown rate limit policy '{other}'"
            ))),
        }
    }
}
