//! NATS JetStream KV state store - optimistic concurrency on entry revisions.
//!
//! Each `consume` reads the entry with its revision, evaluates client-side,
//! then writes back conditioned on that revision. A conflicting writer
//! forces the whole read-evaluate-write cycle to run again, up to
//! `max_cas_retries` times.
//!
//! Values are JSON [`StoredState`]; KV keys are the hex-encoded storage key.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use tokio::sync::RwLock;

use ratekeeper_core::domain::{Decision, StorageKey, StoredState};
use ratekeeper_core::error::{RateLimitError, Result};
use ratekeeper_core::policy::Policy;
use ratekeeper_core::ports::{ApplyMode, AtomicStateStore};

const BACKEND: &str = "nats";

/// NATS store configuration.
#[derive(Debug, Clone)]
pub struct NatsStoreConfig {
    /// Server URLs (e.g., nats://localhost:4222)
    pub servers: Vec<String>,
    /// JetStream KV bucket holding the state
    pub bucket_name: String,
    /// Extra read-evaluate-write cycles allowed after a revision conflict
    pub max_cas_retries: u32,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Bucket-wide max age for entries when the bucket is created here
    pub max_age: Option<Duration>,
}

impl Default for NatsStoreConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            bucket_name: "ratelimit".to_string(),
            max_cas_retries: 16,
            connect_timeout: Duration::from_secs(5),
            max_age: Some(Duration::from_secs(86_400)),
        }
    }
}

impl NatsStoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            servers: std::env::var("NATS_SERVERS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.servers),
            bucket_name: std::env::var("NATS_KV_BUCKET").unwrap_or(defaults.bucket_name),
            max_cas_retries: std::env::var("NATS_MAX_CAS_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_cas_retries),
            connect_timeout: std::env::var("NATS_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            max_age: match std::env::var("NATS_KV_MAX_AGE_SECS").ok().and_then(|s| s.parse().ok()) {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.max_age,
            },
        }
    }
}

/// Latest entry of a key. `value` is `None` for delete/purge markers.
#[derive(Debug, Clone)]
pub(crate) struct KvEntry {
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

#[derive(Debug)]
pub(crate) enum CasError {
    /// Another writer got there first.
    Conflict,
    Failed(RateLimitError),
}

/// The versioned key-value operations the CAS loop needs.
#[async_trait]
pub(crate) trait RevisionedKv: Send + Sync {
    async fn entry(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Write only if the key has no live entry.
    async fn create(&self, key: &str, value: Vec<u8>) -> std::result::Result<(), CasError>;

    /// Write only if `revision` is still the key's latest.
    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        revision: u64,
    ) -> std::result::Result<(), CasError>;

    async fn delete(&self, key: &str) -> Result<()>;
}

#[async_trait]
impl RevisionedKv for kv::Store {
    async fn entry(&self, key: &str) -> Result<Option<KvEntry>> {
        let entry = kv::Store::entry(self, key)
            .await
            .map_err(|e| RateLimitError::backend(BACKEND, e))?;

        Ok(entry.map(|e| KvEntry {
            value: matches!(e.operation, kv::Operation::Put).then(|| e.value.to_vec()),
            revision: e.revision,
        }))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> std::result::Result<(), CasError> {
        match kv::Store::create(self, key, value.into()).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => Err(CasError::Conflict),
            Err(e) => Err(CasError::Failed(RateLimitError::backend(BACKEND, e))),
        }
    }

    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        revision: u64,
    ) -> std::result::Result<(), CasError> {
        match kv::Store::update(self, key, value.into(), revision).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == kv::UpdateErrorKind::WrongLastRevision => Err(CasError::Conflict),
            Err(e) => Err(CasError::Failed(RateLimitError::backend(BACKEND, e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        kv::Store::delete(self, key)
            .await
            .map_err(|e| RateLimitError::backend(BACKEND, e))
    }
}

/// NATS JetStream KV backed store.
pub struct NatsStateStore {
    kv: RwLock<Option<Arc<dyn RevisionedKv>>>,
    client: Option<async_nats::Client>,
    config: NatsStoreConfig,
}

impl NatsStateStore {
    pub async fn new(config: NatsStoreConfig) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(RateLimitError::Configuration(
                "at least one NATS server is required".to_string(),
            ));
        }
        if config.bucket_name.is_empty() {
            return Err(RateLimitError::Configuration(
                "NATS KV bucket name must not be empty".to_string(),
            ));
        }

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.connect_timeout)
            .connect(config.servers.join(","))
            .await
            .map_err(|e| RateLimitError::backend(BACKEND, e))?;

        let js = jetstream::new(client.clone());
        let store = match js.get_key_value(config.bucket_name.as_str()).await {
            Ok(store) => store,
            Err(_) => js
                .create_key_value(kv::Config {
                    bucket: config.bucket_name.clone(),
                    history: 1,
                    max_age: config.max_age.unwrap_or_default(),
                    ..Default::default()
                })
                .await
                .map_err(|e| RateLimitError::backend(BACKEND, e))?,
        };

        tracing::info!(
            servers = ?config.servers,
            bucket = %config.bucket_name,
            max_cas_retries = config.max_cas_retries,
            "Connected to NATS rate limit store"
        );

        Ok(Self {
            kv: RwLock::new(Some(Arc::new(store))),
            client: Some(client),
            config,
        })
    }

    /// Create from environment configuration.
    pub async fn from_env() -> Result<Self> {
        Self::new(NatsStoreConfig::from_env()).await
    }

    #[cfg(test)]
    pub(crate) fn with_kv(kv: Arc<dyn RevisionedKv>, config: NatsStoreConfig) -> Self {
        Self {
            kv: RwLock::new(Some(kv)),
            client: None,
            config,
        }
    }

    async fn kv(&self) -> Result<Arc<dyn RevisionedKv>> {
        self.kv
            .read()
            .await
            .clone()
            .ok_or_else(|| RateLimitError::backend(BACKEND, "store is closed"))
    }
}

/// KV keys only allow `[-/_=.a-zA-Z0-9]`, so the storage key is hex encoded.
fn kv_key(key: &StorageKey) -> String {
    key.as_str().bytes().map(|b| format!("{b:02x}")).collect()
}

fn decode(bytes: &[u8]) -> Result<StoredState> {
    serde_json::from_slice(bytes).map_err(|e| RateLimitError::corrupt(BACKEND, e))
}

#[async_trait]
impl AtomicStateStore for NatsStateStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn apply(
        &self,
        key: &StorageKey,
        policy: &Policy,
        now: f64,
        cost: u64,
        mode: ApplyMode,
    ) -> Result<Decision> {
        let kv = self.kv().await?;
        let kv_key = kv_key(key);
        let attempts = self.config.max_cas_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let entry = kv.entry(&kv_key).await?;
            let revision = entry.as_ref().map(|e| e.revision);
            let current = match entry.and_then(|e| e.value) {
                Some(bytes) => decode(&bytes)?.live(now),
                None => None,
            };

            let eval = policy
                .evaluate(current.as_ref(), now, cost)
                .map_err(|e| RateLimitError::corrupt(BACKEND, e))?;

            // Reads and unchanged states need no write, so no CAS either.
            let state = match (mode, eval.next_state) {
                (ApplyMode::Consume, Some(state)) => state,
                _ => return Ok(eval.decision),
            };

            let payload = serde_json::to_vec(&StoredState {
                state,
                expires_at: now + eval.ttl.as_secs_f64(),
            })
            .map_err(|e| RateLimitError::corrupt(BACKEND, e))?;

            let written = match revision {
                Some(revision) => kv.update(&kv_key, payload, revision).await,
                None => kv.create(&kv_key, payload).await,
            };

            match written {
                Ok(()) => return Ok(eval.decision),
                Err(CasError::Conflict) => {
                    tracing::debug!(key = %key, attempt, revision, "NATS CAS conflict, retrying");
                }
                Err(CasError::Failed(err)) => return Err(err),
            }
        }

        tracing::warn!(key = %key, attempts, "NATS CAS retries exhausted");
        Err(RateLimitError::ConcurrencyExhausted {
            backend: BACKEND,
            attempts,
        })
    }

    async fn reset(&self, key: &StorageKey) -> Result<()> {
        self.kv().await?.delete(&kv_key(key)).await
    }

    async fn close(&self) -> Result<()> {
        self.kv.write().await.take();
        if let Some(client) = &self.client {
            client
                .flush()
                .await
                .map_err(|e| RateLimitError::backend(BACKEND, e))?;
        }
        tracing::info!(bucket = %self.config.bucket_name, "NATS rate limit store closed");
        Ok(())
    }
}
