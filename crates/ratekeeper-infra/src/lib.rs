//! # Ratekeeper Infrastructure
//!
//! Concrete [`AtomicStateStore`](ratekeeper_core::ports::AtomicStateStore)
//! implementations and the environment-driven backend selector.
//!
//! ## Feature Flags
//!
//! - `full` (default) - All backends enabled
//! - `minimal` - No external dependencies, in-memory only
//! - `postgres` - PostgreSQL row-lock store via SeaORM
//! - `redis` - Redis server-side script store
//! - `nats` - NATS JetStream KV compare-and-swap store

pub mod backend;
pub mod state_store;

pub use backend::{BackendConfig, BackendKind, PolicyConfig, connect_store};

// Re-exports - In-Memory
pub use state_store::InMemoryStateStore;

// Re-exports - Networked
#[cfg(feature = "nats")]
pub use state_store::{NatsStateStore, NatsStoreConfig};
#[cfg(feature = "postgres")]
pub use state_store::{PostgresStateStore, PostgresStoreConfig};
#[cfg(feature = "redis")]
pub use state_store::{RedisStateStore, RedisStoreConfig};
