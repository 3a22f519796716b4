//! State store implementations - one [`AtomicStateStore`] per backend.
//!
//! [`AtomicStateStore`]: ratekeeper_core::ports::AtomicStateStore

mod memory;

pub use memory::InMemoryStateStore;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::{RedisStateStore, RedisStoreConfig};

#[cfg(feature = "nats")]
mod nats;
#[cfg(feature = "nats")]
pub use nats::{NatsStateStore, NatsStoreConfig};

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresStateStore, PostgresStoreConfig};
