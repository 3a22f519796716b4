//! Redis state store - the whole read-modify-write runs as one Lua script.
//!
//! Stored layout (stable across versions):
//! - token bucket: hash `{prefix}:{namespace}:{key}` with fields `tokens`, `ts`
//! - sliding window: hash at the same key with one field per slot index
//!   (`floor(ts / slot_width)`) holding an integer count
//!
//! Both carry a PEXPIRE equal to the time after which they no longer affect
//! any decision, so idle keys disappear without a sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::RwLock;

use ratekeeper_core::domain::{Decision, StorageKey};
use ratekeeper_core::error::{RateLimitError, Result};
use ratekeeper_core::policy::{Policy, SlidingWindow, TokenBucket};
use ratekeeper_core::ports::{ApplyMode, AtomicStateStore};

const BACKEND: &str = "redis";

/// Lua numbers come back from Redis truncated to integers, so every float
/// is returned as a `%.17g` string. Mirrors `TokenBucket::evaluate`.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local initial = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local cost = tonumber(ARGV[5])
local persist = ARGV[6] == '1'

local fields = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(fields[1])
local ts = tonumber(fields[2])
if tokens == nil or ts == nil then
    tokens = initial
    ts = now
end

local elapsed = math.max(0, now - ts)
local refilled = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
local new_tokens = refilled
local retry_after = 0
if refilled >= cost then
    allowed = 1
    new_tokens = refilled - cost
else
    retry_after = math.max(0, (cost - refilled) / rate)
end

local refill_time = (capacity - new_tokens) / rate
if persist and cost > 0 then
    redis.call('HSET', key,
        'tokens', string.format('%.17g', new_tokens),
        'ts', string.format('%.17g', math.max(ts, now)))
    redis.call('PEXPIRE', key, math.max(1, math.ceil(refill_time * 1000)))
end

return {
    allowed,
    string.format('%.17g', new_tokens),
    string.format('%.17g', retry_after),
    string.format('%.17g', now + refill_time)
}
"#;

/// Mirrors `SlidingWindow::evaluate` for the bucketed precision.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local width = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local cost = tonumber(ARGV[5])
local persist = ARGV[6] == '1'
local ttl_ms = tonumber(ARGV[7])

local raw = redis.call('HGETALL', key)
local slots = {}
local stale = {}
local count = 0
for i = 1, #raw, 2 do
    local index = tonumber(raw[i])
    local hits = tonumber(raw[i + 1])
    local start = index * width
    if start + window > now then
        slots[#slots + 1] = {index, start, hits}
        count = count + hits
    else
        stale[#stale + 1] = raw[i]
    end
end
table.sort(slots, function(a, b) return a[1] < b[1] end)

if count + cost <= limit then
    local current = math.floor(now / width)
    local newest = current * width
    if #slots > 0 and slots[#slots][2] > newest then
        newest = slots[#slots][2]
    end
    if persist and cost > 0 then
        if #stale > 0 then
            redis.call('HDEL', key, unpack(stale))
        end
        redis.call('HINCRBY', key, tostring(current), cost)
        redis.call('PEXPIRE', key, ttl_ms)
    end
    local reset_at = now
    if cost > 0 then
        reset_at = newest + window
    elseif #slots > 0 then
        reset_at = slots[#slots][2] + window
    end
    return {
        1,
        string.format('%.17g', limit - count - cost),
        '0',
        string.format('%.17g', reset_at)
    }
end

local need = count + cost - limit
local freed = 0
local retry_after = 0
for _, slot in ipairs(slots) do
    freed = freed + slot[3]
    if freed >= need then
        retry_after = math.max(0, slot[2] + window - now)
        break
    end
end

local remaining = limit - count
if remaining < 0 then
    remaining = 0
end

return {
    0,
    string.format('%.17g', remaining),
    string.format('%.17g', retry_after),
    string.format('%.17g', slots[#slots][2] + window)
}
"#;

/// Redis store configuration.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Key prefix for rate limit keys
    pub key_prefix: String,
    /// Deadline for a single atomic script invocation
    pub atomic_script_timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "ratelimit".to_string(),
            atomic_script_timeout: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("RATE_LIMIT_KEY_PREFIX")
                .unwrap_or_else(|_| "ratelimit".to_string()),
            atomic_script_timeout: Duration::from_millis(
                std::env::var("RATE_LIMIT_SCRIPT_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(250),
            ),
            connect_timeout: Duration::from_secs(
                std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
        }
    }
}

/// Redis-backed store. Uses the connection manager for automatic
/// reconnection and multiplexing; scripts run via EVALSHA with EVAL fallback.
pub struct RedisStateStore {
    conn: RwLock<Option<ConnectionManager>>,
    config: RedisStoreConfig,
    token_bucket: Script,
    sliding_window: Script,
    closed: AtomicBool,
}

impl RedisStateStore {
    pub async fn new(config: RedisStoreConfig) -> Result<Self> {
        if config.key_prefix.is_empty() {
            return Err(RateLimitError::Configuration(
                "redis key prefix must not be empty".to_string(),
            ));
        }

        let client =
            Client::open(config.url.as_str()).map_err(|e| RateLimitError::backend(BACKEND, e))?;

        // Use timeout to prevent hanging if Redis is unreachable
        let conn_manager_fut = ConnectionManager::new(client);
        let conn = tokio::time::timeout(config.connect_timeout, conn_manager_fut)
            .await
            .map_err(|_| RateLimitError::backend(BACKEND, "connection timed out"))?
            .map_err(|e| RateLimitError::backend(BACKEND, e))?;

        tracing::info!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis rate limit store");

        Ok(Self {
            conn: RwLock::new(Some(conn)),
            config,
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            closed: AtomicBool::new(false),
        })
    }

    /// Create from environment configuration.
    pub async fn from_env() -> Result<Self> {
        Self::new(RedisStoreConfig::from_env()).await
    }

    fn make_key(&self, key: &StorageKey) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RateLimitError::backend(BACKEND, "store is closed"));
        }
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| RateLimitError::backend(BACKEND, "store is closed"))
    }

    fn invocation(
        &self,
        redis_key: &str,
        policy: &Policy,
        now: f64,
        cost: u64,
        persist: bool,
    ) -> redis::ScriptInvocation<'_> {
        let persist = if persist { "1" } else { "0" };
        match policy {
            Policy::TokenBucket(p) => {
                token_bucket_invocation(&self.token_bucket, redis_key, p, now, cost, persist)
            }
            Policy::SlidingWindow(p) => {
                sliding_window_invocation(&self.sliding_window, redis_key, p, now, cost, persist)
            }
        }
    }
}

fn token_bucket_invocation<'a>(
    script: &'a Script,
    redis_key: &str,
    policy: &TokenBucket,
    now: f64,
    cost: u64,
    persist: &str,
) -> redis::ScriptInvocation<'a> {
    let mut invocation = script.key(redis_key);
    invocation
        .arg(policy.capacity())
        .arg(policy.refill_rate_per_second())
        .arg(policy.initial_tokens())
        .arg(now)
        .arg(cost)
        .arg(persist);
    invocation
}

fn sliding_window_invocation<'a>(
    script: &'a Script,
    redis_key: &str,
    policy: &SlidingWindow,
    now: f64,
    cost: u64,
    persist: &str,
) -> redis::ScriptInvocation<'a> {
    // Exact precision is refused at limiter construction; a single slot
    // spanning the window is the coarsest fallback.
    let width = policy.slot_width().unwrap_or(policy.window_seconds());
    let ttl_ms = ((policy.window_seconds() * 1000.0).ceil() as u64).max(1);
    let mut invocation = script.key(redis_key);
    invocation
        .arg(policy.limit())
        .arg(policy.window_seconds())
        .arg(width)
        .arg(now)
        .arg(cost)
        .arg(persist)
        .arg(ttl_ms);
    invocation
}

fn parse_reply(reply: (i64, String, String, String)) -> Result<Decision> {
    let (allowed, remaining, retry_after, reset_at) = reply;
    let number = |field: &str, raw: &str| {
        raw.parse::<f64>()
            .map_err(|e| RateLimitError::corrupt(BACKEND, format!("{field} '{raw}': {e}")))
    };

    Ok(Decision {
        allowed: allowed == 1,
        remaining: number("remaining", &remaining)?,
        retry_after_seconds: number("retry_after", &retry_after)?,
        reset_at: number("reset_at", &reset_at)?,
    })
}

#[async_trait]
impl AtomicStateStore for RedisStateStore {
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
        let mut conn = self.connection().await?;
        let redis_key = self.make_key(key);
        let invocation = self.invocation(&redis_key, policy, now, cost, mode == ApplyMode::Consume);

        let timeout = self.config.atomic_script_timeout;
        let reply: (i64, String, String, String) =
            match tokio::time::timeout(timeout, invocation.invoke_async(&mut conn)).await {
                Ok(reply) => reply.map_err(|e| RateLimitError::backend(BACKEND, e))?,
                Err(_) if mode == ApplyMode::Peek => {
                    return Err(RateLimitError::backend(BACKEND, "peek script timed out"));
                }
                Err(_) => {
                    tracing::warn!(key = %redis_key, ?timeout, "Redis rate limit script timed out");
                    return Err(RateLimitError::Timeout {
                        backend: BACKEND,
                        after: timeout,
                    });
                }
            };

        parse_reply(reply)
    }

    async fn reset(&self, key: &StorageKey) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.make_key(key))
            .await
            .map_err(|e| RateLimitError::backend(BACKEND, e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        // Dropping the last manager handle closes the multiplexed connection.
        self.conn.write().await.take();
        tracing::info!(url = %self.config.url, "Redis rate limit store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::join_all;
    use ratekeeper_core::RateLimiter;
    use ratekeeper_core::ports::ManualClock;

    use super::*;
    use crate::InMemoryStateStore;

    async fn get_test_store() -> Option<RedisStateStore> {
        let config = RedisStoreConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6389".to_string()),
            key_prefix: format!("test_ratelimit:{}", uuid::Uuid::new_v4()),
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        };

        RedisStateStore::new(config).await.ok()
    }

    #[test]
    fn test_parse_reply_keeps_fractions() {
        let decision =
            parse_reply((0, "0.5".into(), "1.25".into(), "1700000004.5".into())).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0.5);
        assert_eq!(decision.retry_after_seconds, 1.25);
        assert_eq!(decision.reset_at, 1_700_000_004.5);

        assert!(parse_reply((1, "nan?".into(), "0".into(), "0".into())).is_err());
    }

    #[tokio::test]
    async fn test_redis_token_bucket() {
        let store = match get_test_store().await {
            Some(s) => Arc::new(s),
            None => return,
        };
        let clock = Arc::new(ManualClock::new(1_000.0));
        let limiter = RateLimiter::new(Policy::token_bucket(5.0, 1.0).unwrap(), store)
            .unwrap()
            .with_clock(clock.clone());

        for _ in 0..5 {
            assert!(limiter.consume("user:42", 1).await.unwrap().allowed);
        }
        let decision = limiter.consume("user:42", 1).await.unwrap();
        assert!(!decision.allowed);
        assert!((decision.retry_after_seconds - 1.0).abs() < 1e-9);

        clock.advance(Duration::from_millis(1500));
        let decision = limiter.consume("user:42", 1).await.unwrap();
        assert!(decision.allowed);
        assert!((decision.remaining - 0.5).abs() < 1e-9);

        limiter.reset("user:42").await.unwrap();
        assert_eq!(limiter.peek("user:42", 1).await.unwrap().remaining, 4.0);
    }

    #[tokio::test]
    async fn test_redis_sliding_window() {
        let store = match get_test_store().await {
            Some(s) => Arc::new(s),
            None => return,
        };
        let clock = Arc::new(ManualClock::new(0.0));
        let limiter = RateLimiter::new(Policy::sliding_window(3, 10.0).unwrap(), store)
            .unwrap()
            .with_clock(clock.clone());

        for _ in 0..3 {
            assert!(limiter.consume("k", 1).await.unwrap().allowed);
        }
        clock.set(5.0);
        let decision = limiter.consume("k", 1).await.unwrap();
        assert!(!decision.allowed);
        assert!((decision.retry_after_seconds - 5.0).abs() < 1e-9);

        clock.set(11.0);
        assert!(limiter.consume("k", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_redis_matches_memory_oracle() {
        let store = match get_test_store().await {
            Some(s) => Arc::new(s),
            None => return,
        };

        for policy in [
            Policy::token_bucket(4.0, 0.75).unwrap(),
            Policy::sliding_window(4, 6.0).unwrap(),
        ] {
            let clock = Arc::new(ManualClock::new(500.0));
            let redis = RateLimiter::new(policy, store.clone())
                .unwrap()
                .with_clock(clock.clone());
            let memory = RateLimiter::new(policy, Arc::new(InMemoryStateStore::new()))
                .unwrap()
                .with_clock(clock.clone());

            for step in 0..60u64 {
                clock.advance(Duration::from_millis(137 * (step % 7)));
                let cost = 1 + step % 2;
                let expected = memory.consume("oracle", cost).await.unwrap();
                let actual = redis.consume("oracle", cost).await.unwrap();
                assert_eq!(actual.allowed, expected.allowed, "step {step}");
                assert!((actual.remaining - expected.remaining).abs() < 1e-9);
            }
        }
    }

    #[tokio::test]
    async fn test_redis_concurrent_consumers() {
        let store = match get_test_store().await {
            Some(s) => Arc::new(s),
            None => return,
        };
        let clock = Arc::new(ManualClock::new(0.0));
        let limiter = RateLimiter::new(Policy::sliding_window(25, 60.0).unwrap(), store)
            .unwrap()
            .with_clock(clock);

        let calls = (0..200).map(|_| {
            let limiter = limiter.clone();
            async move { limiter.consume("hot", 1).await.unwrap().allowed }
        });
        let admitted = join_all(calls).await.into_iter().filter(|a| *a).count();
        assert_eq!(admitted, 25);
    }
}
