//! Harness configuration loaded from environment variables.

use std::env;
use std::time::Duration;

/// Set on spawned worker processes.
pub const WORKER_ENV: &str = "STRESS_WORKER";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Concurrent consume calls issued by each process.
    pub concurrency: usize,
    /// Worker processes sharing one key.
    pub processes: usize,
    /// Key every call targets. Generated per run when unset.
    pub key: String,
    /// Per-call deadline.
    pub call_timeout: Duration,
}

impl HarnessConfig {
    pub fn from_env() -> Self {
        Self {
            concurrency: env::var("STRESS_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
            processes: env::var("STRESS_PROCESSES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1)
                .max(1),
            key: env::var("STRESS_KEY")
                .unwrap_or_else(|_| format!("stress:{}", uuid::Uuid::new_v4())),
            call_timeout: Duration::from_millis(
                env::var("STRESS_CALL_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2_000),
            ),
        }
    }

    pub fn is_worker() -> bool {
        env::var(WORKER_ENV).is_ok()
    }
}
