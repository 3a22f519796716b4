//! # Ratekeeper Stress Harness
//!
//! Fires concurrent `consume` calls at one key from one or more processes
//! and checks the admitted total against what the policy allows.
//!
//! With `STRESS_PROCESSES > 1` the coordinator re-executes itself as worker
//! processes sharing `STRESS_KEY`; each worker prints a JSON [`Report`] on
//! stdout.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, bail};
use futures::future::join_all;
use ratekeeper_core::{Policy, RateLimiter};
use ratekeeper_infra::{BackendConfig, BackendKind, PolicyConfig, connect_store};
use serde::{Deserialize, Serialize};

mod config;
mod telemetry;

use config::{HarnessConfig, WORKER_ENV};

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
struct Report {
    admitted: u64,
    rejected: u64,
    /// Failed calls that did not consume capacity.
    errors: u64,
    /// Timed-out calls that may have consumed capacity.
    ambiguous: u64,
}

impl Report {
    fn merge(&mut self, other: Report) {
        self.admitted += other.admitted;
        self.rejected += other.rejected;
        self.errors += other.errors;
        self.ambiguous += other.ambiguous;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_telemetry();

    let config = HarnessConfig::from_env();
    let policy = PolicyConfig::from_env()
        .build()
        .context("invalid rate limit policy")?;
    let backend = BackendConfig::from_env().context("invalid rate limit backend")?;

    if HarnessConfig::is_worker() {
        let report = run_worker(&config, policy, backend).await?;
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    coordinate(config, policy, backend).await
}

async fn limiter(policy: Policy, backend: BackendConfig) -> anyhow::Result<RateLimiter> {
    let store = connect_store(backend)
        .await
        .context("failed to connect rate limit store")?;
    Ok(RateLimiter::new(policy, store)?)
}

async fn run_worker(
    config: &HarnessConfig,
    policy: Policy,
    backend: BackendConfig,
) -> anyhow::Result<Report> {
    let limiter = limiter(policy, backend)
        .await?
        .with_timeout(config.call_timeout);

    let calls = (0..config.concurrency).map(|_| limiter.consume(&config.key, 1));
    let mut report = Report::default();
    for outcome in join_all(calls).await {
        match outcome {
            Ok(decision) if decision.allowed => report.admitted += 1,
            Ok(_) => report.rejected += 1,
            Err(err) if err.may_have_applied() => {
                tracing::warn!(error = %err, "Consume outcome unknown");
                report.ambiguous += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Consume failed");
                report.errors += 1;
            }
        }
    }

    limiter.close().await?;
    Ok(report)
}

async fn spawn_workers(config: &HarnessConfig) -> anyhow::Result<Report> {
    let exe = std::env::current_exe().context("cannot locate harness executable")?;

    let children = (0..config.processes)
        .map(|_| {
            tokio::process::Command::new(&exe)
                .env(WORKER_ENV, "1")
                .env("STRESS_KEY", &config.key)
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
        })
        .collect::<Result<Vec<_>, _>>()
        .context("failed to spawn worker")?;

    let mut total = Report::default();
    for (worker, child) in children.into_iter().enumerate() {
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!("worker {worker} exited with {}", output.status);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .last()
            .with_context(|| format!("worker {worker} produced no report"))?;
        let report: Report = serde_json::from_str(line)
            .with_context(|| format!("worker {worker} produced an invalid report"))?;
        tracing::debug!(worker, ?report, "Worker finished");
        total.merge(report);
    }
    Ok(total)
}

/// Admission range for `calls` unit consumes made over `elapsed` seconds,
/// or `None` when the run outlasted a sliding window.
fn admission_bounds(policy: &Policy, calls: u64, elapsed: f64) -> Option<(u64, f64)> {
    match policy {
        Policy::TokenBucket(bucket) => {
            let lower = calls.min(bucket.initial_tokens().floor() as u64);
            let upper = bucket.initial_tokens() + bucket.refill_rate_per_second() * elapsed;
            Some((lower, upper))
        }
        Policy::SlidingWindow(window) => (elapsed < window.window_seconds())
            .then(|| (calls.min(window.limit()), window.limit() as f64)),
    }
}

async fn coordinate(
    config: HarnessConfig,
    policy: Policy,
    backend: BackendConfig,
) -> anyhow::Result<()> {
    if config.processes > 1 && backend.kind() == BackendKind::Memory {
        bail!("the memory backend is per process; pick redis, nats or postgres for STRESS_PROCESSES > 1");
    }

    tracing::info!(
        backend = ?backend.kind(),
        policy = %policy.namespace(),
        key = %config.key,
        processes = config.processes,
        concurrency = config.concurrency,
        "Starting stress run"
    );

    if backend.kind() != BackendKind::Memory {
        let limiter = limiter(policy, backend.clone()).await?;
        limiter.reset(&config.key).await?;
        limiter.close().await?;
    }

    let started = Instant::now();
    let report = if config.processes == 1 {
        run_worker(&config, policy, backend).await?
    } else {
        spawn_workers(&config).await?
    };
    let elapsed = started.elapsed().as_secs_f64();

    let calls = (config.concurrency * config.processes) as u64;
    tracing::info!(
        admitted = report.admitted,
        rejected = report.rejected,
        errors = report.errors,
        ambiguous = report.ambiguous,
        elapsed_secs = elapsed,
        "Stress run finished"
    );

    let Some((lower, upper)) = admission_bounds(&policy, calls, elapsed) else {
        tracing::warn!("Run outlasted the window; admission bound not checked");
        return Ok(());
    };

    if report.admitted as f64 > upper + 1e-9 {
        bail!(
            "over-admission: {} admitted, policy allows at most {upper:.2}",
            report.admitted
        );
    }
    if report.errors == 0 && report.ambiguous == 0 && report.admitted < lower {
        bail!(
            "under-admission: {} admitted, expected at least {lower}",
            report.admitted
        );
    }

    tracing::info!(lower, upper, "Admitted count within policy bounds");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_bounds_include_refill() {
        let policy = Policy::token_bucket(10.0, 2.0).unwrap();
        let (lower, upper) = admission_bounds(&policy, 100, 1.5).unwrap();
        assert_eq!(lower, 10);
        assert!((upper - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_sliding_window_bounds() {
        let policy = Policy::sliding_window(25, 60.0).unwrap();
        assert_eq!(admission_bounds(&policy, 10, 1.0), Some((10, 25.0)));
        assert_eq!(admission_bounds(&policy, 10, 61.0), None);
    }

    #[test]
    fn test_reports_merge() {
        let mut total = Report::default();
        total.merge(Report {
            admitted: 3,
            rejected: 7,
            errors: 0,
            ambiguous: 1,
        });
        total.merge(Report {
            admitted: 2,
            rejected: 8,
            errors: 1,
            ambiguous: 0,
        });
        assert_eq!(total.admitted, 5);
        assert_eq!(total.rejected, 15);
        assert_eq!(total.errors + total.ambiguous, 2);
    }
}
