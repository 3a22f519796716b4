//! Sliding window: at most `limit` admissions in any trailing window.

use std::time::Duration;

use crate::domain::{Decision, RateLimitState, WindowEntry, WindowState};
use crate::error::{RateLimitError, Result};

use super::Evaluation;
use super::token_bucket::ttl_millis;

/// Default number of slots a window is divided into.
pub const DEFAULT_SLOTS: u32 = 10;

/// How admissions are aggregated inside the window.
///
/// `Slots(n)` divides the window into `n` equal slots and keeps one counter
/// per slot, so storage stays bounded by `n + 1` counters whatever the
/// request rate. A slot leaves the window as a whole once its *start* is a
/// full window old, which may admit up to one slot width's worth of extra
/// requests at the trailing edge: the admitted count over any trailing
/// `window_seconds` is at most `limit` plus the admissions of a single slot.
///
/// `Exact` keeps one entry per admission instant and has no approximation
/// error. Only the in-process memory store accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPrecision {
    Slots(u32),
    Exact,
}

impl Default for WindowPrecision {
    fn default() -> Self {
        Self::Slots(DEFAULT_SLOTS)
    }
}

/// Validated sliding window parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlidingWindow {
    limit: u64,
    window_seconds: f64,
    precision: WindowPrecision,
}

impl SlidingWindow {
    pub fn new(limit: u64, window_seconds: f64) -> Result<Self> {
        if limit == 0 {
            return Err(RateLimitError::Configuration(
                "sliding window limit must be greater than zero".to_string(),
            ));
        }
        if !(window_seconds.is_finite() && window_seconds > 0.0) {
            return Err(RateLimitError::Configuration(format!(
                "sliding window length must be a positive number of seconds, got {window_seconds}"
            )));
        }

        Ok(Self {
            limit,
            window_seconds,
            precision: WindowPrecision::default(),
        })
    }

    pub fn with_precision(mut self, precision: WindowPrecision) -> Result<Self> {
        if precision == WindowPrecision::Slots(0) {
            return Err(RateLimitError::Configuration(
                "sliding window needs at least one slot".to_string(),
            ));
        }
        self.precision = precision;
        Ok(self)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_seconds(&self) -> f64 {
        self.window_seconds
    }

    pub fn precision(&self) -> WindowPrecision {
        self.precision
    }

    /// Width of one slot in seconds, `None` for the exact log.
    pub fn slot_width(&self) -> Option<f64> {
        match self.precision {
            WindowPrecision::Slots(n) => Some(self.window_seconds / f64::from(n)),
            WindowPrecision::Exact => None,
        }
    }

    /// Start of the slot an admission at `now` is counted in.
    pub fn slot_start(&self, now: f64) -> f64 {
        match self.slot_width() {
            Some(width) => (now / width).floor() * width,
            None => now,
        }
    }

    pub fn namespace(&self) -> String {
        match self.precision {
            WindowPrecision::Slots(n) => {
                format!("sw:l{}:w{}:s{}", self.limit, self.window_seconds, n)
            }
            WindowPrecision::Exact => format!("sw:l{}:w{}:exact", self.limit, self.window_seconds),
        }
    }

    /// Prune, count, compare and record.
    ///
    /// The Redis script mirrors this arithmetic; keep the two in step.
    pub fn evaluate(&self, state: Option<&WindowState>, now: f64, cost: u64) -> Evaluation {
        let mut entries: Vec<WindowEntry> = state
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|e| e.start + self.window_seconds > now)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.start.total_cmp(&b.start));

        let count: u64 = entries.iter().map(|e| e.count).sum();
        let ttl = Duration::from_millis(ttl_millis(self.window_seconds));

        if cost > self.limit {
            return Evaluation {
                decision: Decision {
                    allowed: false,
                    remaining: self.limit.saturating_sub(count) as f64,
                    retry_after_seconds: f64::INFINITY,
                    reset_at: self.reset_at(&entries, now),
                },
                next_state: None,
                ttl,
            };
        }

        if count + cost <= self.limit {
            let next_state = (cost > 0).then(|| {
                let start = self.slot_start(now);
                match entries.binary_search_by(|e| e.start.total_cmp(&start)) {
                    Ok(i) => entries[i].count += cost,
                    Err(i) => entries.insert(i, WindowEntry { start, count: cost }),
                }
                RateLimitState::SlidingWindow(WindowState {
                    entries: entries.clone(),
                })
            });

            return Evaluation {
                decision: Decision {
                    allowed: true,
                    remaining: (self.limit - count - cost) as f64,
                    retry_after_seconds: 0.0,
                    reset_at: self.reset_at(&entries, now),
                },
                next_state,
                ttl,
            };
        }

        // Walk oldest first until enough admissions have aged out to fit `cost`.
        let need = count + cost - self.limit;
        let mut freed = 0;
        let mut retry_after_seconds = 0.0;
        for entry in &entries {
            freed += entry.count;
            if freed >= need {
                retry_after_seconds = (entry.start + self.window_seconds - now).max(0.0);
                break;
            }
        }

        Evaluation {
            decision: Decision {
                allowed: false,
                remaining: (self.limit - count.min(self.limit)) as f64,
                retry_after_seconds,
                reset_at: self.reset_at(&entries, now),
            },
            next_state: None,
            ttl,
        }
    }

    fn reset_at(&self, entries: &[WindowEntry], now: f64) -> f64 {
        entries
            .last()
            .map(|newest| newest.start + self.window_seconds)
            .unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(evaluation: &Evaluation) -> WindowState {
        match &evaluation.next_state {
            Some(RateLimitState::SlidingWindow(state)) => state.clone(),
            other => panic!("expected window state, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(SlidingWindow::new(0, 10.0).is_err());
        assert!(SlidingWindow::new(3, 0.0).is_err());
        assert!(SlidingWindow::new(3, f64::INFINITY).is_err());
        let policy = SlidingWindow::new(3, 10.0).unwrap();
        assert!(policy.with_precision(WindowPrecision::Slots(0)).is_err());
        assert!(policy.with_precision(WindowPrecision::Exact).is_ok());
    }

    #[test]
    fn test_window_scenario() {
        let policy = SlidingWindow::new(3, 10.0).unwrap();
        let mut state = WindowState::default();

        for expected_remaining in [2.0, 1.0, 0.0] {
            let eval = policy.evaluate(Some(&state), 0.0, 1);
            assert!(eval.decision.allowed);
            assert_eq!(eval.decision.remaining, expected_remaining);
            state = window(&eval);
        }
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.total(), 3);

        let eval = policy.evaluate(Some(&state), 5.0, 1);
        assert!(!eval.decision.allowed);
        assert!((eval.decision.retry_after_seconds - 5.0).abs() < 1e-9);
        assert_eq!(eval.decision.reset_at, 10.0);
        assert!(eval.next_state.is_none());

        let eval = policy.evaluate(Some(&state), 11.0, 1);
        assert!(eval.decision.allowed);
        assert_eq!(eval.decision.remaining, 2.0);
        assert_eq!(window(&eval).entries.len(), 1);
    }

    #[test]
    fn test_admissions_are_bucketed_into_slots() {
        let policy = SlidingWindow::new(100, 10.0).unwrap();
        let mut state = WindowState::default();
        for now in [0.2, 0.7, 1.1, 1.9, 2.5] {
            state = window(&policy.evaluate(Some(&state), now, 1));
        }
        let starts: Vec<f64> = state.entries.iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![0.0, 1.0, 2.0]);
        assert_eq!(state.total(), 5);
    }

    #[test]
    fn test_exact_log_keeps_each_instant() {
        let policy = SlidingWindow::new(2, 10.0)
            .unwrap()
            .with_precision(WindowPrecision::Exact)
            .unwrap();
        let state = window(&policy.evaluate(None, 0.5, 1));
        let state = window(&policy.evaluate(Some(&state), 9.5, 1));

        let eval = policy.evaluate(Some(&state), 10.2, 1);
        assert!(!eval.decision.allowed);
        assert!((eval.decision.retry_after_seconds - 0.3).abs() < 1e-9);

        let eval = policy.evaluate(Some(&state), 10.5, 1);
        assert!(eval.decision.allowed);
    }

    #[test]
    fn test_multi_unit_retry_waits_for_enough_capacity() {
        let policy = SlidingWindow::new(4, 10.0).unwrap();
        let mut state = WindowState::default();
        for now in [0.0, 2.0, 4.0, 6.0] {
            state = window(&policy.evaluate(Some(&state), now, 1));
        }

        let eval = policy.evaluate(Some(&state), 7.0, 3);
        assert!(!eval.decision.allowed);
        assert!((eval.decision.retry_after_seconds - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_cost_and_oversized_cost() {
        let policy = SlidingWindow::new(3, 10.0).unwrap();
        let eval = policy.evaluate(None, 42.0, 0);
        assert!(eval.decision.allowed);
        assert_eq!(eval.decision.remaining, 3.0);
        assert_eq!(eval.decision.reset_at, 42.0);
        assert!(eval.next_state.is_none());

        let eval = policy.evaluate(None, 42.0, 4);
        assert!(!eval.decision.allowed);
        assert!(eval.decision.retry_after_seconds.is_infinite());
    }
}
