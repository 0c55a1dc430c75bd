//! Per-link health statistics — passive monitoring fed by real request
//! outcomes, consulted by the router for candidate filtering and
//! selection. In-memory only; a restart starts every link fresh.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Consecutive failures at which a link drops out of the candidate set.
const FAILURE_EJECT_THRESHOLD: u32 = 3;
/// A link with a failure newer than any success within this window is
/// also excluded.
const FAILURE_COOLDOWN_SECS: i64 = 300;

/// Snapshot of one link's statistics.
#[derive(Debug, Clone, Serialize, Default)]
pub struct HealthStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub in_flight: u32,
}

impl HealthStats {
    /// Candidate-set exclusion rule.
    fn available_at(&self, now: DateTime<Utc>) -> bool {
        if self.consecutive_failures >= FAILURE_EJECT_THRESHOLD {
            return false;
        }
        if let Some(failure) = self.last_failure {
            let failure_is_latest = match self.last_success {
                Some(success) => failure > success,
                None => true,
            };
            if failure_is_latest
                && (now - failure).num_seconds() < FAILURE_COOLDOWN_SECS
            {
                return false;
            }
        }
        true
    }

    /// Selection score for the load-balanced strategy.
    pub fn load_score(&self) -> u64 {
        self.in_flight as u64 + 10 * self.consecutive_failures as u64
    }
}

/// Concurrent health board keyed by link id.
///
/// Updates happen under the per-entry lock DashMap provides; reads take a
/// snapshot clone, so selection may see slightly stale numbers. That is
/// acceptable; no lock is ever held across an upstream call.
#[derive(Default)]
pub struct HealthBoard {
    entries: DashMap<String, HealthStats>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an attempt as pending before dispatch. Must be paired with
    /// `record_success` or `record_failure`.
    pub fn begin_attempt(&self, link_id: &str) {
        let mut entry = self.entries.entry(link_id.to_string()).or_default();
        entry.in_flight += 1;
    }

    pub fn record_success(&self, link_id: &str, latency_ms: f64) {
        let mut entry = self.entries.entry(link_id.to_string()).or_default();
        entry.in_flight = entry.in_flight.saturating_sub(1);
        entry.total_requests += 1;
        entry.successful_requests += 1;
        entry.consecutive_failures = 0;
        entry.last_success = Some(Utc::now());
        entry.avg_latency_ms = if entry.avg_latency_ms == 0.0 {
            latency_ms
        } else {
            entry.avg_latency_ms * 0.9 + latency_ms * 0.1
        };
    }

    pub fn record_failure(&self, link_id: &str) {
        let mut entry = self.entries.entry(link_id.to_string()).or_default();
        entry.in_flight = entry.in_flight.saturating_sub(1);
        entry.total_requests += 1;
        entry.failed_requests += 1;
        entry.consecutive_failures += 1;
        entry.last_failure = Some(Utc::now());
    }

    pub fn snapshot(&self, link_id: &str) -> HealthStats {
        self.entries
            .get(link_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn is_available(&self, link_id: &str) -> bool {
        self.snapshot(link_id).available_at(Utc::now())
    }

    pub fn all(&self) -> Vec<(String, HealthStats)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_link_is_available() {
        let board = HealthBoard::new();
        assert!(board.is_available("link-a"));
    }

    #[test]
    fn three_consecutive_failures_eject_a_link() {
        let board = HealthBoard::new();
        for _ in 0..2 {
            board.begin_attempt("link-a");
            board.record_failure("link-a");
        }
        assert_eq!(board.snapshot("link-a").consecutive_failures, 2);
        // Two failures within the cooldown already exclude the link; the
        // eject threshold matters once the cooldown has passed.
        board.begin_attempt("link-a");
        board.record_failure("link-a");
        assert!(!board.is_available("link-a"));
    }

    #[test]
    fn success_resets_consecutive_failures_and_availability() {
        let board = HealthBoard::new();
        board.begin_attempt("link-a");
        board.record_failure("link-a");
        assert!(!board.is_available("link-a")); // failure within cooldown

        board.begin_attempt("link-a");
        board.record_success("link-a", 120.0);
        let stats = board.snapshot("link-a");
        assert_eq!(stats.consecutive_failures, 0);
        assert!(board.is_available("link-a"));
        assert!(stats.last_success.is_some());
    }

    #[test]
    fn latency_uses_exponential_moving_average() {
        let board = HealthBoard::new();
        board.begin_attempt("link-a");
        board.record_success("link-a", 100.0);
        assert_eq!(board.snapshot("link-a").avg_latency_ms, 100.0);

        board.begin_attempt("link-a");
        board.record_success("link-a", 200.0);
        // 100 * 0.9 + 200 * 0.1
        assert!((board.snapshot("link-a").avg_latency_ms - 110.0).abs() < 1e-9);
    }

    #[test]
    fn load_score_counts_in_flight_and_failures() {
        let board = HealthBoard::new();
        board.begin_attempt("link-a");
        board.begin_attempt("link-a");
        assert_eq!(board.snapshot("link-a").load_score(), 2);

        board.record_failure("link-a");
        // one still in flight + 10 per consecutive failure
        assert_eq!(board.snapshot("link-a").load_score(), 1 + 10);
    }
}
