//! Evaluation metrics
//!
//! Counters go to the global `metrics` recorder for scraping, and to an
//! [`EvaluationStats`] collector that a job summarises when it finishes.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use watchtower_core::{ExclusionEventType, Status};

pub const EVALUATIONS_TOTAL: &str = "watchtower_evaluations_total";
pub const EVALUATION_LATENCY_MS: &str = "watchtower_evaluation_latency_ms";
pub const EXCLUSION_EVENTS_TOTAL: &str = "watchtower_exclusion_events_total";
pub const NOTIFICATIONS_TOTAL: &str = "watchtower_notifications_total";

pub(crate) fn record_exclusion_event(event: ExclusionEventType) {
    metrics::counter!(EXCLUSION_EVENTS_TOTAL, "event" => event.as_str()).increment(1);
}

pub(crate) fn record_notifications(count: usize) {
    metrics::counter!(NOTIFICATIONS_TOTAL).increment(count as u64);
}

/// Counters for the evaluations of one process or job
#[derive(Clone, Default)]
pub struct EvaluationStats {
    inner: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    healthy: AtomicU64,
    triggered: AtomicU64,
    no_data: AtomicU64,
    connection_errors: AtomicU64,
    failures: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl EvaluationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a persisted evaluation
    pub fn record(&self, status: Status, latency: Duration) {
        let counter = match status {
            Status::Healthy => &self.inner.healthy,
            Status::Triggered => &self.inner.triggered,
            Status::NoDataDetected => &self.inner.no_data,
            Status::ConnectionError => &self.inner.connection_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let millis = latency.as_millis() as u64;
        self.inner
            .total_latency_ms
            .fetch_add(millis, Ordering::Relaxed);

        metrics::counter!(EVALUATIONS_TOTAL, "status" => status.as_str()).increment(1);
        metrics::histogram!(EVALUATION_LATENCY_MS).record(millis as f64);
    }

    /// Record an evaluation that ended without a persisted result
    pub fn record_failure(&self) {
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            healthy: self.inner.healthy.load(Ordering::Relaxed),
            triggered: self.inner.triggered.load(Ordering::Relaxed),
            no_data_detected: self.inner.no_data.load(Ordering::Relaxed),
            connection_error: self.inner.connection_errors.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
            total_latency_ms: self.inner.total_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EvaluationStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub healthy: u64,
    pub triggered: u64,
    pub no_data_detected: u64,
    pub connection_error: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
}

impl StatsSnapshot {
    /// Persisted evaluations
    pub fn evaluations(&self) -> u64 {
        self.healthy + self.triggered + self.no_data_detected + self.connection_error
    }

    pub fn avg_latency_ms(&self) -> f64 {
        match self.evaluations() {
            0 => 0.0,
            n => self.total_latency_ms as f64 / n as f64,
        }
    }

    /// Counts accumulated since `earlier`
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            healthy: self.healthy.saturating_sub(earlier.healthy),
            triggered: self.triggered.saturating_sub(earlier.triggered),
            no_data_detected: self.no_data_detected.saturating_sub(earlier.no_data_detected),
            connection_error: self.connection_error.saturating_sub(earlier.connection_error),
            failures: self.failures.saturating_sub(earlier.failures),
            total_latency_ms: self.total_latency_ms.saturating_sub(earlier.total_latency_ms),
        }
    }
}
