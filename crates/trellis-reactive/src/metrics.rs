//! Counters and gauges for subscription engine observability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Passive metrics sink shared by the subscription service.
///
/// All counters are monotonic except `active_subscriptions`, which is a
/// gauge tracking the current subscription count.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    events_emitted: AtomicU64,
    evaluations_run: AtomicU64,
    evaluations_skipped: AtomicU64,
    active_subscriptions: AtomicU64,
    evaluation_time_ms: AtomicU64,
}

/// Point-in-time copy of all metric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_emitted: u64,
    pub evaluations_run: u64,
    pub evaluations_skipped: u64,
    pub active_subscriptions: u64,
    pub evaluation_time_ms: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mutation event reached the subscription service.
    pub fn record_event(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A query evaluation ran, taking `elapsed` wall-clock time.
    pub fn record_evaluation(&self, elapsed: Duration) {
        self.evaluations_run.fetch_add(1, Ordering::Relaxed);
        self.evaluation_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// `count` subscriptions were pruned from a batch without evaluation.
    pub fn record_skipped(&self, count: u64) {
        self.evaluations_skipped.fetch_add(count, Ordering::Relaxed);
    }

    /// Update the live subscription gauge.
    pub fn set_active_subscriptions(&self, count: u64) {
        self.active_subscriptions.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            evaluations_run: self.evaluations_run.load(Ordering::Relaxed),
            evaluations_skipped: self.evaluations_skipped.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
            evaluation_time_ms: self.evaluation_time_ms.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter and gauge.
    pub fn reset(&self) {
        self.events_emitted.store(0, Ordering::Relaxed);
        self.evaluations_run.store(0, Ordering::Relaxed);
        self.evaluations_skipped.store(0, Ordering::Relaxed);
        self.active_subscriptions.store(0, Ordering::Relaxed);
        self.evaluation_time_ms.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_event();
        metrics.record_event();
        metrics.record_evaluation(Duration::from_millis(5));
        metrics.record_skipped(3);
        metrics.set_active_subscriptions(2);

        let snap = metrics.snapshot();
        assert_eq!(snap.events_emitted, 2);
        assert_eq!(snap.evaluations_run, 1);
        assert_eq!(snap.evaluations_skipped, 3);
        assert_eq!(snap.active_subscriptions, 2);
        assert_eq!(snap.evaluation_time_ms, 5);
    }

    #[test]
    fn test_reset() {
        let metrics = MetricsCollector::new();
        metrics.record_event();
        metrics.record_skipped(1);
        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap.events_emitted, 0);
        assert_eq!(snap.evaluations_skipped, 0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let metrics = MetricsCollector::new();
        metrics.set_active_subscriptions(5);
        metrics.set_active_subscriptions(1);
        assert_eq!(metrics.snapshot().active_subscriptions, 1);
    }
}
