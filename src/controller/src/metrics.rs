//! Controller Metrics
//!
//! Thread-safe counters for monitoring reconciles and timer lifecycles.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe metrics for tracking controller operations
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    reconciles: AtomicUsize,
    reconcile_errors: AtomicUsize,
    requeues: AtomicUsize,
    timers_armed: AtomicUsize,
    timers_disarmed: AtomicUsize,
    timers_fired: AtomicUsize,
    deletes_succeeded: AtomicUsize,
    deletes_failed: AtomicUsize,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    /// Record a completed reconcile, successful or not
    pub fn record_reconcile(&self, success: bool) {
        self.inner.reconciles.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.reconcile_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_requeue(&self) {
        self.inner.requeues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_armed(&self) {
        self.inner.timers_armed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timers_disarmed(&self, count: usize) {
        self.inner
            .timers_disarmed
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_timer_fired(&self) {
        self.inner.timers_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self, success: bool) {
        if success {
            self.inner.deletes_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.deletes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reconciles(&self) -> usize {
        self.inner.reconciles.load(Ordering::Relaxed)
    }

    pub fn reconcile_errors(&self) -> usize {
        self.inner.reconcile_errors.load(Ordering::Relaxed)
    }

    pub fn requeues(&self) -> usize {
        self.inner.requeues.load(Ordering::Relaxed)
    }

    pub fn timers_armed(&self) -> usize {
        self.inner.timers_armed.load(Ordering::Relaxed)
    }

    pub fn timers_disarmed(&self) -> usize {
        self.inner.timers_disarmed.load(Ordering::Relaxed)
    }

    pub fn timers_fired(&self) -> usize {
        self.inner.timers_fired.load(Ordering::Relaxed)
    }

    pub fn deletes_succeeded(&self) -> usize {
        self.inner.deletes_succeeded.load(Ordering::Relaxed)
    }

    pub fn deletes_failed(&self) -> usize {
        self.inner.deletes_failed.load(Ordering::Relaxed)
    }

    /// Get a point-in-time summary of all counters
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            reconciles: self.reconciles(),
            reconcile_errors: self.reconcile_errors(),
            requeues: self.requeues(),
            timers_armed: self.timers_armed(),
            timers_disarmed: self.timers_disarmed(),
            timers_fired: self.timers_fired(),
            deletes_succeeded: self.deletes_succeeded(),
            deletes_failed: self.deletes_failed(),
        }
    }
}

/// Snapshot of the controller metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSummary {
    pub reconciles: usize,
    pub reconcile_errors: usize,
    pub requeues: usize,
    pub timers_armed: usize,
    pub timers_disarmed: usize,
    pub timers_fired: usize,
    pub deletes_succeeded: usize,
    pub deletes_failed: usize,
}

impl MetricsSummary {
    /// Log the metrics summary
    pub fn log(&self) {
        log::info!("=== TTL Controller Metrics Summary ===");
        log::info!(
            "Reconciles: {} total, {} failed, {} requeued",
            self.reconciles,
            self.reconcile_errors,
            self.requeues
        );
        log::info!(
            "Timers: {} armed, {} disarmed, {} fired",
            self.timers_armed,
            self.timers_disarmed,
            self.timers_fired
        );
        log::info!(
            "Deletes: {} succeeded, {} failed",
            self.deletes_succeeded,
            self.deletes_failed
        );
    }
}
