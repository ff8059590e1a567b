//! Global atomic counters for audit event streaming.
//!
//! Call [`Metrics::flush`] at natural boundaries (end of a streaming job)
//! to emit all values as one `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    events_streamed: AtomicU64,
    deliveries_succeeded: AtomicU64,
    deliveries_failed: AtomicU64,
    unexpected_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_streamed: AtomicU64::new(0),
            deliveries_succeeded: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            unexpected_errors: AtomicU64::new(0),
        }
    }

    pub fn inc_events_streamed(&self) {
        self.events_streamed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "events_streamed", "counter incremented");
    }

    pub fn inc_deliveries_succeeded(&self) {
        self.deliveries_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deliveries_succeeded", "counter incremented");
    }

    pub fn inc_deliveries_failed(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deliveries_failed", "counter incremented");
    }

    /// Cloud logging failures other than transport problems.
    pub fn inc_unexpected_errors(&self) {
        self.unexpected_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "unexpected_errors", "counter incremented");
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_streamed = self.events_streamed(),
            deliveries_succeeded = self.deliveries_succeeded(),
            deliveries_failed = self.deliveries_failed(),
            unexpected_errors = self.unexpected_errors(),
        );
    }

    pub fn events_streamed(&self) -> u64 {
        self.events_streamed.load(Ordering::Relaxed)
    }

    pub fn deliveries_succeeded(&self) -> u64 {
        self.deliveries_succeeded.load(Ordering::Relaxed)
    }

    pub fn deliveries_failed(&self) -> u64 {
        self.deliveries_failed.load(Ordering::Relaxed)
    }

    pub fn unexpected_errors(&self) -> u64 {
        self.unexpected_errors.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.events_streamed.store(0, Ordering::Relaxed);
        self.deliveries_succeeded.store(0, Ordering::Relaxed);
        self.deliveries_failed.store(0, Ordering::Relaxed);
        self.unexpected_errors.store(0, Ordering::Relaxed);
    }
}
