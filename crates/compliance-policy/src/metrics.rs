//! Global atomic counters for policy enforcement.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a pipeline creation).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    policies_enforced: AtomicU64,
    jobs_injected: AtomicU64,
    jobs_renamed: AtomicU64,
    merges_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            policies_enforced: AtomicU64::new(0),
            jobs_injected: AtomicU64::new(0),
            jobs_renamed: AtomicU64::new(0),
            merges_failed: AtomicU64::new(0),
        }
    }

    /// Increment the policies-enforced counter by one.
    pub fn inc_policies_enforced(&self) {
        self.policies_enforced.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "policies_enforced", "counter incremented");
    }

    pub fn add_jobs_injected(&self, count: u64) {
        self.jobs_injected.fetch_add(count, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_injected", count, "counter incremented");
    }

    pub fn inc_jobs_renamed(&self) {
        self.jobs_renamed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_renamed", "counter incremented");
    }

    pub fn inc_merges_failed(&self) {
        self.merges_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "merges_failed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            policies_enforced = self.policies_enforced(),
            jobs_injected = self.jobs_injected(),
            jobs_renamed = self.jobs_renamed(),
            merges_failed = self.merges_failed(),
        );
    }

    pub fn policies_enforced(&self) -> u64 {
        self.policies_enforced.load(Ordering::Relaxed)
    }

    pub fn jobs_injected(&self) -> u64 {
        self.jobs_injected.load(Ordering::Relaxed)
    }

    pub fn jobs_renamed(&self) -> u64 {
        self.jobs_renamed.load(Ordering::Relaxed)
    }

    pub fn merges_failed(&self) -> u64 {
        self.merges_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.policies_enforced.store(0, Ordering::Relaxed);
        self.jobs_injected.store(0, Ordering::Relaxed);
        self.jobs_renamed.store(0, Ordering::Relaxed);
        self.merges_failed.store(0, Ordering::Relaxed);
    }
}
