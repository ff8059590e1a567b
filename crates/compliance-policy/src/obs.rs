//! Structured observability hooks for policy enforcement.
//!
//! Events are emitted at `info!` level; filter them with `RUST_LOG`.

use crate::fragment::FragmentCategory;
use crate::policy::PipelineStrategy;
use serde::Serialize;
use tracing::info;

/// RAII guard that enters a pipeline-scoped span for the duration of a merge.
pub struct MergeSpan {
    _span: tracing::span::EnteredSpan,
}

impl MergeSpan {
    pub fn enter(fragment_count: usize) -> Self {
        let span = tracing::info_span!("compliance.merge", fragments = fragment_count);
        Self {
            _span: span.entered(),
        }
    }
}

/// Internal event recorded for every fragment that injected at least one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnforcementEvent {
    pub event: &'static str,
    pub policy: String,
    pub category: FragmentCategory,
    pub strategy: PipelineStrategy,
    pub jobs: usize,
}

/// Emit event: a policy fragment was enforced in the pipeline.
pub fn emit_policy_enforced(event: &EnforcementEvent) {
    info!(
        event = "policy.enforced",
        kind = event.event,
        policy = %event.policy,
        category = event.category.name(),
        strategy = event.strategy.name(),
        jobs = event.jobs,
    );
}

/// Emit event: an injected job was renamed to avoid a collision.
pub fn emit_job_renamed(original: &str, renamed: &str) {
    info!(event = "policy.job_renamed", original = %original, renamed = %renamed);
}

/// Emit event: merge finished.
pub fn emit_merge_completed(jobs: usize, stages_omitted: bool) {
    info!(
        event = "merge.completed",
        jobs = jobs,
        stages_omitted = stages_omitted,
    );
}

/// Emit event: merge aborted (warning level).
pub fn emit_merge_failed(error: &dyn std::fmt::Display) {
    tracing::warn!(event = "merge.failed", error = %error);
}
