//! Compliance policy enforcement for CI pipelines
//!
//! - `PolicyConfig`: one policy's declarative settings (strategy, suffix, skip-ci, variables override)
//! - `PipelineMerger`: merges policy job fragments into a project pipeline
//! - `VariableOverrideResolver`: decides which user variables a job receives
//! - `FeatureFlags`: explicit flag capability passed into constructors
//!
//! Everything here is synchronous and free of I/O.

pub mod error;
pub mod flags;
pub mod fragment;
pub mod merger;
pub mod metrics;
pub mod obs;
pub mod policy;
pub mod stage;
pub mod telemetry;
pub mod variables;

pub use error::{PolicyError, Result};
pub use flags::{FeatureFlags, DISABLE_AUDIT_EVENT_STREAMING, OMIT_DEFAULT_STAGES};
pub use fragment::{FragmentCategory, JobFragment, JobMap, PipelineDefinition, PolicyFragment};
pub use merger::{MergedPipeline, PipelineMerger};
pub use metrics::METRICS;
pub use obs::EnforcementEvent;
pub use policy::{
    PipelineStrategy, PolicyConfig, PolicySet, SkipCiRule, SuffixStrategy, VariablesOverride,
};
pub use stage::StageGraph;
pub use telemetry::init_tracing;
pub use variables::{JobVariables, Variable, VariableCollection, VariableOverrideResolver};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
