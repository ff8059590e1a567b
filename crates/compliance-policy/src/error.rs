//! Error types for policy parsing and pipeline merging

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    /// Malformed or missing required configuration.
    #[error("Pipeline execution policy error: {0}")]
    Config(String),

    /// Unresolvable job name collision under `suffix: never`.
    #[error("Pipeline execution policy error: job names must be unique ({name})")]
    DuplicateJobName { name: String },

    #[error("{job} job: chosen stage `{stage}` is reserved for Pipeline Execution Policies")]
    ReservedStage { job: String, stage: String },

    #[error("Pipeline execution policy error: Cyclic dependencies detected when enforcing policies. Ensure stages across the project and policies are aligned.")]
    CyclicStages,

    #[error("Pipeline execution policy error: Policy `{policy}` could not be applied. Its stages are incompatible with stages of another `override_project_ci` policy: {stages}.")]
    IncompatibleStages { policy: String, stages: String },

    #[error("Invalid policy YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;
