//! Pipeline definitions and policy-generated job fragments.

use crate::error::{PolicyError, Result};
use crate::policy::PolicyConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Ordered job-name → job-body map.
pub type JobMap = serde_json::Map<String, Value>;

/// Top-level keys that configure the pipeline rather than define a job.
pub const GLOBAL_KEYWORDS: [&str; 9] = [
    "variables",
    "workflow",
    "default",
    "include",
    "image",
    "services",
    "cache",
    "before_script",
    "after_script",
];

/// Top-level key holding the stage list.
pub const STAGES_KEY: &str = "stages";

/// Stage a project job runs in when it does not name one.
pub const IMPLICIT_JOB_STAGE: &str = "test";

/// A pipeline definition split into stages, jobs and global keywords.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Declared stages; empty means the default ordering.
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub jobs: JobMap,
    #[serde(default)]
    pub globals: JobMap,
    /// Top-level keys (`stages`, globals and jobs) in declaration order.
    #[serde(default)]
    pub key_order: Vec<String>,
}

impl PipelineDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stages(mut self, stages: &[&str]) -> Self {
        self.stages = stages.iter().map(|s| s.to_string()).collect();
        self.record_key(STAGES_KEY);
        self
    }

    pub fn with_job(mut self, name: &str, body: Value) -> Self {
        self.jobs.insert(name.to_string(), body);
        self.record_key(name);
        self
    }

    pub fn with_global(mut self, key: &str, value: Value) -> Self {
        self.globals.insert(key.to_string(), value);
        self.record_key(key);
        self
    }

    fn record_key(&mut self, key: &str) {
        if !self.key_order.iter().any(|k| k == key) {
            self.key_order.push(key.to_string());
        }
    }

    /// Split a raw pipeline map into stages, jobs and globals.
    pub fn from_value(value: Value) -> Result<Self> {
        split_definition(value)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Stage of a project job, defaulting to `test`.
    pub fn job_stage(body: &Value) -> &str {
        body.get("stage")
            .and_then(Value::as_str)
            .unwrap_or(IMPLICIT_JOB_STAGE)
    }
}

/// Where a policy fragment comes from; decides stage placement and conflict handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentCategory {
    /// Jobs from a pipeline execution policy; conflicts follow the suffix strategy.
    PipelineExecution,
    /// On-demand scans (DAST); run in their own stage after the pipeline.
    OnDemandScan,
    /// Pipeline scans (SAST, secret detection); run in `test` or `scan-policies`.
    PipelineScan,
}

impl FragmentCategory {
    pub fn name(&self) -> &'static str {
        match self {
            FragmentCategory::PipelineExecution => "pipeline_execution",
            FragmentCategory::OnDemandScan => "on_demand_scan",
            FragmentCategory::PipelineScan => "pipeline_scan",
        }
    }

    /// Internal event emitted when a fragment of this category is enforced.
    pub fn telemetry_event(&self) -> &'static str {
        match self {
            FragmentCategory::PipelineExecution => "enforce_pipeline_execution_policy_in_project",
            FragmentCategory::OnDemandScan | FragmentCategory::PipelineScan => {
                "enforce_scan_execution_policy_in_project"
            }
        }
    }

    pub fn is_scan(&self) -> bool {
        !matches!(self, FragmentCategory::PipelineExecution)
    }
}

/// Jobs rendered from one policy's template.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyFragment {
    pub policy: PolicyConfig,
    pub category: FragmentCategory,
    /// Stages declared by the policy pipeline.
    pub stages: Vec<String>,
    pub jobs: JobMap,
}

impl PolicyFragment {
    pub fn new(policy: PolicyConfig, category: FragmentCategory) -> Self {
        Self {
            policy,
            category,
            stages: Vec::new(),
            jobs: JobMap::new(),
        }
    }

    pub fn with_stages(mut self, stages: &[&str]) -> Self {
        self.stages = stages.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_job(mut self, name: &str, body: Value) -> Self {
        self.jobs.insert(name.to_string(), body);
        self
    }

    /// Parse a rendered policy pipeline. Global keywords are dropped.
    pub fn from_yaml(policy: PolicyConfig, category: FragmentCategory, yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(policy, category, value)
    }

    pub fn from_value(policy: PolicyConfig, category: FragmentCategory, value: Value) -> Result<Self> {
        let definition = split_definition(value)?;
        Ok(Self {
            policy,
            category,
            stages: definition.stages,
            jobs: definition.jobs,
        })
    }

    /// A fragment with no jobs contributes nothing and is not reported.
    pub fn is_active(&self) -> bool {
        !self.jobs.is_empty()
    }

    /// Validated view of every job; fails on the first job without a `stage`.
    pub fn job_fragments(&self) -> Result<Vec<JobFragment>> {
        self.jobs
            .iter()
            .map(|(name, body)| JobFragment::from_job(name, body))
            .collect()
    }
}

/// Name, stage and dependencies of one generated job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFragment {
    pub name: String,
    pub stage: String,
    pub needs: BTreeSet<String>,
}

impl JobFragment {
    pub fn from_job(name: &str, body: &Value) -> Result<Self> {
        let stage = body
            .get("stage")
            .and_then(Value::as_str)
            .ok_or_else(|| PolicyError::Config(format!("job `{}` is missing `stage`", name)))?;

        Ok(Self {
            name: name.to_string(),
            stage: stage.to_string(),
            needs: job_needs(body),
        })
    }
}

/// Names referenced by a job's `needs`, in both the string and `{job: ...}` forms.
pub fn job_needs(body: &Value) -> BTreeSet<String> {
    body.get("needs")
        .and_then(Value::as_array)
        .map(|needs| needs.iter().filter_map(need_name).map(str::to_string).collect())
        .unwrap_or_default()
}

fn need_name(need: &Value) -> Option<&str> {
    match need {
        Value::String(name) => Some(name),
        Value::Object(map) => map.get("job").and_then(Value::as_str),
        _ => None,
    }
}

/// Rewrite `needs` entries according to `renames`. Returns whether anything changed.
pub fn rewrite_needs(body: &mut Value, renames: &HashMap<String, String>) -> bool {
    let Some(needs) = body.get_mut("needs").and_then(Value::as_array_mut) else {
        return false;
    };

    let mut changed = false;
    for need in needs.iter_mut() {
        let target = match need {
            Value::String(name) => name,
            Value::Object(map) => match map.get_mut("job") {
                Some(Value::String(name)) => name,
                _ => continue,
            },
            _ => continue,
        };
        if let Some(renamed) = renames.get(target.as_str()) {
            *target = renamed.clone();
            changed = true;
        }
    }
    changed
}

/// Point a job at a different stage.
pub fn set_stage(body: &mut Value, stage: &str) {
    if let Value::Object(map) = body {
        map.insert("stage".to_string(), Value::String(stage.to_string()));
    }
}

fn split_definition(value: Value) -> Result<PipelineDefinition> {
    let map = match value {
        Value::Null => JobMap::new(),
        Value::Object(map) => map,
        other => {
            return Err(PolicyError::Config(format!(
                "pipeline definition must be a map, got {}",
                type_name(&other)
            )))
        }
    };

    let mut definition = PipelineDefinition::new();
    for (key, value) in map {
        definition.key_order.push(key.clone());
        if key == STAGES_KEY {
            definition.stages = parse_stages(&value)?;
        } else if GLOBAL_KEYWORDS.contains(&key.as_str()) || key.starts_with('.') || !value.is_object() {
            definition.globals.insert(key, value);
        } else {
            definition.jobs.insert(key, value);
        }
    }

    Ok(definition)
}

fn parse_stages(value: &Value) -> Result<Vec<String>> {
    let list = value
        .as_array()
        .ok_or_else(|| PolicyError::Config("`stages` must be a list".to_string()))?;

    list.iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .ok_or_else(|| PolicyError::Config(format!("invalid stage name: {}", s)))
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
