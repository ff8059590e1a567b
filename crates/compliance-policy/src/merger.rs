//! Merging policy fragments into a project pipeline.
//!
//! The merger is a pure function of its inputs: it clones the base
//! definition, applies every fragment in ascending `source_index` order and
//! either returns the complete merged pipeline or the first error. No
//! partially merged pipeline ever leaves this module.

use crate::error::{PolicyError, Result};
use crate::flags::{FeatureFlags, OMIT_DEFAULT_STAGES};
use crate::fragment::{
    rewrite_needs, set_stage, FragmentCategory, JobFragment, JobMap, PipelineDefinition,
    PolicyFragment, STAGES_KEY,
};
use crate::metrics::METRICS;
use crate::obs::{self, EnforcementEvent, MergeSpan};
use crate::policy::PipelineStrategy;
use crate::stage::{
    self, StageGraph, ON_DEMAND_ANCHORS, PIPELINE_SCAN_ANCHORS, SCAN_POLICIES_STAGE, TEST_STAGE,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};

/// Result of a merge, ready for the pipeline compiler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedPipeline {
    /// `None` when the stage list was normalised away.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<String>>,
    pub jobs: JobMap,
    pub globals: JobMap,
    /// Top-level key order of the base definition.
    #[serde(skip)]
    pub key_order: Vec<String>,
    /// One entry per fragment that injected jobs.
    #[serde(skip)]
    pub telemetry: Vec<EnforcementEvent>,
}

impl MergedPipeline {
    /// Effective stage ordering, including the default when `stages` was omitted.
    pub fn stage_list(&self) -> Vec<String> {
        match &self.stages {
            Some(stages) => stages.clone(),
            None => StageGraph::default_ordering().into_vec(),
        }
    }

    /// Flatten into one pipeline map.
    ///
    /// Keys of the base definition keep their original positions. A `stages`
    /// key the base did not have goes first; added globals and then injected
    /// jobs are appended.
    pub fn to_value(&self) -> Value {
        let mut map = JobMap::new();
        let stages = self.stages.as_ref().map(|stages| json!(stages));

        if !self.key_order.iter().any(|k| k == STAGES_KEY) {
            if let Some(stages) = &stages {
                map.insert(STAGES_KEY.to_string(), stages.clone());
            }
        }

        for key in &self.key_order {
            let value = if key == STAGES_KEY {
                stages.as_ref()
            } else {
                self.globals.get(key).or_else(|| self.jobs.get(key))
            };
            if let Some(value) = value {
                map.insert(key.clone(), value.clone());
            }
        }

        for (key, value) in self.globals.iter().chain(self.jobs.iter()) {
            if !map.contains_key(key) {
                map.insert(key.clone(), value.clone());
            }
        }
        Value::Object(map)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.to_value())?)
    }
}

/// Merges policy fragments into a base pipeline definition.
#[derive(Debug, Clone, Default)]
pub struct PipelineMerger {
    flags: FeatureFlags,
}

impl PipelineMerger {
    pub fn new(flags: FeatureFlags) -> Self {
        Self { flags }
    }

    /// Merge `fragments` into `base`.
    ///
    /// Fails with `Config` for fragment jobs without a usable `stage`,
    /// `DuplicateJobName` for collisions that cannot be renamed and
    /// `ReservedStage` when a project job uses a policy-only stage.
    pub fn merge(
        &self,
        base: &PipelineDefinition,
        fragments: &[PolicyFragment],
    ) -> Result<MergedPipeline> {
        let _span = MergeSpan::enter(fragments.len());

        match self.try_merge(base, fragments) {
            Ok(merged) => {
                obs::emit_merge_completed(merged.jobs.len(), merged.stages.is_none());
                Ok(merged)
            }
            Err(e) => {
                METRICS.inc_merges_failed();
                obs::emit_merge_failed(&e);
                Err(e)
            }
        }
    }

    fn try_merge(
        &self,
        base: &PipelineDefinition,
        fragments: &[PolicyFragment],
    ) -> Result<MergedPipeline> {
        check_base_stages(base)?;

        let ordered = ordered_fragments(fragments);
        let mut state = MergeState::new(base, &ordered)?;
        for fragment in ordered {
            state.apply(fragment)?;
        }

        Ok(state.finish(self.flags.enabled(OMIT_DEFAULT_STAGES)))
    }
}

/// Stable sort by `source_index`; equal indices keep input order.
fn ordered_fragments(fragments: &[PolicyFragment]) -> Vec<&PolicyFragment> {
    let mut ordered: Vec<&PolicyFragment> = fragments.iter().collect();
    ordered.sort_by_key(|f| f.policy.source_index());
    ordered
}

fn check_base_stages(base: &PipelineDefinition) -> Result<()> {
    for (name, body) in &base.jobs {
        let stage = PipelineDefinition::job_stage(body);
        if stage::is_reserved(stage) {
            return Err(PolicyError::ReservedStage {
                job: name.clone(),
                stage: stage.to_string(),
            });
        }
    }
    Ok(())
}

fn is_override(fragment: &PolicyFragment) -> bool {
    fragment.category == FragmentCategory::PipelineExecution
        && fragment.policy.strategy() == PipelineStrategy::OverrideProjectCi
}

struct MergeState {
    stages: StageGraph,
    jobs: JobMap,
    globals: JobMap,
    key_order: Vec<String>,
    base_has_jobs: bool,
    telemetry: Vec<EnforcementEvent>,
}

impl MergeState {
    fn new(base: &PipelineDefinition, ordered: &[&PolicyFragment]) -> Result<Self> {
        let mut state = Self {
            stages: StageGraph::from_declared(&base.stages),
            jobs: base.jobs.clone(),
            globals: base.globals.clone(),
            key_order: base.key_order.clone(),
            base_has_jobs: !base.jobs.is_empty(),
            telemetry: Vec::new(),
        };

        let mut override_stages: Option<StageGraph> = None;
        for fragment in ordered.iter().filter(|f| is_override(f)) {
            let declared = StageGraph::from_declared(&fragment.stages);
            override_stages = Some(match override_stages {
                None => declared,
                Some(current) => current
                    .merge_ordering(declared.stages(), |_| true)
                    .map_err(|_| PolicyError::IncompatibleStages {
                        policy: fragment.policy.display_name(),
                        stages: current.stages().join(", "),
                    })?,
            });
        }

        if let Some(stages) = override_stages {
            state.stages = stages;
            state.jobs.clear();
        }
        Ok(state)
    }

    fn apply(&mut self, fragment: &PolicyFragment) -> Result<()> {
        if !fragment.is_active() {
            return Ok(());
        }

        let job_fragments = fragment.job_fragments()?;
        let injected = match fragment.category {
            FragmentCategory::PipelineExecution => {
                self.inject_policy_jobs(fragment, &job_fragments)?
            }
            FragmentCategory::OnDemandScan => self.inject_on_demand_scans(fragment, &job_fragments),
            FragmentCategory::PipelineScan => self.inject_pipeline_scans(fragment),
        };

        if fragment.category.is_scan() && !self.base_has_jobs {
            self.globals
                .entry("workflow")
                .or_insert_with(|| json!({"rules": [{"when": "always"}]}));
        }

        let event = EnforcementEvent {
            event: fragment.category.telemetry_event(),
            policy: fragment.policy.display_name(),
            category: fragment.category,
            strategy: fragment.policy.strategy(),
            jobs: injected,
        };
        obs::emit_policy_enforced(&event);
        METRICS.inc_policies_enforced();
        METRICS.add_jobs_injected(injected as u64);
        self.telemetry.push(event);
        Ok(())
    }

    fn inject_policy_jobs(
        &mut self,
        fragment: &PolicyFragment,
        job_fragments: &[JobFragment],
    ) -> Result<usize> {
        if fragment.policy.strategy() == PipelineStrategy::InjectPolicy {
            let used: BTreeSet<&str> = job_fragments.iter().map(|j| j.stage.as_str()).collect();
            let declared = StageGraph::from_declared(&fragment.stages);
            self.stages = self
                .stages
                .merge_ordering(declared.stages(), |s| used.contains(s))?;
        }

        for job in job_fragments {
            if stage::is_reserved(&job.stage) {
                self.stages.add_reserved(&job.stage);
            }
            if !self.stages.contains(&job.stage) {
                return Err(PolicyError::Config(format!(
                    "job `{}` uses stage `{}` which is not declared",
                    job.name, job.stage
                )));
            }
        }

        let suffix = fragment.policy.suffix();
        let mut renames: HashMap<String, String> = HashMap::new();
        let mut batch: Vec<(String, Value)> = Vec::with_capacity(fragment.jobs.len());

        for (name, body) in &fragment.jobs {
            let Some(existing) = self.jobs.get(name) else {
                batch.push((name.clone(), body.clone()));
                continue;
            };

            match &suffix {
                Some(suffix) => {
                    let renamed = format!("{}:{}", name, suffix);
                    // The new name must be free in the pipeline and in this batch.
                    if self.jobs.contains_key(&renamed)
                        || fragment.jobs.contains_key(&renamed)
                        || batch.iter().any(|(queued, _)| *queued == renamed)
                    {
                        return Err(PolicyError::DuplicateJobName { name: renamed });
                    }
                    renames.insert(name.clone(), renamed.clone());
                    batch.push((renamed, body.clone()));
                }
                // Identical bodies under `never` collapse into the existing job.
                None if existing == body => continue,
                None => {
                    return Err(PolicyError::DuplicateJobName { name: name.clone() });
                }
            }
        }

        for (original, renamed) in &renames {
            obs::emit_job_renamed(original, renamed);
            METRICS.inc_jobs_renamed();
        }

        let injected = batch.len();
        for (name, mut body) in batch {
            rewrite_needs(&mut body, &renames);
            self.jobs.insert(name, body);
        }
        Ok(injected)
    }

    fn inject_on_demand_scans(
        &mut self,
        fragment: &PolicyFragment,
        job_fragments: &[JobFragment],
    ) -> usize {
        for job in job_fragments {
            self.stages.insert_after_or_append(&job.stage, &ON_DEMAND_ANCHORS);
        }
        for (name, body) in &fragment.jobs {
            self.jobs.insert(name.clone(), body.clone());
        }
        fragment.jobs.len()
    }

    fn inject_pipeline_scans(&mut self, fragment: &PolicyFragment) -> usize {
        let target = if self.stages.contains(TEST_STAGE) {
            TEST_STAGE
        } else {
            self.stages
                .insert_after_or_prepend(SCAN_POLICIES_STAGE, &PIPELINE_SCAN_ANCHORS);
            SCAN_POLICIES_STAGE
        };

        for (name, body) in &fragment.jobs {
            let mut body = body.clone();
            set_stage(&mut body, target);
            self.jobs.insert(name.clone(), body);
        }
        fragment.jobs.len()
    }

    fn finish(mut self, omit_default_stages: bool) -> MergedPipeline {
        self.stages.dedup();
        let stages = if omit_default_stages && self.stages.is_default() {
            None
        } else {
            Some(self.stages.into_vec())
        };

        MergedPipeline {
            stages,
            jobs: self.jobs,
            globals: self.globals,
            key_order: self.key_order,
            telemetry: self.telemetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyConfig, SuffixStrategy};
    use crate::stage::{RESERVED_POST_STAGE, RESERVED_PRE_STAGE};

    fn merger() -> PipelineMerger {
        PipelineMerger::default()
    }

    fn project(stages: &[&str]) -> PipelineDefinition {
        PipelineDefinition::new()
            .with_stages(stages)
            .with_job("build-job", json!({"stage": "build", "script": "make"}))
            .with_job("test-job", json!({"stage": "test", "script": "make test"}))
    }

    fn execution(source_index: usize) -> PolicyFragment {
        PolicyFragment::new(
            PolicyConfig::new(9, source_index),
            FragmentCategory::PipelineExecution,
        )
    }

    fn job_names(merged: &MergedPipeline) -> Vec<&str> {
        merged.jobs.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_on_demand_scan_appends_dast() {
        let fragment = PolicyFragment::new(PolicyConfig::new(1, 0), FragmentCategory::OnDemandScan)
            .with_job("dast-on-demand-0", json!({"stage": "dast", "script": "scan"}));

        let merged = merger()
            .merge(&project(&["build", "test", "deploy"]), &[fragment])
            .unwrap();

        assert_eq!(
            merged.stages,
            Some(vec![
                "build".to_string(),
                "test".to_string(),
                "deploy".to_string(),
                "dast".to_string()
            ])
        );
        assert!(merged.jobs.contains_key("dast-on-demand-0"));
    }

    #[test]
    fn test_pipeline_scan_uses_existing_test_stage() {
        let fragment = PolicyFragment::new(PolicyConfig::new(1, 0), FragmentCategory::PipelineScan)
            .with_job("secret-detection-0", json!({"stage": "test", "script": "scan"}));

        let merged = merger()
            .merge(&project(&["build", "test"]), &[fragment])
            .unwrap();

        assert_eq!(merged.stage_list(), vec!["build", "test"]);
        assert_eq!(merged.jobs["secret-detection-0"]["stage"], "test");
    }

    #[test]
    fn test_pipeline_scan_adds_scan_policies_stage() {
        let base = PipelineDefinition::new()
            .with_stages(&["build", "publish"])
            .with_job("build-job", json!({"stage": "build"}));
        let fragment = PolicyFragment::new(PolicyConfig::new(1, 0), FragmentCategory::PipelineScan)
            .with_job("sast-0", json!({"stage": "test", "script": "scan"}));

        let merged = merger().merge(&base, &[fragment]).unwrap();

        assert_eq!(merged.stage_list(), vec!["build", "scan-policies", "publish"]);
        assert_eq!(merged.jobs["sast-0"]["stage"], "scan-policies");
    }

    #[test]
    fn test_scan_into_empty_project_adds_workflow() {
        let fragment = PolicyFragment::new(PolicyConfig::new(1, 0), FragmentCategory::PipelineScan)
            .with_job("sast-0", json!({"stage": "test"}));

        let merged = merger()
            .merge(&PipelineDefinition::new(), &[fragment])
            .unwrap();

        assert_eq!(
            merged.globals["workflow"],
            json!({"rules": [{"when": "always"}]})
        );
        assert!(merged.stages.is_none());
    }

    #[test]
    fn test_scan_jobs_last_applied_wins() {
        let first = PolicyFragment::new(PolicyConfig::new(1, 0), FragmentCategory::PipelineScan)
            .with_job("sast-0", json!({"stage": "test", "script": "old"}));
        let second = PolicyFragment::new(PolicyConfig::new(1, 1), FragmentCategory::PipelineScan)
            .with_job("sast-0", json!({"stage": "test", "script": "new"}));

        let merged = merger()
            .merge(&project(&[]), &[second, first])
            .unwrap();

        assert_eq!(merged.jobs["sast-0"]["script"], "new");
    }

    #[test]
    fn test_never_collapses_identical_jobs() {
        let fragment = PolicyFragment::new(
            PolicyConfig::new(1, 0).with_suffix_strategy(SuffixStrategy::Never),
            FragmentCategory::PipelineExecution,
        )
        .with_job("build-job", json!({"stage": "build", "script": "make"}));

        let merged = merger().merge(&project(&[]), &[fragment]).unwrap();
        assert_eq!(job_names(&merged), vec!["build-job", "test-job"]);
        assert_eq!(merged.telemetry[0].jobs, 0);
    }

    #[test]
    fn test_rename_clashing_with_sibling_job_fails() {
        // `build-job` would be renamed to the name the fragment already uses.
        let renamed_first = execution(0)
            .with_job("build-job", json!({"stage": "build", "script": "policy"}))
            .with_job("build-job:policy-9-0", json!({"stage": "build", "script": "literal"}));
        let literal_first = execution(0)
            .with_job("build-job:policy-9-0", json!({"stage": "build", "script": "literal"}))
            .with_job("build-job", json!({"stage": "build", "script": "policy"}));

        for fragment in [renamed_first, literal_first] {
            let err = merger().merge(&project(&[]), &[fragment]).unwrap_err();
            assert!(
                matches!(&err, PolicyError::DuplicateJobName { name } if name == "build-job:policy-9-0"),
                "unexpected error: {err}"
            );
        }
    }

    #[test]
    fn test_missing_stage_is_config_error() {
        let fragment = execution(0).with_job("policy-job", json!({"script": "x"}));
        let err = merger().merge(&project(&[]), &[fragment]).unwrap_err();
        assert!(matches!(err, PolicyError::Config(_)));
    }

    #[test]
    fn test_undeclared_stage_is_config_error() {
        let fragment = execution(0).with_job("policy-job", json!({"stage": "nowhere"}));
        let err = merger().merge(&project(&[]), &[fragment]).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_project_job_in_reserved_stage_fails() {
        let base = PipelineDefinition::new()
            .with_job("sneaky", json!({"stage": RESERVED_PRE_STAGE, "script": "x"}));
        let err = merger().merge(&base, &[]).unwrap_err();
        assert!(matches!(err, PolicyError::ReservedStage { .. }));
    }

    #[test]
    fn test_policy_reserved_stages_pinned() {
        let fragment = execution(0)
            .with_job("pre", json!({"stage": RESERVED_PRE_STAGE}))
            .with_job("post", json!({"stage": RESERVED_POST_STAGE}));

        let merged = merger()
            .merge(&project(&["build", "test"]), &[fragment])
            .unwrap();

        assert_eq!(
            merged.stage_list(),
            vec![RESERVED_PRE_STAGE, "build", "test", RESERVED_POST_STAGE]
        );
    }

    #[test]
    fn test_inject_custom_stage() {
        let fragment = execution(0)
            .with_stages(&["build", "policy-build", "test"])
            .with_job("policy-job", json!({"stage": "policy-build"}));

        let merged = merger()
            .merge(&project(&["build", "test"]), &[fragment])
            .unwrap();

        assert_eq!(merged.stage_list(), vec!["build", "policy-build", "test"]);
    }

    #[test]
    fn test_inject_cyclic_stages_fail() {
        let fragment = execution(0)
            .with_stages(&["test", "build"])
            .with_job("policy-job", json!({"stage": "build"}));

        let err = merger()
            .merge(&project(&["build", "test"]), &[fragment])
            .unwrap_err();
        assert!(matches!(err, PolicyError::CyclicStages));
    }

    #[test]
    fn test_override_replaces_project_jobs() {
        let policy = PolicyConfig::new(1, 0).with_strategy(PipelineStrategy::OverrideProjectCi);
        let fragment = PolicyFragment::new(policy, FragmentCategory::PipelineExecution)
            .with_stages(&["compliance", "deploy"])
            .with_job("audit", json!({"stage": "compliance"}));

        let merged = merger()
            .merge(&project(&["build", "test"]), &[fragment])
            .unwrap();

        assert_eq!(job_names(&merged), vec!["audit"]);
        assert_eq!(merged.stage_list(), vec!["compliance", "deploy"]);
    }

    #[test]
    fn test_incompatible_override_stages() {
        let first = PolicyFragment::new(
            PolicyConfig::new(1, 0).with_strategy(PipelineStrategy::OverrideProjectCi),
            FragmentCategory::PipelineExecution,
        )
        .with_stages(&["build", "test"])
        .with_job("a", json!({"stage": "build"}));
        let second = PolicyFragment::new(
            PolicyConfig::new(1, 1)
                .with_name("Second")
                .with_strategy(PipelineStrategy::OverrideProjectCi),
            FragmentCategory::PipelineExecution,
        )
        .with_stages(&["test", "build"])
        .with_job("b", json!({"stage": "test"}));

        let err = merger()
            .merge(&PipelineDefinition::new(), &[first, second])
            .unwrap_err();

        match err {
            PolicyError::IncompatibleStages { policy, stages } => {
                assert_eq!(policy, "Second");
                assert_eq!(stages, "build, test");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fragments_applied_by_source_index() {
        let later = execution(1).with_job("test-job", json!({"stage": "test", "script": "b"}));
        let earlier = execution(0).with_job("test-job", json!({"stage": "test", "script": "a"}));

        let merged = merger()
            .merge(&project(&[]), &[later, earlier])
            .unwrap();

        assert_eq!(merged.jobs["test-job:policy-9-0"]["script"], "a");
        assert_eq!(merged.jobs["test-job:policy-9-1"]["script"], "b");
    }

    #[test]
    fn test_telemetry_skips_empty_fragments() {
        let empty = execution(0);
        let active = execution(1).with_job("policy-job", json!({"stage": "test"}));

        let merged = merger().merge(&project(&[]), &[empty, active]).unwrap();

        assert_eq!(merged.telemetry.len(), 1);
        assert_eq!(
            merged.telemetry[0].event,
            "enforce_pipeline_execution_policy_in_project"
        );
        assert_eq!(merged.telemetry[0].strategy, PipelineStrategy::InjectPolicy);
    }

    #[test]
    fn test_stage_omission_can_be_disabled() {
        let merged = PipelineMerger::new(FeatureFlags::none())
            .merge(&project(&[]), &[])
            .unwrap();
        assert_eq!(merged.stage_list(), vec![".pre", "build", "test", "deploy", ".post"]);
        assert!(merged.stages.is_some());
    }

    #[test]
    fn test_to_value_layout() {
        let base = project(&["build", "test"]).with_global("variables", json!({"A": "1"}));
        let merged = merger().merge(&base, &[]).unwrap();
        let value = merged.to_value();

        let keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, vec!["stages", "variables", "build-job", "test-job"]);
        assert!(merged.to_yaml().unwrap().contains("build-job"));
    }
}
