//! Policy configuration and identity.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// How a pipeline execution policy combines with the project pipeline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStrategy {
    /// Policy jobs are injected next to the project jobs.
    #[default]
    #[serde(alias = "inject_ci")]
    InjectPolicy,

    /// Project jobs are discarded and replaced by the policy pipeline.
    OverrideProjectCi,
}

impl PipelineStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStrategy::InjectPolicy => "inject_policy",
            PipelineStrategy::OverrideProjectCi => "override_project_ci",
        }
    }
}

/// Whether name-colliding injected jobs get renamed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuffixStrategy {
    #[default]
    OnConflict,
    Never,
}

/// Who may bypass the policy with `[skip ci]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkipCiRule {
    pub allowed: bool,
    pub allowlist: BTreeSet<u64>,
}

/// Job-level directive controlling whether user variables may override policy variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariablesOverride {
    pub allowed: bool,
    #[serde(default)]
    pub exceptions: BTreeSet<String>,
}

impl VariablesOverride {
    pub fn new(allowed: bool, exceptions: &[&str]) -> Self {
        Self {
            allowed,
            exceptions: exceptions.iter().map(|e| e.to_string()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPolicy {
    name: Option<String>,
    #[serde(default)]
    content: serde_json::Value,
    pipeline_config_strategy: Option<PipelineStrategy>,
    suffix: Option<SuffixStrategy>,
    skip_ci: Option<RawSkipCi>,
    variables_override: Option<RawVariablesOverride>,
}

#[derive(Debug, Deserialize)]
struct RawSkipCi {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    allowlist: RawAllowlist,
}

#[derive(Debug, Default, Deserialize)]
struct RawAllowlist {
    #[serde(default)]
    users: Vec<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RawVariablesOverride {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    exceptions: Vec<String>,
}

/// One policy's declarative settings.
///
/// Built once per pipeline-creation request and never mutated afterwards:
/// all fields are private and the `with_*` builders consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    name: Option<String>,
    content: serde_json::Value,
    strategy: PipelineStrategy,
    suffix_strategy: SuffixStrategy,
    skip_ci_rule: SkipCiRule,
    variables_override: Option<VariablesOverride>,
    source_id: u64,
    source_index: usize,
}

impl PolicyConfig {
    /// Create a policy with default settings for the given policy source.
    ///
    /// `source_id` identifies the project holding the policy file and
    /// `source_index` the policy's position inside that file.
    pub fn new(source_id: u64, source_index: usize) -> Self {
        Self {
            name: None,
            content: serde_json::Value::Null,
            strategy: PipelineStrategy::default(),
            suffix_strategy: SuffixStrategy::default(),
            skip_ci_rule: SkipCiRule::default(),
            variables_override: None,
            source_id,
            source_index,
        }
    }

    /// Parse one policy from its raw YAML.
    pub fn from_yaml(yaml: &str, source_id: u64, source_index: usize) -> Result<Self> {
        let raw: RawPolicy = serde_yaml::from_str(yaml)?;

        let skip_ci_rule = raw
            .skip_ci
            .map(|s| SkipCiRule {
                allowed: s.allowed,
                allowlist: s.allowlist.users.into_iter().map(|u| u.id).collect(),
            })
            .unwrap_or_default();

        let variables_override = raw.variables_override.map(|v| VariablesOverride {
            allowed: v.allowed,
            exceptions: v.exceptions.into_iter().collect(),
        });

        Ok(Self {
            name: raw.name,
            content: raw.content,
            strategy: raw.pipeline_config_strategy.unwrap_or_default(),
            suffix_strategy: raw.suffix.unwrap_or_default(),
            skip_ci_rule,
            variables_override,
            source_id,
            source_index,
        })
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_strategy(mut self, strategy: PipelineStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_suffix_strategy(mut self, suffix_strategy: SuffixStrategy) -> Self {
        self.suffix_strategy = suffix_strategy;
        self
    }

    pub fn with_skip_ci(mut self, rule: SkipCiRule) -> Self {
        self.skip_ci_rule = rule;
        self
    }

    pub fn with_variables_override(mut self, directive: VariablesOverride) -> Self {
        self.variables_override = Some(directive);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name used in error messages; falls back to the policy suffix form.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("policy-{}-{}", self.source_id, self.source_index))
    }

    pub fn content(&self) -> &serde_json::Value {
        &self.content
    }

    pub fn strategy(&self) -> PipelineStrategy {
        self.strategy
    }

    pub fn suffix_strategy(&self) -> SuffixStrategy {
        self.suffix_strategy
    }

    pub fn skip_ci_rule(&self) -> &SkipCiRule {
        &self.skip_ci_rule
    }

    pub fn variables_override(&self) -> Option<&VariablesOverride> {
        self.variables_override.as_ref()
    }

    pub fn source_id(&self) -> u64 {
        self.source_id
    }

    pub fn source_index(&self) -> usize {
        self.source_index
    }

    /// Suffix appended to conflicting job names, `None` for `suffix: never`.
    pub fn suffix(&self) -> Option<String> {
        match self.suffix_strategy {
            SuffixStrategy::OnConflict => {
                Some(format!("policy-{}-{}", self.source_id, self.source_index))
            }
            SuffixStrategy::Never => None,
        }
    }

    /// Whether `user_id` may bypass this policy with `[skip ci]`.
    pub fn skip_ci_allowed_for_user(&self, user_id: u64) -> bool {
        self.skip_ci_rule.allowed || self.skip_ci_rule.allowlist.contains(&user_id)
    }

    /// SHA-256 digest of the policy content (deterministic).
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// All policies that apply to one pipeline.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    pub policies: Vec<PolicyConfig>,
}

impl PolicySet {
    pub fn new(policies: Vec<PolicyConfig>) -> Self {
        Self { policies }
    }

    /// `[skip ci]` is honoured only when every enforced policy allows it.
    pub fn skip_ci_allowed(&self, user_id: u64) -> bool {
        self.policies
            .iter()
            .all(|p| p.skip_ci_allowed_for_user(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY_YAML: &str = r#"
name: Enforce secret detection
pipeline_config_strategy: override_project_ci
suffix: never
content:
  include:
    - project: compliance/policies
      file: policy-ci.yml
skip_ci:
  allowed: false
  allowlist:
    users:
      - id: 42
variables_override:
  allowed: true
  exceptions: [TEST_TOKEN]
"#;

    #[test]
    fn test_from_yaml_full() {
        let policy = PolicyConfig::from_yaml(POLICY_YAML, 7, 1).expect("parse failed");

        assert_eq!(policy.name(), Some("Enforce secret detection"));
        assert_eq!(policy.strategy(), PipelineStrategy::OverrideProjectCi);
        assert_eq!(policy.suffix_strategy(), SuffixStrategy::Never);
        assert!(policy.skip_ci_rule().allowlist.contains(&42));
        let directive = policy.variables_override().expect("directive missing");
        assert!(directive.allowed);
        assert!(directive.exceptions.contains("TEST_TOKEN"));
        assert_eq!(
            policy.content()["include"][0]["file"],
            serde_json::json!("policy-ci.yml")
        );
    }

    #[test]
    fn test_from_yaml_defaults() {
        let policy = PolicyConfig::from_yaml("name: minimal\n", 3, 0).expect("parse failed");

        assert_eq!(policy.strategy(), PipelineStrategy::InjectPolicy);
        assert_eq!(policy.suffix_strategy(), SuffixStrategy::OnConflict);
        assert!(policy.variables_override().is_none());
        assert!(!policy.skip_ci_allowed_for_user(1));
    }

    #[test]
    fn test_legacy_inject_ci_alias() {
        let policy = PolicyConfig::from_yaml("pipeline_config_strategy: inject_ci\n", 1, 0)
            .expect("parse failed");
        assert_eq!(policy.strategy(), PipelineStrategy::InjectPolicy);
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        assert!(PolicyConfig::from_yaml("suffix: sometimes\n", 1, 0).is_err());
    }

    #[test]
    fn test_suffix() {
        let policy = PolicyConfig::new(12, 3);
        assert_eq!(policy.suffix().as_deref(), Some("policy-12-3"));

        let never = policy.with_suffix_strategy(SuffixStrategy::Never);
        assert!(never.suffix().is_none());
    }

    #[test]
    fn test_skip_ci_allowlist() {
        let policy = PolicyConfig::from_yaml(POLICY_YAML, 7, 1).unwrap();
        assert!(policy.skip_ci_allowed_for_user(42));
        assert!(!policy.skip_ci_allowed_for_user(43));

        let open = PolicyConfig::new(1, 0).with_skip_ci(SkipCiRule {
            allowed: true,
            allowlist: BTreeSet::new(),
        });
        assert!(open.skip_ci_allowed_for_user(43));
    }

    #[test]
    fn test_policy_set_requires_every_policy() {
        let open = PolicyConfig::new(1, 0).with_skip_ci(SkipCiRule {
            allowed: true,
            allowlist: BTreeSet::new(),
        });
        let closed = PolicyConfig::new(1, 1);

        assert!(PolicySet::new(vec![open.clone()]).skip_ci_allowed(5));
        assert!(!PolicySet::new(vec![open, closed]).skip_ci_allowed(5));
        assert!(PolicySet::default().skip_ci_allowed(5));
    }

    #[test]
    fn test_content_digest_deterministic() {
        let a = PolicyConfig::new(1, 0).with_content(serde_json::json!({"include": "a.yml"}));
        let b = PolicyConfig::new(2, 5).with_content(serde_json::json!({"include": "a.yml"}));
        let c = PolicyConfig::new(1, 0).with_content(serde_json::json!({"include": "b.yml"}));

        assert_eq!(a.content_digest(), b.content_digest());
        assert_ne!(a.content_digest(), c.content_digest());
        assert_eq!(a.content_digest().len(), 64);
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(PolicyConfig::new(4, 2).display_name(), "policy-4-2");
        assert_eq!(PolicyConfig::new(4, 2).with_name("p").display_name(), "p");
    }
}
