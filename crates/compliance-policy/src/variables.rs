//! Variable precedence between user variables and policy directives.

use crate::error::{PolicyError, Result};
use crate::policy::{PolicyConfig, VariablesOverride};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single key/value variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
}

impl Variable {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Ordered variable list. Later entries take precedence over earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableCollection {
    variables: Vec<Variable>,
}

impl VariableCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        pairs.iter().map(|(k, v)| Variable::new(k, v)).collect()
    }

    /// Parse a `variables:` map. Scalars are stringified and `{value: ...}`
    /// entries are unwrapped.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = match value {
            Value::Null => return Ok(Self::new()),
            Value::Object(map) => map,
            _ => {
                return Err(PolicyError::Config(
                    "`variables` must be a map".to_string(),
                ))
            }
        };

        map.iter()
            .map(|(key, raw)| {
                let raw = match raw {
                    Value::Object(inner) => inner.get("value").unwrap_or(&Value::Null),
                    other => other,
                };
                let value = match raw {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    Value::Null => String::new(),
                    _ => {
                        return Err(PolicyError::Config(format!(
                            "variable `{}` must be a scalar",
                            key
                        )))
                    }
                };
                Ok(Variable {
                    key: key.clone(),
                    value,
                })
            })
            .collect()
    }

    pub fn push(&mut self, variable: Variable) {
        self.variables.push(variable);
    }

    /// Append `other` after `self`, so `other` wins on key collisions.
    pub fn concat(mut self, other: &VariableCollection) -> Self {
        self.variables.extend(other.variables.iter().cloned());
        self
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.variables.iter()
    }

    /// Effective value of `key` (the last entry wins).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.variables
            .iter()
            .rev()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    /// Keys in order of first declaration.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for variable in &self.variables {
            if !keys.contains(&variable.key.as_str()) {
                keys.push(&variable.key);
            }
        }
        keys
    }

    /// Deduplicated view handed to the runner; each key keeps its effective
    /// value and the position of its last declaration.
    pub fn to_runner_map(&self) -> Vec<Variable> {
        let mut out: Vec<Variable> = Vec::with_capacity(self.variables.len());
        for variable in &self.variables {
            out.retain(|v| v.key != variable.key);
            out.push(variable.clone());
        }
        out
    }

    fn filter<F>(&self, keep: F) -> Self
    where
        F: Fn(&Variable) -> bool,
    {
        self.variables.iter().filter(|v| keep(*v)).cloned().collect()
    }
}

impl FromIterator<Variable> for VariableCollection {
    fn from_iter<I: IntoIterator<Item = Variable>>(iter: I) -> Self {
        Self {
            variables: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a VariableCollection {
    type Item = &'a Variable;
    type IntoIter = std::slice::Iter<'a, Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.variables.iter()
    }
}

/// What the resolver needs to know about one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobVariables {
    pub name: String,
    /// Variables declared in the job's YAML (global variables first).
    pub yaml_variables: VariableCollection,
    /// Whether the job was injected by a pipeline execution policy.
    pub policy_job: bool,
    pub variables_override: Option<VariablesOverride>,
}

impl JobVariables {
    /// Describe a merged job. Policy jobs inherit the directive of `policy`.
    pub fn from_job(
        name: &str,
        body: &Value,
        globals: &VariableCollection,
        policy: Option<&PolicyConfig>,
    ) -> Result<Self> {
        let own = VariableCollection::from_value(body.get("variables").unwrap_or(&Value::Null))?;
        Ok(Self {
            name: name.to_string(),
            yaml_variables: globals.clone().concat(&own),
            policy_job: policy.is_some(),
            variables_override: policy.and_then(|p| p.variables_override().cloned()),
        })
    }
}

/// Decides which variables a job finally receives.
pub struct VariableOverrideResolver;

impl VariableOverrideResolver {
    /// Apply an override directive to user variables.
    ///
    /// * no directive: unchanged
    /// * `allowed: true`: everything except the listed exceptions
    /// * `allowed: false`: only the listed exceptions
    pub fn filter_user_variables(
        user_variables: &VariableCollection,
        directive: Option<&VariablesOverride>,
    ) -> VariableCollection {
        match directive {
            None => user_variables.clone(),
            Some(d) if d.allowed => user_variables.filter(|v| !d.exceptions.contains(&v.key)),
            Some(d) => user_variables.filter(|v| d.exceptions.contains(&v.key)),
        }
    }

    /// Final ordered collection for `job`; later entries win on collisions.
    ///
    /// Project jobs let user variables override YAML variables. Policy jobs
    /// without a directive let policy variables override user variables.
    /// Policy jobs with a directive accept only the user variables the
    /// directive lets through.
    pub fn resolve_job_variables(
        job: &JobVariables,
        user_variables: &VariableCollection,
    ) -> VariableCollection {
        let resolved = if !job.policy_job {
            job.yaml_variables.clone().concat(user_variables)
        } else {
            match &job.variables_override {
                None => user_variables.clone().concat(&job.yaml_variables),
                Some(directive) => job
                    .yaml_variables
                    .clone()
                    .concat(&Self::filter_user_variables(user_variables, Some(directive))),
            }
        };

        tracing::debug!(
            event = "variables.resolved",
            job = %job.name,
            policy_job = job.policy_job,
            directive = job.variables_override.is_some(),
            count = resolved.len(),
        );
        resolved
    }
}
