//! Stage ordering for merged pipelines.

use crate::error::{PolicyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Stage ordering used when a pipeline declares no `stages`.
pub const DEFAULT_STAGES: [&str; 5] = [".pre", "build", "test", "deploy", ".post"];

/// Reserved stage that always runs first; only policies may use it.
pub const RESERVED_PRE_STAGE: &str = ".pipeline-policy-pre";

/// Reserved stage that always runs last; only policies may use it.
pub const RESERVED_POST_STAGE: &str = ".pipeline-policy-post";

/// Default stage of on-demand scan jobs.
pub const ON_DEMAND_STAGE: &str = "dast";

/// Stage added for pipeline scans when the pipeline has no `test` stage.
pub const SCAN_POLICIES_STAGE: &str = "scan-policies";

/// Stage pipeline scan jobs run in when it exists.
pub const TEST_STAGE: &str = "test";

/// The on-demand stage goes after these.
pub const ON_DEMAND_ANCHORS: [&str; 1] = [".post"];

/// The scan-policies stage goes after these.
pub const PIPELINE_SCAN_ANCHORS: [&str; 2] = [".pre", "build"];

pub fn is_reserved(stage: &str) -> bool {
    stage == RESERVED_PRE_STAGE || stage == RESERVED_POST_STAGE
}

/// Ordered list of unique stage names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageGraph {
    stages: Vec<String>,
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::default_ordering()
    }
}

impl StageGraph {
    pub fn default_ordering() -> Self {
        Self {
            stages: DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Build from a declared `stages` list; an empty list means the default ordering.
    pub fn from_declared(stages: &[String]) -> Self {
        if stages.is_empty() {
            return Self::default_ordering();
        }
        let mut graph = Self {
            stages: stages.to_vec(),
        };
        graph.dedup();
        graph
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn into_vec(self) -> Vec<String> {
        self.stages
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s == stage)
    }

    pub fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// Whether this is structurally the default ordering.
    pub fn is_default(&self) -> bool {
        self.stages.iter().map(String::as_str).eq(DEFAULT_STAGES.iter().copied())
    }

    /// Drop repeated names, keeping the first occurrence.
    pub fn dedup(&mut self) {
        let mut seen = BTreeSet::new();
        self.stages.retain(|s| seen.insert(s.clone()));
    }

    /// Insert `stage` right after the last anchor present, or append it.
    pub fn insert_after_or_append(&mut self, stage: &str, anchors: &[&str]) {
        if self.contains(stage) {
            return;
        }
        match self.last_anchor_position(anchors) {
            Some(pos) => self.stages.insert(pos + 1, stage.to_string()),
            None => self.stages.push(stage.to_string()),
        }
    }

    /// Insert `stage` right after the last anchor present, or make it the first stage.
    pub fn insert_after_or_prepend(&mut self, stage: &str, anchors: &[&str]) {
        if self.contains(stage) {
            return;
        }
        match self.last_anchor_position(anchors) {
            Some(pos) => self.stages.insert(pos + 1, stage.to_string()),
            None => self.stages.insert(0, stage.to_string()),
        }
    }

    fn last_anchor_position(&self, anchors: &[&str]) -> Option<usize> {
        anchors.iter().filter_map(|a| self.position(a)).max()
    }

    /// Merge another declared ordering into this one.
    ///
    /// Consecutive stages of both lists become precedence constraints and the
    /// union is sorted topologically; ready stages are taken in order of first
    /// appearance (this graph first, then `declared`). Stages only present in
    /// `declared` are kept when `keep` returns `true`. Reserved stages are
    /// left out of the constraints and pinned to the ends afterwards.
    pub fn merge_ordering<F>(&self, declared: &[String], keep: F) -> Result<StageGraph>
    where
        F: Fn(&str) -> bool,
    {
        let mut nodes: Vec<&str> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for stage in self.stages.iter().chain(declared.iter()) {
            if is_reserved(stage) || index.contains_key(stage.as_str()) {
                continue;
            }
            index.insert(stage.as_str(), nodes.len());
            nodes.push(stage.as_str());
        }

        let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];
        for list in [&self.stages[..], declared] {
            let ordered: Vec<usize> = list
                .iter()
                .filter(|s| !is_reserved(s))
                .map(|s| index[s.as_str()])
                .collect();
            for pair in ordered.windows(2) {
                if pair[0] != pair[1] && edges[pair[0]].insert(pair[1]) {
                    in_degree[pair[1]] += 1;
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut sorted = Vec::with_capacity(nodes.len());
        while let Some(next) = ready.pop_first() {
            sorted.push(next);
            for &to in &edges[next] {
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    ready.insert(to);
                }
            }
        }

        if sorted.len() != nodes.len() {
            return Err(PolicyError::CyclicStages);
        }

        let mut merged = StageGraph {
            stages: sorted
                .into_iter()
                .map(|n| nodes[n])
                .filter(|s| self.contains(s) || keep(*s))
                .map(str::to_string)
                .collect(),
        };

        for reserved in [RESERVED_PRE_STAGE, RESERVED_POST_STAGE] {
            if self.contains(reserved) || (declared.iter().any(|s| s == reserved) && keep(reserved)) {
                merged.stages.push(reserved.to_string());
            }
        }
        merged.pin_reserved_stages();
        Ok(merged)
    }

    /// Add a reserved stage (no-op for other names) and move reserved stages to the ends.
    pub fn add_reserved(&mut self, stage: &str) {
        if is_reserved(stage) && !self.contains(stage) {
            self.stages.push(stage.to_string());
        }
        self.pin_reserved_stages();
    }

    fn pin_reserved_stages(&mut self) {
        if let Some(pos) = self.position(RESERVED_PRE_STAGE) {
            let stage = self.stages.remove(pos);
            self.stages.insert(0, stage);
        }
        if let Some(pos) = self.position(RESERVED_POST_STAGE) {
            let stage = self.stages.remove(pos);
            self.stages.push(stage);
        }
    }
}
