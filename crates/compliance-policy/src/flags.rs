//! Feature flags passed explicitly into constructors.
//!
//! There is no ambient flag service: whoever builds a merger or a router
//! decides which flags are on, which keeps behavior deterministic in tests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Omit the `stages` key when the merged stage list equals the default ordering.
pub const OMIT_DEFAULT_STAGES: &str = "omit_default_stages";

/// Stop streaming audit events to every external destination.
pub const DISABLE_AUDIT_EVENT_STREAMING: &str = "disable_audit_event_streaming";

/// Set of enabled feature flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    enabled: BTreeSet<String>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::none().with(OMIT_DEFAULT_STAGES)
    }
}

impl FeatureFlags {
    /// No flags enabled.
    pub fn none() -> Self {
        Self {
            enabled: BTreeSet::new(),
        }
    }

    /// Enable a flag and return `self` (builder pattern).
    pub fn with(mut self, flag: &str) -> Self {
        self.enabled.insert(flag.to_string());
        self
    }

    /// Disable a flag and return `self`.
    pub fn without(mut self, flag: &str) -> Self {
        self.enabled.remove(flag);
        self
    }

    pub fn enabled(&self, flag: &str) -> bool {
        self.enabled.contains(flag)
    }

    /// Parse a comma separated list such as `"omit_default_stages,disable_audit_event_streaming"`.
    pub fn parse_list(list: &str) -> Self {
        list.split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .fold(Self::none(), |flags, f| flags.with(f))
    }
}
