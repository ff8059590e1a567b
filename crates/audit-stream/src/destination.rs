//! Configured external destinations for audit events.

use crate::error::{Result, StreamError};
use crate::event::AuditEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Maximum number of custom headers on an HTTP destination.
pub const MAX_HEADERS: usize = 20;

/// Accepted length of an HTTP verification token.
pub const SECRET_TOKEN_LENGTH: std::ops::RangeInclusive<usize> = 16..=24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationCategory {
    Http,
    AwsS3,
    GcpLogging,
}

impl DestinationCategory {
    pub fn name(&self) -> &'static str {
        match self {
            DestinationCategory::Http => "http",
            DestinationCategory::AwsS3 => "aws_s3",
            DestinationCategory::GcpLogging => "gcp_logging",
        }
    }
}

/// One custom header; inactive headers are not sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderValue {
    pub value: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    /// Shared secret used to sign payloads and as verification token.
    #[serde(default)]
    pub secret_token: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpLoggingConfig {
    pub project_id: String,
    #[serde(default = "default_log_id")]
    pub log_id: String,
    #[serde(default)]
    pub client_email: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

/// Category-specific settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum DestinationConfig {
    Http(HttpConfig),
    AwsS3(S3Config),
    GcpLogging(GcpLoggingConfig),
}

impl DestinationConfig {
    pub fn category(&self) -> DestinationCategory {
        match self {
            DestinationConfig::Http(_) => DestinationCategory::Http,
            DestinationConfig::AwsS3(_) => DestinationCategory::AwsS3,
            DestinationConfig::GcpLogging(_) => DestinationCategory::GcpLogging,
        }
    }
}

/// An external sink that receives streamed audit events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    #[serde(default = "default_name")]
    pub name: String,
    pub config: DestinationConfig,
    /// Event types to deliver; empty means every type.
    #[serde(default)]
    pub event_type_filters: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Only deliver events whose entity lives in this namespace.
    #[serde(default)]
    pub namespace_filter: Option<String>,
}

impl Destination {
    pub fn new(id: &str, config: DestinationConfig) -> Self {
        Self {
            id: id.to_string(),
            name: default_name(),
            config,
            event_type_filters: BTreeSet::new(),
            active: true,
            namespace_filter: None,
        }
    }

    pub fn http(id: &str, url: &str) -> Self {
        Self::new(
            id,
            DestinationConfig::Http(HttpConfig {
                url: url.to_string(),
                secret_token: None,
                headers: BTreeMap::new(),
            }),
        )
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_event_types(mut self, event_types: &[&str]) -> Self {
        self.event_type_filters = event_types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_namespace_filter(mut self, full_path: &str) -> Self {
        self.namespace_filter = Some(full_path.to_string());
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn category(&self) -> DestinationCategory {
        self.config.category()
    }

    /// Whether this destination should receive `event`.
    pub fn accepts(&self, event: &AuditEvent) -> bool {
        if !self.active {
            return false;
        }
        if !self.event_type_filters.is_empty() && !self.event_type_filters.contains(&event.event_type)
        {
            return false;
        }
        match &self.namespace_filter {
            Some(prefix) => event.entity.in_namespace(prefix),
            None => true,
        }
    }

    /// Check the settings a destination must satisfy before it is saved.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StreamError::Config("destination id is required".to_string()));
        }

        match &self.config {
            DestinationConfig::Http(http) => {
                if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                    return Err(StreamError::Config(format!(
                        "destination {}: url must be http(s)",
                        self.id
                    )));
                }
                if let Some(token) = &http.secret_token {
                    if !SECRET_TOKEN_LENGTH.contains(&token.len()) {
                        return Err(StreamError::Config(
                            "Secret token should have length between 16 to 24 characters."
                                .to_string(),
                        ));
                    }
                }
                if http.headers.len() > MAX_HEADERS {
                    return Err(StreamError::Config(format!(
                        "destination {}: at most {} headers are allowed",
                        self.id, MAX_HEADERS
                    )));
                }
                if let Some((key, _)) = http
                    .headers
                    .iter()
                    .find(|(_, h)| h.value.trim() != h.value || h.value.is_empty())
                {
                    return Err(StreamError::Config(format!(
                        "destination {}: header {} has an invalid value",
                        self.id, key
                    )));
                }
            }
            DestinationConfig::AwsS3(s3) => {
                if s3.bucket.is_empty() || s3.region.is_empty() {
                    return Err(StreamError::Config(format!(
                        "destination {}: bucket and region are required",
                        self.id
                    )));
                }
            }
            DestinationConfig::GcpLogging(gcp) => {
                if gcp.project_id.is_empty() {
                    return Err(StreamError::Config(format!(
                        "destination {}: project_id is required",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_log_id() -> String {
    "audit_events".to_string()
}

fn default_name() -> String {
    format!("Destination_{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Author, EntityRef};
    use chrono::Utc;

    fn event(event_type: &str, entity: EntityRef) -> AuditEvent {
        AuditEvent::new(event_type, entity, Author::default(), Utc::now())
    }

    #[test]
    fn test_empty_filters_accept_everything() {
        let dest = Destination::http("d1", "https://example.com/hook");
        assert!(dest.accepts(&event("anything", EntityRef::Instance)));
    }

    #[test]
    fn test_event_type_filters() {
        let dest = Destination::http("d1", "https://example.com").with_event_types(&["project_destroyed"]);
        assert!(dest.accepts(&event("project_destroyed", EntityRef::Instance)));
        assert!(!dest.accepts(&event("project_created", EntityRef::Instance)));
    }

    #[test]
    fn test_inactive_destination_accepts_nothing() {
        let dest = Destination::http("d1", "https://example.com").with_active(false);
        assert!(!dest.accepts(&event("x", EntityRef::Instance)));
    }

    #[test]
    fn test_namespace_filter() {
        let dest = Destination::http("d1", "https://example.com").with_namespace_filter("acme");
        assert!(dest.accepts(&event("x", EntityRef::project(1, "acme/api"))));
        assert!(!dest.accepts(&event("x", EntityRef::project(1, "other/api"))));
        assert!(!dest.accepts(&event("x", EntityRef::Instance)));
    }

    #[test]
    fn test_default_name_generated() {
        let dest = Destination::http("d1", "https://example.com");
        assert!(dest.name.starts_with("Destination_"));
    }

    #[test]
    fn test_validate_secret_token_length() {
        let mut dest = Destination::http("d1", "https://example.com");
        if let DestinationConfig::Http(http) = &mut dest.config {
            http.secret_token = Some("invalid".to_string());
        }
        let err = dest.validate().unwrap_err();
        assert!(err.to_string().contains("between 16 to 24"));

        if let DestinationConfig::Http(http) = &mut dest.config {
            http.secret_token = Some("valid_secure_token_123".to_string());
        }
        assert!(dest.validate().is_ok());
    }

    #[test]
    fn test_validate_too_many_headers() {
        let mut dest = Destination::http("d1", "https://example.com");
        if let DestinationConfig::Http(http) = &mut dest.config {
            for i in 0..=MAX_HEADERS {
                http.headers.insert(
                    format!("Key{i}"),
                    HeaderValue {
                        value: format!("Value{i}"),
                        active: true,
                    },
                );
            }
        }
        assert!(dest.validate().is_err());
    }

    #[test]
    fn test_config_tagged_by_category() {
        let config: DestinationConfig = serde_json::from_value(serde_json::json!({
            "category": "aws_s3",
            "bucket": "audit",
            "region": "us-east-1"
        }))
        .unwrap();
        assert_eq!(config.category(), DestinationCategory::AwsS3);
    }
}
