//! Request bodies, object keys and signatures for each destination category.

use crate::destination::GcpLoggingConfig;
use crate::error::{Result, StreamError};
use crate::event::{AuditEvent, EntityRef};
use chrono::Datelike;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::OnceLock;

/// Header carrying the hex HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "X-Audit-Event-Signature";

/// Header carrying the destination's verification token.
pub const TOKEN_HEADER: &str = "X-Audit-Event-Streaming-Token";

pub const EVENT_TYPE_HEADER: &str = "X-Audit-Event-Type";

static NON_ALPHANUMERIC_RUN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();

/// Streamed JSON representation of an event.
pub fn payload(event: &AuditEvent) -> Value {
    let mut details = event.payload.clone();
    details.insert("custom_message".to_string(), json!(event.message));
    details.insert("author_name".to_string(), json!(event.author.name));
    if !event.changes.is_empty() {
        details.insert("changes".to_string(), json!(event.changes));
    }

    json!({
        "id": event.event_id(),
        "event_type": event.event_type,
        "author_id": event.author.id,
        "author_name": event.author.name,
        "entity_id": event.entity.entity_id(),
        "entity_type": event.entity.entity_type(),
        "entity_path": event.entity.entity_path(),
        "target_id": event.target.as_ref().and_then(|t| t.id),
        "target_type": event.target.as_ref().map(|t| t.target_type.as_str()),
        "target_details": event.target.as_ref().map(|t| t.details.as_str()),
        "created_at": event.timestamp.to_rfc3339(),
        "changed_columns": event.changed_columns(),
        "details": details,
    })
}

/// Raw body bytes, the exact bytes that get signed.
pub fn payload_bytes(event: &AuditEvent) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&payload(event))?)
}

/// Hex-encoded HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| StreamError::Config(format!("invalid signing key: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Lower-case and collapse every non-alphanumeric run into `_`.
///
/// Used for every caller-supplied part of an object key, so the result never
/// contains `/`. Leading and trailing runs become `_` as well.
pub fn normalize_key_segment(segment: &str) -> Result<String> {
    let re = NON_ALPHANUMERIC_RUN
        .get_or_init(|| Regex::new(r"[^a-z0-9]+"))
        .as_ref()
        .map_err(|e| StreamError::Config(e.to_string()))?;

    let lowered = segment.to_lowercase();
    Ok(re.replace_all(&lowered, "_").into_owned())
}

/// Object storage key, `{entity}/{yyyy}/{mm}/{event_type}_{event_id}_{epoch_ms}.json`.
pub fn object_key(event: &AuditEvent) -> Result<String> {
    let prefix = match &event.entity {
        EntityRef::Instance => "instance".to_string(),
        EntityRef::User { .. } => "user".to_string(),
        other => normalize_key_segment(other.entity_type())?,
    };

    Ok(format!(
        "{}/{:04}/{:02}/{}_{}_{}.json",
        prefix,
        event.timestamp.year(),
        event.timestamp.month(),
        normalize_key_segment(&event.event_type)?,
        event.event_id(),
        event.timestamp.timestamp_millis()
    ))
}

/// Log name of a cloud logging destination.
pub fn log_name(config: &GcpLoggingConfig) -> String {
    format!("projects/{}/logs/{}", config.project_id, config.log_id)
}

/// Cloud logging `entries.write` body for one event.
pub fn logging_envelope(config: &GcpLoggingConfig, event: &AuditEvent) -> Value {
    json!({
        "entries": [{
            "logName": log_name(config),
            "resource": {"type": "global"},
            "severity": "INFO",
            "jsonPayload": payload(event),
        }]
    })
}
