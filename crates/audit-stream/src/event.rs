//! Audit events and the entities they describe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// The entity an audit event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum EntityRef {
    Group { id: u64, full_path: String },
    Project { id: u64, full_path: String },
    /// Instance-wide events have no owning namespace.
    Instance,
    User { id: u64, username: String },
    Other { kind: String, id: u64 },
}

impl EntityRef {
    pub fn group(id: u64, full_path: &str) -> Self {
        EntityRef::Group {
            id,
            full_path: full_path.to_string(),
        }
    }

    pub fn project(id: u64, full_path: &str) -> Self {
        EntityRef::Project {
            id,
            full_path: full_path.to_string(),
        }
    }

    pub fn user(id: u64, username: &str) -> Self {
        EntityRef::User {
            id,
            username: username.to_string(),
        }
    }

    /// Display type name, e.g. `Project`.
    pub fn entity_type(&self) -> &str {
        match self {
            EntityRef::Group { .. } => "Group",
            EntityRef::Project { .. } => "Project",
            EntityRef::Instance => "Instance",
            EntityRef::User { .. } => "User",
            EntityRef::Other { kind, .. } => kind,
        }
    }

    pub fn entity_id(&self) -> Option<u64> {
        match self {
            EntityRef::Group { id, .. }
            | EntityRef::Project { id, .. }
            | EntityRef::User { id, .. }
            | EntityRef::Other { id, .. } => Some(*id),
            EntityRef::Instance => None,
        }
    }

    /// Full path of the entity, when it has one.
    pub fn entity_path(&self) -> Option<&str> {
        match self {
            EntityRef::Group { full_path, .. } | EntityRef::Project { full_path, .. } => {
                Some(full_path)
            }
            EntityRef::User { username, .. } => Some(username),
            EntityRef::Instance | EntityRef::Other { .. } => None,
        }
    }

    /// Whether the entity lives at or below the namespace `prefix`.
    pub fn in_namespace(&self, prefix: &str) -> bool {
        match self {
            EntityRef::Group { full_path, .. } | EntityRef::Project { full_path, .. } => {
                let prefix = prefix.trim_end_matches('/');
                full_path == prefix
                    || full_path
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            _ => false,
        }
    }
}

/// Who performed the audited action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: u64,
    pub name: String,
}

/// Before/after values of one changed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub from: Value,
    pub to: Value,
}

/// What the action was applied to, when different from the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub target_type: String,
    pub details: String,
}

/// A persisted, immutable audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Database id; stream-only events have none.
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub event_type: String,
    pub entity: EntityRef,
    #[serde(default)]
    pub author: Author,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, Value>,
    #[serde(default)]
    pub changes: BTreeMap<String, ColumnChange>,
    #[serde(default)]
    pub target: Option<Target>,
}

impl AuditEvent {
    pub fn new(event_type: &str, entity: EntityRef, author: Author, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            uuid: Uuid::new_v4(),
            event_type: event_type.to_string(),
            entity,
            author,
            timestamp,
            message: String::new(),
            payload: serde_json::Map::new(),
            changes: BTreeMap::new(),
            target: None,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn with_change(mut self, column: &str, from: Value, to: Value) -> Self {
        self.changes
            .insert(column.to_string(), ColumnChange { from, to });
        self
    }

    pub fn with_payload(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn changed_columns(&self) -> BTreeSet<&str> {
        self.changes.keys().map(String::as_str).collect()
    }

    /// Identifier used in object keys: the database id, or the uuid for stream-only events.
    pub fn event_id(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => self.uuid.to_string(),
        }
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
