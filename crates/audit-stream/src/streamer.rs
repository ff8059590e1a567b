//! Streaming job entry point.
//!
//! An outer job queue calls [`AuditEventStreamer::perform`] once per
//! persisted (or stream-only) audit event. Retries belong to that queue;
//! events are immutable so replaying them is safe.

use crate::config::StreamingConfig;
use crate::destination::Destination;
use crate::error::{Result, StreamError};
use crate::event::AuditEvent;
use crate::metrics::METRICS;
use crate::router::{AuditEventRouter, DeliveryResult};
use crate::sink::Sink;
use async_trait::async_trait;
use compliance_policy::{FeatureFlags, DISABLE_AUDIT_EVENT_STREAMING};
use std::sync::Arc;
use tracing::{info, warn};

/// Persistence layer supplying events and destinations.
#[async_trait]
pub trait AuditEventStore: Send + Sync {
    async fn find_event(&self, id: u64) -> Result<Option<AuditEvent>>;

    async fn destinations(&self) -> Result<Vec<Destination>>;
}

pub struct AuditEventStreamer {
    store: Arc<dyn AuditEventStore>,
    sinks: Vec<Arc<dyn Sink>>,
    flags: FeatureFlags,
    config: StreamingConfig,
}

impl AuditEventStreamer {
    pub fn new(store: Arc<dyn AuditEventStore>, flags: FeatureFlags, config: StreamingConfig) -> Self {
        Self {
            store,
            sinks: Vec::new(),
            flags,
            config,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Stream one event, given either its id or its JSON, never both.
    ///
    /// Returns no results when streaming is switched off, when the event
    /// cannot be found or parsed, or when no destination is configured.
    pub async fn perform(
        &self,
        event_type: &str,
        audit_event_id: Option<u64>,
        audit_event_json: Option<&str>,
    ) -> Result<Vec<DeliveryResult>> {
        if audit_event_id.is_some() && audit_event_json.is_some() {
            return Err(StreamError::Argument(
                "audit_event_id and audit_event_json cannot be passed together".to_string(),
            ));
        }

        if self.flags.enabled(DISABLE_AUDIT_EVENT_STREAMING) {
            info!(event = "stream.disabled", event_type = %event_type);
            return Ok(Vec::new());
        }
        if self.config.silent_mode {
            info!(event = "stream.silent_mode", event_type = %event_type);
            return Ok(Vec::new());
        }

        let Some(mut event) = self.resolve_event(audit_event_id, audit_event_json).await? else {
            return Ok(Vec::new());
        };
        if !event_type.is_empty() {
            event.event_type = event_type.to_string();
        }

        let destinations = self.store.destinations().await?;
        if destinations.is_empty() {
            return Ok(Vec::new());
        }

        let router = self
            .sinks
            .iter()
            .fold(AuditEventRouter::new(destinations, &self.config), |router, sink| {
                router.with_sink(Arc::clone(sink))
            });

        METRICS.inc_events_streamed();
        Ok(router.route(&event).await)
    }

    async fn resolve_event(&self, id: Option<u64>, json: Option<&str>) -> Result<Option<AuditEvent>> {
        if let Some(json) = json {
            return match AuditEvent::from_json(json) {
                Ok(event) => Ok(Some(event)),
                Err(e) => {
                    warn!(event = "stream.invalid_event_json", error = %e);
                    Ok(None)
                }
            };
        }

        let Some(id) = id else {
            return Ok(None);
        };
        let event = self.store.find_event(id).await?;
        if event.is_none() {
            warn!(event = "stream.event_not_found", audit_event_id = id);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Author, EntityRef};
    use crate::fakes::{MemoryAuditEventStore, MemoryHttpTransport};
    use crate::sink::HttpSink;
    use chrono::Utc;

    fn setup(flags: FeatureFlags, config: StreamingConfig) -> (AuditEventStreamer, Arc<MemoryHttpTransport>) {
        let store = Arc::new(MemoryAuditEventStore::new());
        store
            .insert(
                AuditEvent::new("group_created", EntityRef::group(1, "acme"), Author::default(), Utc::now())
                    .with_id(10),
            )
            .unwrap();
        store.add_destination(Destination::http("hook", "https://hooks.example.com"));

        let transport = Arc::new(MemoryHttpTransport::new());
        let streamer = AuditEventStreamer::new(store, flags, config)
            .with_sink(Arc::new(HttpSink::new(transport.clone())));
        (streamer, transport)
    }

    #[tokio::test]
    async fn test_streams_stored_event() {
        let (streamer, transport) = setup(FeatureFlags::none(), StreamingConfig::default());

        let results = streamer.perform("group_created", Some(10), None).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_id_and_json_together_is_an_error() {
        let (streamer, _) = setup(FeatureFlags::none(), StreamingConfig::default());
        let err = streamer
            .perform("group_created", Some(10), Some("{}"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "audit_event_id and audit_event_json cannot be passed together"
        );
    }

    #[tokio::test]
    async fn test_disabled_flag_delivers_nothing() {
        let flags = FeatureFlags::none().with(DISABLE_AUDIT_EVENT_STREAMING);
        let (streamer, transport) = setup(flags, StreamingConfig::default());

        let results = streamer.perform("group_created", Some(10), None).await.unwrap();
        assert!(results.is_empty());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_silent_mode_delivers_nothing() {
        let (streamer, transport) = setup(
            FeatureFlags::none(),
            StreamingConfig::default().with_silent_mode(true),
        );

        assert!(streamer.perform("group_created", Some(10), None).await.unwrap().is_empty());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_event_and_bad_json_are_logged() {
        let (streamer, transport) = setup(FeatureFlags::none(), StreamingConfig::default());

        assert!(streamer.perform("x", Some(999), None).await.unwrap().is_empty());
        assert!(streamer.perform("x", None, Some("{oops")).await.unwrap().is_empty());
        assert!(streamer.perform("x", None, None).await.unwrap().is_empty());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_streams_json_event() {
        let (streamer, transport) = setup(FeatureFlags::none(), StreamingConfig::default());
        let json = r#"{
            "event_type": "ignored",
            "entity": {"entity_type": "instance"},
            "timestamp": "2024-03-05T00:00:00Z",
            "message": "Instance setting changed"
        }"#;

        let results = streamer.perform("application_setting_updated", None, Some(json)).await.unwrap();

        assert_eq!(results.len(), 1);
        let requests = transport.requests();
        assert_eq!(requests[0].header("X-Audit-Event-Type"), Some("application_setting_updated"));
    }
}
