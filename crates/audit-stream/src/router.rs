//! Fan-out of one audit event to every matching destination.

use crate::config::StreamingConfig;
use crate::destination::{Destination, DestinationCategory};
use crate::error::{Result, StreamError};
use crate::event::AuditEvent;
use crate::metrics::METRICS;
use crate::sink::{Delivery, Sink, TimeoutSink};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Per-destination outcome of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub destination_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    fn from_outcome(destination: &Destination, outcome: Result<Delivery>) -> Self {
        match outcome {
            Ok(delivery) => Self {
                destination_id: destination.id.clone(),
                success: true,
                status_code: delivery.status_code,
                error: None,
            },
            Err(e) => Self {
                destination_id: destination.id.clone(),
                success: false,
                status_code: e.status_code(),
                error: Some(e.to_string()),
            },
        }
    }

    /// The status code when known, else the error text.
    pub fn status_code_or_error(&self) -> String {
        match (&self.status_code, &self.error) {
            (Some(code), _) => code.to_string(),
            (None, Some(error)) => error.clone(),
            (None, None) => "ok".to_string(),
        }
    }
}

/// Routes events to destinations through category sinks.
///
/// Every registered sink is wrapped in a [`TimeoutSink`]; a slow or failing
/// destination only degrades its own result.
pub struct AuditEventRouter {
    destinations: Vec<Destination>,
    sinks: HashMap<DestinationCategory, Arc<dyn Sink>>,
    timeout: Duration,
    max_in_flight: usize,
}

impl AuditEventRouter {
    pub fn new(destinations: Vec<Destination>, config: &StreamingConfig) -> Self {
        Self {
            destinations,
            sinks: HashMap::new(),
            timeout: config.timeout,
            max_in_flight: config.max_in_flight.max(1),
        }
    }

    /// Register the sink for its category, replacing any previous one.
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        let category = sink.category();
        self.sinks
            .insert(category, Arc::new(TimeoutSink::new(sink, self.timeout)));
        self
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Destinations that should receive `event`.
    pub fn matching(&self, event: &AuditEvent) -> Vec<&Destination> {
        self.destinations
            .iter()
            .filter(|d| d.accepts(event))
            .collect()
    }

    /// Deliver `event` to every matching destination, at most
    /// `max_in_flight` at a time.
    ///
    /// Results come back in destination order. Failures are reported, never
    /// propagated, so one broken destination cannot block the others.
    pub async fn route(&self, event: &AuditEvent) -> Vec<DeliveryResult> {
        let targets = self.matching(event);
        info!(
            event = "stream.route",
            event_type = %event.event_type,
            destinations = targets.len(),
        );

        let outcomes: Vec<Result<Delivery>> = stream::iter(targets.iter())
            .map(|d| self.deliver_one(d, event))
            .buffered(self.max_in_flight)
            .collect()
            .await;

        targets
            .into_iter()
            .zip(outcomes)
            .map(|(destination, outcome)| {
                match &outcome {
                    Ok(_) => METRICS.inc_deliveries_succeeded(),
                    Err(e) => {
                        METRICS.inc_deliveries_failed();
                        warn!(
                            event = "stream.delivery_failed",
                            destination_id = %destination.id,
                            category = destination.category().name(),
                            kind = e.kind(),
                            error = %e,
                        );
                    }
                }
                DeliveryResult::from_outcome(destination, outcome)
            })
            .collect()
    }

    async fn deliver_one(&self, destination: &Destination, event: &AuditEvent) -> Result<Delivery> {
        let sink = self.sinks.get(&destination.category()).ok_or_else(|| {
            StreamError::Config(format!(
                "no sink registered for {} destinations",
                destination.category().name()
            ))
        })?;
        sink.deliver(destination, event).await
    }
}
