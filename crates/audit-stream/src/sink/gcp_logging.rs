//! Cloud logging destinations.

use super::{Delivery, Sink};
use crate::destination::{Destination, DestinationCategory, DestinationConfig, GcpLoggingConfig};
use crate::error::{Result, StreamError};
use crate::event::AuditEvent;
use crate::format;
use crate::metrics::METRICS;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

/// Writes log entries; returns the raw response body.
#[async_trait]
pub trait CloudLoggingClient: Send + Sync {
    async fn write_entries(&self, config: &GcpLoggingConfig, body: Value) -> Result<String>;
}

/// Delivers events to `gcp_logging` destinations.
pub struct CloudLoggingSink {
    client: Arc<dyn CloudLoggingClient>,
}

impl CloudLoggingSink {
    pub fn new(client: Arc<dyn CloudLoggingClient>) -> Self {
        Self { client }
    }

    async fn write(&self, config: &GcpLoggingConfig, event: &AuditEvent) -> Result<()> {
        let has_credentials = config.client_email.as_deref().is_some_and(|e| !e.is_empty())
            && config.private_key.as_deref().is_some_and(|k| !k.is_empty());
        if !has_credentials {
            return Err(StreamError::Config(format!(
                "cloud logging destination for {} is missing credentials",
                config.project_id
            )));
        }

        let raw = self
            .client
            .write_entries(config, format::logging_envelope(config, event))
            .await?;

        // An empty body is a valid reply to entries.write.
        if !raw.trim().is_empty() {
            serde_json::from_str::<Value>(&raw).map_err(|e| StreamError::Parse(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for CloudLoggingSink {
    fn category(&self) -> DestinationCategory {
        DestinationCategory::GcpLogging
    }

    async fn deliver(&self, destination: &Destination, event: &AuditEvent) -> Result<Delivery> {
        let DestinationConfig::GcpLogging(config) = &destination.config else {
            return Err(StreamError::Config(format!(
                "destination {} is not a gcp_logging destination",
                destination.id
            )));
        };

        match self.write(config, event).await {
            Ok(()) => Ok(Delivery {
                status_code: None,
                location: format::log_name(config),
            }),
            Err(e) if e.is_transport() => {
                warn!(
                    event = "stream.gcp_logging.transport_error",
                    destination_id = %destination.id,
                    error = %e,
                );
                Err(e)
            }
            Err(e) => {
                error!(
                    event = "stream.gcp_logging.unexpected_error",
                    destination_id = %destination.id,
                    kind = e.kind(),
                    error = %e,
                );
                METRICS.inc_unexpected_errors();
                Err(e)
            }
        }
    }
}
