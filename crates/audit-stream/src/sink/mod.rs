//! Delivery strategies, one per destination category.
//!
//! A [`Sink`] turns an event into a category-specific request and hands it
//! to an injected client. Sinks compose: [`TimeoutSink`] wraps any sink and
//! bounds each delivery by a wall-clock timeout.

pub mod gcp_logging;
pub mod http;
pub mod object_store;

pub use gcp_logging::{CloudLoggingClient, CloudLoggingSink};
pub use http::{HttpRequest, HttpResponse, HttpSink, HttpTransport, ReqwestTransport};
pub use object_store::{ObjectStore, ObjectStoreSink, S3Credentials};

use crate::destination::{Destination, DestinationCategory};
use crate::error::{Result, StreamError};
use crate::event::AuditEvent;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// HTTP status when the sink talks HTTP.
    pub status_code: Option<u16>,
    /// Object key, log name or URL the event was delivered to.
    pub location: String,
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Category of destinations this sink serves.
    fn category(&self) -> DestinationCategory;

    async fn deliver(&self, destination: &Destination, event: &AuditEvent) -> Result<Delivery>;
}

/// Bounds every delivery of the wrapped sink by `timeout`.
pub struct TimeoutSink {
    inner: Arc<dyn Sink>,
    timeout: Duration,
}

impl TimeoutSink {
    pub fn new(inner: Arc<dyn Sink>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl Sink for TimeoutSink {
    fn category(&self) -> DestinationCategory {
        self.inner.category()
    }

    async fn deliver(&self, destination: &Destination, event: &AuditEvent) -> Result<Delivery> {
        match tokio::time::timeout(self.timeout, self.inner.deliver(destination, event)).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Timeout(self.timeout)),
        }
    }
}
