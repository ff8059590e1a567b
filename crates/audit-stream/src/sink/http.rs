//! HTTP destinations: signed JSON POSTs.

use super::{Delivery, Sink};
use crate::destination::{Destination, DestinationCategory, DestinationConfig, HttpConfig};
use crate::error::{Result, StreamError};
use crate::event::AuditEvent;
use crate::format::{self, EVENT_TYPE_HEADER, SIGNATURE_HEADER, TOKEN_HEADER};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outbound POST request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Sends HTTP requests. Implementations report unreachable hosts as
/// `StreamError::Transport` and return every received response as-is.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// `HttpTransport` backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("audit-stream/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

/// Delivers events to `http` destinations.
pub struct HttpSink {
    transport: Arc<dyn HttpTransport>,
}

impl HttpSink {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Build the signed request for one destination.
    pub fn build_request(config: &HttpConfig, event: &AuditEvent) -> Result<HttpRequest> {
        let body = format::payload_bytes(event)?;

        let mut headers = vec![(EVENT_TYPE_HEADER.to_string(), event.event_type.clone())];
        if let Some(secret) = &config.secret_token {
            headers.push((SIGNATURE_HEADER.to_string(), format::sign(secret, &body)?));
            headers.push((TOKEN_HEADER.to_string(), secret.clone()));
        }
        headers.extend(
            config
                .headers
                .iter()
                .filter(|(_, h)| h.active)
                .map(|(name, h)| (name.clone(), h.value.clone())),
        );

        Ok(HttpRequest {
            url: config.url.clone(),
            headers,
            body,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn category(&self) -> DestinationCategory {
        DestinationCategory::Http
    }

    async fn deliver(&self, destination: &Destination, event: &AuditEvent) -> Result<Delivery> {
        let DestinationConfig::Http(config) = &destination.config else {
            return Err(StreamError::Config(format!(
                "destination {} is not an http destination",
                destination.id
            )));
        };

        let request = Self::build_request(config, event)?;
        debug!(destination_id = %destination.id, url = %request.url, "posting audit event");

        let response = self.transport.post(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(StreamError::Request {
                status: response.status,
                body: response.body,
            });
        }

        Ok(Delivery {
            status_code: Some(response.status),
            location: config.url.clone(),
        })
    }
}
