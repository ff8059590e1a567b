//! Audit event streaming
//!
//! Routes immutable audit events to external destinations (HTTP endpoints,
//! S3-compatible object storage, cloud logging) with per-destination
//! filters, signing and failure isolation.
//!
//! Network access goes through the client traits in [`sink`] and [`scan`];
//! [`fakes`] provides in-memory implementations for tests.

pub mod config;
pub mod destination;
pub mod error;
pub mod event;
pub mod fakes;
pub mod format;
pub mod metrics;
pub mod router;
pub mod scan;
pub mod sink;
pub mod streamer;

pub use config::StreamingConfig;
pub use destination::{
    Destination, DestinationCategory, DestinationConfig, GcpLoggingConfig, HeaderValue, HttpConfig,
    S3Config,
};
pub use error::{Result, StreamError};
pub use event::{AuditEvent, Author, ColumnChange, EntityRef, Target};
pub use metrics::METRICS;
pub use router::{AuditEventRouter, DeliveryResult};
pub use scan::{ContentScanBatcher, ContentScanClient, ScanBlob, ScanFinding, ScanReport};
pub use sink::{
    CloudLoggingClient, CloudLoggingSink, Delivery, HttpSink, HttpTransport, ObjectStore,
    ObjectStoreSink, ReqwestTransport, Sink, TimeoutSink,
};
pub use streamer::{AuditEventStore, AuditEventStreamer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
