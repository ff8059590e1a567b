//! Fan-out behaviour of the router across destinations and categories.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use audit_stream::fakes::{MemoryCloudLogging, MemoryHttpTransport, MemoryObjectStore};
use audit_stream::{
    AuditEvent, AuditEventRouter, Author, CloudLoggingSink, Delivery, Destination,
    DestinationCategory, DestinationConfig, EntityRef, GcpLoggingConfig, HttpSink, ObjectStoreSink,
    S3Config, Sink, StreamError, StreamingConfig,
};
use chrono::{TimeZone, Utc};

fn project_destroyed() -> AuditEvent {
    AuditEvent::new(
        "project_destroyed",
        EntityRef::project(7, "acme/api"),
        Author {
            id: 1,
            name: "Ada".to_string(),
        },
        Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap(),
    )
    .with_id(42)
}

fn s3_destination(id: &str) -> Destination {
    Destination::new(
        id,
        DestinationConfig::AwsS3(S3Config {
            bucket: "audit-bucket".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: Some("AKIAEXAMPLE".to_string()),
            secret_access_key: Some("wJalrXUtnFEMI".to_string()),
        }),
    )
}

#[tokio::test]
async fn unreachable_destination_does_not_block_the_others() {
    let transport = Arc::new(MemoryHttpTransport::new());
    transport.unreachable("https://two.example.com");

    let router = AuditEventRouter::new(
        vec![
            Destination::http("one", "https://one.example.com"),
            Destination::http("two", "https://two.example.com"),
            Destination::http("three", "https://three.example.com"),
        ],
        &StreamingConfig::default(),
    )
    .with_sink(Arc::new(HttpSink::new(transport.clone())));

    let results = router.route(&project_destroyed()).await;

    let ids: Vec<&str> = results.iter().map(|r| r.destination_id.as_str()).collect();
    assert_eq!(ids, vec!["one", "two", "three"]);

    let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].destination_id, "two");
    assert!(failed[0].status_code_or_error().contains("connection refused"));

    assert_eq!(transport.requests_to("https://one.example.com").len(), 1);
    assert_eq!(transport.requests_to("https://three.example.com").len(), 1);
}

#[tokio::test]
async fn rejected_request_reports_status_code() {
    let transport = Arc::new(MemoryHttpTransport::new());
    transport.respond_with("https://hook.example.com", 503, "maintenance");

    let router = AuditEventRouter::new(
        vec![Destination::http("hook", "https://hook.example.com")],
        &StreamingConfig::default(),
    )
    .with_sink(Arc::new(HttpSink::new(transport)));

    let results = router.route(&project_destroyed()).await;

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert_eq!(results[0].status_code, Some(503));
    assert_eq!(results[0].status_code_or_error(), "503");
}

#[tokio::test]
async fn object_key_follows_entity_date_and_event_id() {
    let store = Arc::new(MemoryObjectStore::new());
    let router = AuditEventRouter::new(vec![s3_destination("s3")], &StreamingConfig::default())
        .with_sink(Arc::new(ObjectStoreSink::new(store.clone())));

    let results = router.route(&project_destroyed()).await;

    assert!(results[0].success);
    assert_eq!(
        store.keys(),
        vec!["project/2024/03/project_destroyed_42_1709596800000.json".to_string()]
    );

    let body = store
        .get("audit-bucket", "project/2024/03/project_destroyed_42_1709596800000.json")
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["event_type"], "project_destroyed");
}

#[tokio::test]
async fn mixed_categories_are_isolated() {
    let transport = Arc::new(MemoryHttpTransport::new());
    let store = Arc::new(MemoryObjectStore::new());
    let logging = Arc::new(MemoryCloudLogging::new());

    let gcp_without_credentials = Destination::new(
        "gcp",
        DestinationConfig::GcpLogging(GcpLoggingConfig {
            project_id: "acme-audit".to_string(),
            log_id: "audit_events".to_string(),
            client_email: None,
            private_key: None,
        }),
    );

    let router = AuditEventRouter::new(
        vec![
            Destination::http("hook", "https://hook.example.com"),
            s3_destination("s3"),
            gcp_without_credentials,
        ],
        &StreamingConfig::default(),
    )
    .with_sink(Arc::new(HttpSink::new(transport.clone())))
    .with_sink(Arc::new(ObjectStoreSink::new(store.clone())))
    .with_sink(Arc::new(CloudLoggingSink::new(logging.clone())));

    let results = router.route(&project_destroyed()).await;

    let outcome: Vec<(&str, bool)> = results
        .iter()
        .map(|r| (r.destination_id.as_str(), r.success))
        .collect();
    assert_eq!(outcome, vec![("hook", true), ("s3", true), ("gcp", false)]);
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(store.keys().len(), 1);
    assert!(logging.entries().is_empty());
}

struct StalledSink;

#[async_trait]
impl Sink for StalledSink {
    fn category(&self) -> DestinationCategory {
        DestinationCategory::AwsS3
    }

    async fn deliver(&self, _destination: &Destination, _event: &AuditEvent) -> audit_stream::Result<Delivery> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(StreamError::Transport("never answered".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn slow_destination_times_out_without_delaying_others() {
    let transport = Arc::new(MemoryHttpTransport::new());
    let router = AuditEventRouter::new(
        vec![
            s3_destination("slow"),
            Destination::http("fast", "https://hook.example.com"),
        ],
        &StreamingConfig::default().with_timeout(Duration::from_secs(2)),
    )
    .with_sink(Arc::new(StalledSink))
    .with_sink(Arc::new(HttpSink::new(transport.clone())));

    let results = router.route(&project_destroyed()).await;

    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap_or_default().contains("timed out"));
    assert!(results[1].success);
    assert_eq!(transport.requests().len(), 1);
}

/// Sleeps on every delivery and records how many were running at once.
#[derive(Default)]
struct CountingSink {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Sink for CountingSink {
    fn category(&self) -> DestinationCategory {
        DestinationCategory::Http
    }

    async fn deliver(&self, destination: &Destination, _event: &AuditEvent) -> audit_stream::Result<Delivery> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Delivery {
            status_code: Some(200),
            location: destination.id.clone(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_deliveries_are_bounded_by_max_in_flight() {
    let sink = Arc::new(CountingSink::default());
    let destinations: Vec<Destination> = (0..200)
        .map(|i| Destination::http(&format!("hook-{i}"), &format!("https://hook-{i}.example.com")))
        .collect();
    let config = StreamingConfig::default().with_max_in_flight(5);
    let router = AuditEventRouter::new(destinations, &config).with_sink(sink.clone());

    let results = router.route(&project_destroyed()).await;

    assert_eq!(results.len(), 200);
    assert!(results.iter().all(|r| r.success));
    let peak = sink.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak in-flight deliveries was {peak}");
    assert_eq!(peak, 5);
    assert_eq!(results[0].destination_id, "hook-0");
    assert_eq!(results[199].destination_id, "hook-199");
}

#[tokio::test(start_paused = true)]
async fn default_config_bounds_deliveries_at_twenty() {
    let sink = Arc::new(CountingSink::default());
    let destinations: Vec<Destination> = (0..200)
        .map(|i| Destination::http(&format!("hook-{i}"), &format!("https://hook-{i}.example.com")))
        .collect();
    let router = AuditEventRouter::new(destinations, &StreamingConfig::default()).with_sink(sink.clone());

    router.route(&project_destroyed()).await;

    assert_eq!(sink.peak.load(Ordering::SeqCst), 20);
}
