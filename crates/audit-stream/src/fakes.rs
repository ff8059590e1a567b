//! In-memory fakes for the streaming seams (testing only)
//!
//! Provides `MemoryHttpTransport`, `MemoryObjectStore`, `MemoryCloudLogging`,
//! `MemoryContentScanner` and `MemoryAuditEventStore`, which satisfy the
//! trait contracts without any network access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::destination::{Destination, GcpLoggingConfig, S3Config};
use crate::error::{Result, StreamError};
use crate::event::AuditEvent;
use crate::scan::{ContentScanClient, ScanBlob};
use crate::sink::{CloudLoggingClient, HttpRequest, HttpResponse, HttpTransport, ObjectStore, S3Credentials};
use crate::streamer::AuditEventStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryHttpTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Reply {
    Status(u16, String),
    Unreachable,
}

/// Records every request; answers `200 {}` unless told otherwise per URL.
#[derive(Debug, Default)]
pub struct MemoryHttpTransport {
    requests: Mutex<Vec<HttpRequest>>,
    replies: Mutex<HashMap<String, Reply>>,
}

impl MemoryHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, url: &str, status: u16, body: &str) {
        lock(&self.replies).insert(url.to_string(), Reply::Status(status, body.to_string()));
    }

    /// Make `url` fail at the transport layer.
    pub fn unreachable(&self, url: &str) {
        lock(&self.replies).insert(url.to_string(), Reply::Unreachable);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        lock(&self.requests)
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpTransport for MemoryHttpTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse> {
        let reply = lock(&self.replies).get(&request.url).cloned();
        let url = request.url.clone();
        lock(&self.requests).push(request);

        match reply {
            None => Ok(HttpResponse {
                status: 200,
                body: "{}".to_string(),
            }),
            Some(Reply::Status(status, body)) => Ok(HttpResponse { status, body }),
            Some(Reply::Unreachable) => Err(StreamError::Transport(format!(
                "connection refused: {}",
                url
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryObjectStore
// ---------------------------------------------------------------------------

/// Object store backed by a `HashMap<(bucket, key), bytes>`.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.objects).keys().map(|(_, k)| k.clone()).collect();
        keys.sort();
        keys
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        config: &S3Config,
        _credentials: &S3Credentials<'_>,
        key: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        lock(&self.objects).insert((config.bucket.clone(), key.to_string()), body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryCloudLogging
// ---------------------------------------------------------------------------

/// Records written envelopes and answers with a fixed body.
#[derive(Debug)]
pub struct MemoryCloudLogging {
    entries: Mutex<Vec<Value>>,
    response: String,
    unreachable: bool,
}

impl Default for MemoryCloudLogging {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            response: "{}".to_string(),
            unreachable: false,
        }
    }
}

impl MemoryCloudLogging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, body: &str) -> Self {
        self.response = body.to_string();
        self
    }

    /// Fail every write at the transport layer; nothing is recorded.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn entries(&self) -> Vec<Value> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl CloudLoggingClient for MemoryCloudLogging {
    async fn write_entries(&self, config: &GcpLoggingConfig, body: Value) -> Result<String> {
        if self.unreachable {
            return Err(StreamError::Transport(format!(
                "connection refused: logging.googleapis.com/projects/{}",
                config.project_id
            )));
        }
        lock(&self.entries).push(body);
        Ok(self.response.clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryContentScanner
// ---------------------------------------------------------------------------

/// Reports a finding for every blob whose content contains `secret`.
#[derive(Debug, Default)]
pub struct MemoryContentScanner {
    batch_sizes: Mutex<Vec<usize>>,
    delays: HashMap<String, Duration>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryContentScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay any batch that contains `path`.
    pub fn with_delay_for(mut self, path: &str, delay: Duration) -> Self {
        self.delays.insert(path.to_string(), delay);
        self
    }

    /// Delay every batch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Highest number of batches that were being scanned at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Sizes of every received batch, sorted.
    pub fn batch_sizes(&self) -> Vec<usize> {
        let mut sizes = lock(&self.batch_sizes).clone();
        sizes.sort_unstable();
        sizes
    }
}

#[async_trait]
impl ContentScanClient for MemoryContentScanner {
    async fn scan(&self, blobs: Vec<ScanBlob>) -> Result<String> {
        lock(&self.batch_sizes).push(blobs.len());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let delay = blobs
            .iter()
            .filter_map(|b| self.delays.get(&b.path))
            .max()
            .copied()
            .or(self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let findings: Vec<Value> = blobs
            .iter()
            .filter(|b| b.content.contains("secret"))
            .map(|b| serde_json::json!({"path": b.path, "rule_id": "gitlab_personal_access_token"}))
            .collect();
        Ok(serde_json::json!({ "findings": findings }).to_string())
    }
}

// ---------------------------------------------------------------------------
// MemoryAuditEventStore
// ---------------------------------------------------------------------------

/// Event and destination store backed by in-memory collections.
#[derive(Debug, Default)]
pub struct MemoryAuditEventStore {
    events: Mutex<HashMap<u64, AuditEvent>>,
    destinations: Mutex<Vec<Destination>>,
}

impl MemoryAuditEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event; it must carry an id.
    pub fn insert(&self, event: AuditEvent) -> Result<()> {
        let id = event
            .id
            .ok_or_else(|| StreamError::Argument("stored events need an id".to_string()))?;
        lock(&self.events).insert(id, event);
        Ok(())
    }

    pub fn add_destination(&self, destination: Destination) {
        lock(&self.destinations).push(destination);
    }
}

#[async_trait]
impl AuditEventStore for MemoryAuditEventStore {
    async fn find_event(&self, id: u64) -> Result<Option<AuditEvent>> {
        Ok(lock(&self.events).get(&id).cloned())
    }

    async fn destinations(&self) -> Result<Vec<Destination>> {
        Ok(lock(&self.destinations).clone())
    }
}
