//! Concurrent batching for content-scanning clients.
//!
//! Blobs are split into fixed-size batches, up to `max_in_flight` batches
//! are sent at once and the findings are flattened in batch order once all
//! batches have finished.

use crate::config::StreamingConfig;
use crate::error::{Result, StreamError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One file handed to the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanBlob {
    pub path: String,
    pub content: String,
}

impl ScanBlob {
    pub fn new(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFinding {
    pub path: String,
    pub rule_id: String,
    #[serde(default)]
    pub line: Option<u32>,
}

/// Scans one batch; returns the raw JSON response body.
#[async_trait]
pub trait ContentScanClient: Send + Sync {
    async fn scan(&self, blobs: Vec<ScanBlob>) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ScanResponse {
    #[serde(default)]
    findings: Vec<ScanFinding>,
}

/// Aggregate of all batches.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub findings: Vec<ScanFinding>,
    pub batches: usize,
    /// One error per failed batch; failed batches contribute no findings.
    pub errors: Vec<StreamError>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.errors.is_empty()
    }
}

pub struct ContentScanBatcher {
    client: Arc<dyn ContentScanClient>,
    batch_size: usize,
    timeout: Duration,
    max_in_flight: usize,
}

impl ContentScanBatcher {
    pub fn new(client: Arc<dyn ContentScanClient>, config: &StreamingConfig) -> Self {
        Self {
            client,
            batch_size: config.scan_batch_size.max(1),
            timeout: config.timeout,
            max_in_flight: config.max_in_flight.max(1),
        }
    }

    pub async fn scan(&self, blobs: &[ScanBlob]) -> ScanReport {
        let outcomes: Vec<Result<Vec<ScanFinding>>> = stream::iter(blobs.chunks(self.batch_size))
            .map(|batch| self.scan_batch(batch.to_vec()))
            .buffered(self.max_in_flight)
            .collect()
            .await;

        let mut report = ScanReport {
            batches: outcomes.len(),
            ..ScanReport::default()
        };
        for (idx, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(findings) => {
                    debug!(batch = idx, findings = findings.len(), "scan batch finished");
                    report.findings.extend(findings);
                }
                Err(e) => {
                    warn!(event = "scan.batch_failed", batch = idx, error = %e);
                    report.errors.push(e);
                }
            }
        }
        report
    }

    // The timeout starts when the batch is first polled, not when `scan` is called.
    async fn scan_batch(&self, batch: Vec<ScanBlob>) -> Result<Vec<ScanFinding>> {
        match tokio::time::timeout(self.timeout, self.client.scan(batch)).await {
            Ok(raw) => raw.and_then(|raw| parse_findings(&raw)),
            Err(_) => Err(StreamError::Timeout(self.timeout)),
        }
    }
}

fn parse_findings(raw: &str) -> Result<Vec<ScanFinding>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let response: ScanResponse =
        serde_json::from_str(raw).map_err(|e| StreamError::Parse(e.to_string()))?;
    Ok(response.findings)
}
