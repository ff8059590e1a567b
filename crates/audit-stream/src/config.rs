//! Streaming configuration
//!
//! Defaults can be overridden through environment variables:
//! `AUDIT_STREAM_TIMEOUT_SECS`, `AUDIT_STREAM_SILENT_MODE`,
//! `AUDIT_STREAM_MAX_IN_FLIGHT` and `AUDIT_SCAN_BATCH_SIZE`.

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-call timeout for every outbound delivery.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Blobs sent to the content scanner per call.
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 20;

/// Outbound calls (deliveries or scan batches) running at the same time.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 20;

pub const TIMEOUT_ENV: &str = "AUDIT_STREAM_TIMEOUT_SECS";
pub const SILENT_MODE_ENV: &str = "AUDIT_STREAM_SILENT_MODE";
pub const SCAN_BATCH_SIZE_ENV: &str = "AUDIT_SCAN_BATCH_SIZE";
pub const MAX_IN_FLIGHT_ENV: &str = "AUDIT_STREAM_MAX_IN_FLIGHT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub timeout: Duration,
    /// When set, events are accepted but never leave the process.
    pub silent_mode: bool,
    pub scan_batch_size: usize,
    pub max_in_flight: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            silent_mode: false,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl StreamingConfig {
    /// Create a config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(TIMEOUT_ENV) {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|_| StreamError::Config(format!("{} must be a number, got {:?}", TIMEOUT_ENV, raw)))?;
            config.timeout = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup(SILENT_MODE_ENV) {
            config.silent_mode = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(raw) = lookup(SCAN_BATCH_SIZE_ENV) {
            config.scan_batch_size = parse_positive(SCAN_BATCH_SIZE_ENV, &raw)?;
        }

        if let Some(raw) = lookup(MAX_IN_FLIGHT_ENV) {
            config.max_in_flight = parse_positive(MAX_IN_FLIGHT_ENV, &raw)?;
        }

        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_silent_mode(mut self, silent_mode: bool) -> Self {
        self.silent_mode = silent_mode;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<usize> {
    let value: usize = raw
        .trim()
        .parse()
        .map_err(|_| StreamError::Config(format!("{} must be a number, got {:?}", name, raw)))?;
    if value == 0 {
        return Err(StreamError::Config(format!("{} must be positive", name)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = StreamingConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StreamingConfig::default());
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.scan_batch_size, 20);
        assert_eq!(config.max_in_flight, 20);
    }

    #[test]
    fn test_overrides() {
        let config = StreamingConfig::from_lookup(lookup(&[
            (TIMEOUT_ENV, "12"),
            (SILENT_MODE_ENV, "TRUE"),
            (SCAN_BATCH_SIZE_ENV, "50"),
            (MAX_IN_FLIGHT_ENV, "8"),
        ]))
        .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(12));
        assert!(config.silent_mode);
        assert_eq!(config.scan_batch_size, 50);
        assert_eq!(config.max_in_flight, 8);
    }

    #[test]
    fn test_invalid_values() {
        assert!(StreamingConfig::from_lookup(lookup(&[(TIMEOUT_ENV, "soon")])).is_err());
        assert!(StreamingConfig::from_lookup(lookup(&[(SCAN_BATCH_SIZE_ENV, "0")])).is_err());
        assert!(StreamingConfig::from_lookup(lookup(&[(MAX_IN_FLIGHT_ENV, "0")])).is_err());
    }
}
