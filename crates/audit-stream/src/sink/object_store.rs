//! Object storage destinations (S3 compatible).

use super::{Delivery, Sink};
use crate::destination::{Destination, DestinationCategory, DestinationConfig, S3Config};
use crate::error::{Result, StreamError};
use crate::event::AuditEvent;
use crate::format;
use async_trait::async_trait;
use std::sync::Arc;

/// Credentials checked by the sink before any upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Credentials<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
}

impl<'a> S3Credentials<'a> {
    fn from_config(destination_id: &str, config: &'a S3Config) -> Result<Self> {
        match (
            config.access_key_id.as_deref().filter(|k| !k.is_empty()),
            config.secret_access_key.as_deref().filter(|k| !k.is_empty()),
        ) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(Self {
                access_key_id,
                secret_access_key,
            }),
            _ => Err(StreamError::Config(format!(
                "destination {} is missing S3 credentials",
                destination_id
            ))),
        }
    }
}

/// Uploads objects. The SDK behind it is an external collaborator.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        config: &S3Config,
        credentials: &S3Credentials<'_>,
        key: &str,
        body: Vec<u8>,
    ) -> Result<()>;
}

/// Delivers events to `aws_s3` destinations, one object per event.
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Sink for ObjectStoreSink {
    fn category(&self) -> DestinationCategory {
        DestinationCategory::AwsS3
    }

    async fn deliver(&self, destination: &Destination, event: &AuditEvent) -> Result<Delivery> {
        let DestinationConfig::AwsS3(config) = &destination.config else {
            return Err(StreamError::Config(format!(
                "destination {} is not an aws_s3 destination",
                destination.id
            )));
        };

        let credentials = S3Credentials::from_config(&destination.id, config)?;
        let key = format::object_key(event)?;
        let body = format::payload_bytes(event)?;

        self.store
            .put_object(config, &credentials, &key, body)
            .await?;

        Ok(Delivery {
            status_code: None,
            location: format!("s3://{}/{}", config.bucket, key),
        })
    }
}
