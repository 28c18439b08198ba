//! S3 archive for enriched documents

use crate::config::S3Config;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
#[error("Failed to store '{key}': {message}")]
pub struct StorageError {
    pub key: String,
    pub message: String,
}

/// Object key for a document written at `at`: one folder per day, one file
/// per write, named down to the microsecond.
pub fn object_key(at: &DateTime<Utc>) -> String {
    format!("{}/{}.json", at.format("%Y-%m-%d"), at.format("%Y%m%d_%H%M%S_%6f"))
}

/// Destination for finished documents.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectSink: Send + Sync {
    /// Write `body` as a JSON object under `key`
    async fn put_json(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError>;
}

pub struct S3Sink {
    client: Client,
    bucket: String,
}

impl S3Sink {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Client for an S3-compatible endpoint with static credentials.
    ///
    /// Uses path-style addressing so MinIO and similar stores work without
    /// wildcard DNS.
    pub fn from_config(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None, // session token
            None, // expiry
            "environment",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint_url.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self::new(Client::from_conf(s3_config), config.bucket.clone())
    }
}

#[async_trait]
impl ObjectSink for S3Sink {
    async fn put_json(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let size = body.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StorageError {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!(bucket = %self.bucket, key, size, "Object written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_object_key_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap() + chrono::Duration::microseconds(42);

        assert_eq!(object_key(&at), "2024-03-07/20240307_090502_000042.json");
    }

    #[test]
    fn test_object_keys_sort_by_time() {
        let earlier = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let later = earlier + chrono::Duration::microseconds(1);

        assert!(object_key(&earlier) < object_key(&later));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_key() {
        let sink = S3Sink::from_config(&S3Config {
            access_key: "minio".to_string(),
            secret_key: "minio-secret".to_string(),
            endpoint_url: "http://127.0.0.1:1".to_string(),
            bucket: "details".to_string(),
            region: "us-east-1".to_string(),
        });

        let err = sink.put_json("2024-03-07/x.json", b"{}".to_vec()).await.unwrap_err();
        assert_eq!(err.key, "2024-03-07/x.json");
    }
}
