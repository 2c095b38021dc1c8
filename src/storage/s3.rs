//! AWS S3 storage: exported graphs and the shared store snapshot.
//!
//! Graph files land at `{bucket}/{prefix}/{graph_key}` with the
//! Content-Disposition set so a browser download is named after the root
//! account. The store snapshot is a single JSON object in the same bucket,
//! replaced with conditional puts on its ETag.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use log::{debug, info};

use crate::error::{AppError, Result};
use crate::storage::{BlobStore, SnapshotBackend};

const GML_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const SNAPSHOT_CONTENT_TYPE: &str = "application/json";

/// S3-backed blob store.
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Create S3 storage from environment configuration.
    pub async fn from_env() -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = Client::new(&config);

        let bucket = std::env::var("S3_BUCKET").map_err(|_| AppError::config("S3_BUCKET is not set"))?;
        let prefix = std::env::var("S3_PREFIX").unwrap_or_default();

        Ok(Self::new(client, bucket, prefix))
    }

    /// Store snapshot at `key`, under the same bucket and prefix.
    pub fn snapshot(&self, key: &str) -> S3Snapshot {
        S3Snapshot {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.object_key(key),
        }
    }

    fn object_key(&self, key: &str) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", prefix, key)
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn write(&self, key: &str, bytes: &[u8], content_disposition: &str) -> Result<()> {
        let object_key = self.object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(GML_CONTENT_TYPE)
            .content_disposition(content_disposition)
            .send()
            .await
            .map_err(|e| AppError::S3(e.to_string()))?;

        info!("Wrote {} bytes to s3://{}/{}", bytes.len(), self.bucket, object_key);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let object_key = self.object_key(key);
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| AppError::S3(e.to_string()))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    info!("No object at s3://{}/{}", self.bucket, object_key);
                    Ok(None)
                } else {
                    Err(AppError::S3(service_err.to_string()))
                }
            }
        }
    }
}

/// Store snapshot kept as one S3 object.
pub struct S3Snapshot {
    client: Client,
    bucket: String,
    key: String,
}

#[async_trait]
impl SnapshotBackend for S3Snapshot {
    async fn load(&self) -> Result<Option<(Vec<u8>, String)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output
                    .e_tag()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::S3(format!("{} has no ETag", self.location())))?;
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| AppError::S3(e.to_string()))?;
                Ok(Some((bytes.into_bytes().to_vec(), etag)))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(AppError::S3(service_err.to_string()))
                }
            }
        }
    }

    async fn swap(&self, bytes: &[u8], expected: Option<&str>) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(SNAPSHOT_CONTENT_TYPE);
        let request = match expected {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                // 412: precondition failed, 409: a concurrent conditional put won
                let status = err.raw_response().map(|r| r.status().as_u16());
                if matches!(status, Some(409 | 412)) {
                    debug!("Lost snapshot race on {}", self.location());
                    Ok(false)
                } else {
                    Err(AppError::S3(err.into_service_error().to_string()))
                }
            }
        }
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}
