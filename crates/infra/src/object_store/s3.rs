//! S3 (or S3-compatible, e.g. MinIO) object store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use docdiff_core::ObjectKey;
use tracing::{debug, error};

use super::{ObjectStore, ObjectStoreError};

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS configuration (env, profile, IMDS).
    ///
    /// A custom `endpoint_url` switches to path-style addressing, which is what
    /// MinIO and most S3-compatible servers expect.
    pub async fn new(bucket: impl Into<String>, endpoint_url: Option<String>) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &ObjectKey, bytes: Bytes) -> Result<ObjectKey, ObjectStoreError> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type("application/pdf")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                error!(bucket = %self.bucket, key = %key, error = ?e, "S3 PUT failed");
                ObjectStoreError::Backend(format!("S3 PUT {key} failed: {e}"))
            })?;

        debug!(bucket = %self.bucket, key = %key, size, "object stored");
        Ok(key.clone())
    }

    async fn get(&self, key: &ObjectKey, dest: &Path) -> Result<PathBuf, ObjectStoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(ObjectStoreError::NotFound(key.clone()));
            }
            Err(e) => {
                error!(bucket = %self.bucket, key = %key, error = ?e, "S3 GET failed");
                return Err(ObjectStoreError::Backend(format!("S3 GET {key} failed: {e}")));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("S3 body for {key} failed: {e}")))?;
        tokio::fs::write(dest, body.into_bytes()).await?;

        Ok(dest.to_path_buf())
    }
}
