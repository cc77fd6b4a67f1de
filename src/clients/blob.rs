use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use crate::models::{Result, WorkerError};

/// Remote object storage for source images and annotated artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Retrieves an object's bytes. Missing keys are
    /// [`WorkerError::BlobNotFound`], every other fault
    /// [`WorkerError::BlobRemote`]. No retries; retry policy lives outside
    /// this client.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;

    /// Stores a local artifact under `key`, overwriting any existing object.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()>;
}

pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    /// Builds an S3 client from the shared SDK config, honoring a custom
    /// endpoint (e.g. MinIO) if provided.
    pub fn new(sdk_config: &aws_config::SdkConfig, bucket: String, endpoint: Option<&str>) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: S3Client::from_conf(builder.build()),
            bucket,
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err) => {
                    let inner = service_err.err();
                    let code = inner.meta().code().unwrap_or("");
                    if inner.is_no_such_key() || code == "NoSuchKey" || code == "NotFound" {
                        WorkerError::BlobNotFound(key.to_string())
                    } else {
                        WorkerError::BlobRemote(format!("{key}: {e}"))
                    }
                }
                _ => WorkerError::BlobRemote(format!("{key}: {e}")),
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| WorkerError::BlobRemote(format!("reading body of {key}: {e}")))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| WorkerError::BlobRemote(format!("reading {}: {e}", local_path.display())))?;
        let size = bytes.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type("image/jpeg")
            .send()
            .await
            .map_err(|e| WorkerError::BlobRemote(format!("uploading {key}: {e}")))?;

        tracing::debug!(bucket = %self.bucket, key = %key, size_bytes = size, "uploaded artifact");
        Ok(())
    }
}
