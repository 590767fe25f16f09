//! Annotated frame storage.
//!
//! [`ObjectStore`] is the backend seam (S3 or in-memory); [`ResultPublisher`]
//! adds per-artifact retries and bounded-concurrency batch uploads.

use crate::config::StorageConfig;
use crate::frame::AnnotatedArtifact;
use crate::metrics::PipelineMetrics;
use crate::retry::{retry_until_cancelled, RetryConfig};
use async_trait::async_trait;
use aws_config::retry::RetryConfig as SdkRetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Object storage unavailable: {0}")]
    Unavailable(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

impl StorageError {
    /// Conflicts are retried too: the last writer wins.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Conflict(_))
    }
}

/// Map an HTTP status from the storage service onto the error taxonomy.
pub fn classify_status(status: u16, message: impl Into<String>) -> StorageError {
    let message = message.into();
    match status {
        409 | 412 => StorageError::Conflict(message),
        408 | 429 | 500..=599 => StorageError::Unavailable(message),
        _ => StorageError::Rejected(message),
    }
}

/// An object storage backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `artifact` under its storage key, replacing any existing object.
    async fn put(&self, bucket: &str, artifact: &AnnotatedArtifact) -> Result<(), StorageError>;

    /// Check that `bucket` is reachable.
    async fn probe(&self, bucket: &str) -> Result<(), StorageError>;
}

/// S3 (or S3-compatible) backend
pub struct S3Store {
    client: S3Client,
}

impl S3Store {
    pub async fn new(config: &StorageConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.request_timeout())
                    .build(),
            )
            .retry_config(SdkRetryConfig::disabled())
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        info!(region = %config.region, "S3 store initialized");

        Self {
            client: S3Client::from_conf(s3_config_builder.build()),
        }
    }
}

fn sdk_error<E>(err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}", DisplayErrorContext(&err));
    match &err {
        SdkError::ServiceError(service) => classify_status(service.raw().status().as_u16(), message),
        SdkError::ConstructionFailure(_) => StorageError::Rejected(message),
        _ => StorageError::Unavailable(message),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, artifact), fields(key = %artifact.storage_key))]
    async fn put(&self, bucket: &str, artifact: &AnnotatedArtifact) -> Result<(), StorageError> {
        debug!(
            bucket = %bucket,
            size_bytes = artifact.image_bytes.len(),
            "Uploading annotated frame"
        );

        self.client
            .put_object()
            .bucket(bucket)
            .key(&artifact.storage_key)
            .body(ByteStream::from(artifact.image_bytes.clone()))
            .content_type("image/jpeg")
            .metadata("stream-id", &artifact.stream_id)
            .metadata("frame-number", artifact.frame_number.to_string())
            .metadata("captured-at", artifact.captured_at.to_rfc3339())
            .metadata("detections", artifact.detections.to_string())
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(())
    }

    async fn probe(&self, bucket: &str) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(sdk_error)
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    frame_number: u64,
}

/// In-process backend for local runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.bytes.clone())
    }

    /// Keys in `bucket`, ordered by frame number.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.lock();
        let mut keys: Vec<(u64, String)> = objects
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .map(|((_, k), o)| (o.frame_number, k.clone()))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, k)| k).collect()
    }

    /// Total successful writes, overwrites included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, bucket: &str, artifact: &AnnotatedArtifact) -> Result<(), StorageError> {
        self.objects.lock().insert(
            (bucket.to_string(), artifact.storage_key.clone()),
            StoredObject {
                bytes: artifact.image_bytes.clone(),
                frame_number: artifact.frame_number,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self, _bucket: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Writes one channel's artifacts to its bucket.
pub struct ResultPublisher {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    retry: RetryConfig,
    concurrency: usize,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
}

impl ResultPublisher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        config: &StorageConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            retry: config.retry.clone(),
            concurrency: config.upload_concurrency.max(1),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop retrying failed uploads once `shutdown` fires. Uploads already
    /// running are never interrupted.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn store_backend(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Store one artifact, retrying transient failures. Returns its key.
    pub async fn store(&self, artifact: &AnnotatedArtifact) -> Result<String, StorageError> {
        retry_until_cancelled(
            &self.retry,
            "storage",
            |e: &StorageError| {
                let retry = e.is_retryable();
                if retry {
                    self.metrics.retry("storage");
                }
                retry
            },
            &self.shutdown,
            || self.store.put(&self.bucket, artifact),
        )
        .await?;

        self.metrics.artifact_stored(&artifact.stream_id);
        debug!(bucket = %self.bucket, key = %artifact.storage_key, "Artifact stored");
        Ok(artifact.storage_key.clone())
    }

    /// Store every artifact with bounded concurrency. All uploads run to
    /// completion; the batch succeeds only if every one of them did.
    pub async fn store_batch(&self, artifacts: &[AnnotatedArtifact]) -> Result<Vec<String>, StorageError> {
        let uploads: Vec<_> = artifacts.iter().map(|artifact| self.store(artifact)).collect();
        let outcomes: Vec<Result<String, StorageError>> = futures::stream::iter(uploads)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let total = outcomes.len();
        let mut keys = Vec::with_capacity(total);
        let mut first_error = None;
        let mut failed = 0usize;

        for outcome in outcomes {
            match outcome {
                Ok(key) => keys.push(key),
                Err(e) => {
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(keys),
            Some(e) => {
                warn!(
                    bucket = %self.bucket,
                    failed,
                    total,
                    error = %e,
                    "Batch upload incomplete"
                );
                Err(e)
            }
        }
    }
}
