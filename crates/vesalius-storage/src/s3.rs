use crate::traits::{Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{ObjectStoreExt, Result as ObjectResult};

/// S3 tier. The storage URI of the descriptor is the bucket name.
#[derive(Clone)]
pub struct S3Storage {
    storage_id: String,
    store: AmazonS3,
    bucket: String,
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// # Arguments
    /// * `storage_id` - ID of the storage descriptor
    /// * `bucket` - S3 bucket name
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - Optional custom endpoint URL for S3-compatible providers
    ///   (e.g., "http://localhost:9000" for MinIO)
    pub async fn new(
        storage_id: impl Into<String>,
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
    ) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region)
            .with_bucket_name(bucket.clone());

        if let Some(ref endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(S3Storage {
            storage_id: storage_id.into(),
            store,
            bucket,
        })
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn storage_id(&self) -> &str {
        &self.storage_id
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }

    /// S3 deletes are idempotent, so a missing key is reported as success.
    async fn delete(&self, storage_path: &str) -> StorageResult<()> {
        let start = std::time::Instant::now();
        let location = Path::from(storage_path.to_string());

        let result: ObjectResult<_> = self.store.delete(&location).await;

        result.map_err(|e| match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(storage_path.to_string()),
            other => {
                tracing::error!(
                    error = %other,
                    bucket = %self.bucket,
                    key = %storage_path,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete failed"
                );
                StorageError::DeleteFailed(other.to_string())
            }
        })?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %storage_path,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );

        Ok(())
    }

    async fn read(&self, storage_path: &str) -> StorageResult<Vec<u8>> {
        let location = Path::from(storage_path.to_string());

        let result: ObjectResult<_> = self.store.get(&location).await;
        let result = result.map_err(|e| match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(storage_path.to_string()),
            other => StorageError::ReadFailed(other.to_string()),
        })?;

        let bytes = result
            .bytes()
            .await
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;

        Ok(bytes.to_vec())
    }

    /// Buckets have no capacity limit; min-usable-space thresholds never trigger.
    async fn usable_space(&self) -> StorageResult<u64> {
        Ok(u64::MAX)
    }
}
