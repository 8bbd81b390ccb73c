#[cfg(feature = "storage-local")]
use crate::LocalStorage;
#[cfg(feature = "storage-s3")]
use crate::S3Storage;
use crate::{Storage, StorageBackend, StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use vesalius_core::StorageDescriptor;

/// Opens the backend of a storage tier.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn open(&self, desc: &StorageDescriptor) -> StorageResult<Arc<dyn Storage>>;
}

/// Create a storage backend for a storage descriptor
pub async fn create_storage(desc: &StorageDescriptor) -> StorageResult<Arc<dyn Storage>> {
    match desc.backend {
        #[cfg(feature = "storage-s3")]
        StorageBackend::S3 => {
            let region = desc
                .property("region")
                .map(String::from)
                .or_else(|| std::env::var("AWS_REGION").ok())
                .ok_or_else(|| {
                    StorageError::ConfigError(format!(
                        "{}: region property or AWS_REGION not configured",
                        desc
                    ))
                })?;
            let endpoint = desc.property("endpoint").map(String::from);

            let storage = S3Storage::new(
                desc.storage_id.clone(),
                desc.storage_uri.clone(),
                region,
                endpoint,
            )
            .await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-s3"))]
        StorageBackend::S3 => Err(StorageError::ConfigError(
            "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
        )),

        #[cfg(feature = "storage-local")]
        StorageBackend::Local | StorageBackend::Nfs => {
            let storage = LocalStorage::new(desc.storage_id.clone(), &desc.storage_uri)
                .await?
                .with_backend(desc.backend);
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-local"))]
        StorageBackend::Local | StorageBackend::Nfs => Err(StorageError::ConfigError(
            "Local storage backend not available (storage-local feature not enabled)".to_string(),
        )),
    }
}

/// A backend together with the descriptor settings it was opened with.
struct OpenedStorage {
    backend: StorageBackend,
    storage_uri: String,
    properties: HashMap<String, String>,
    storage: Arc<dyn Storage>,
}

impl OpenedStorage {
    fn matches(&self, desc: &StorageDescriptor) -> bool {
        self.backend == desc.backend
            && self.storage_uri == desc.storage_uri
            && self.properties == desc.properties
    }
}

/// Factory used by the daemon. Backends are opened once per storage ID and reused
/// across purge cycles until the descriptor's backend, URI or properties change.
#[derive(Default)]
pub struct DefaultStorageFactory {
    opened: Mutex<HashMap<String, OpenedStorage>>,
}

impl DefaultStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageFactory for DefaultStorageFactory {
    async fn open(&self, desc: &StorageDescriptor) -> StorageResult<Arc<dyn Storage>> {
        let mut opened = self.opened.lock().await;
        if let Some(entry) = opened.get(&desc.storage_id) {
            if entry.matches(desc) {
                return Ok(entry.storage.clone());
            }
        }
        let storage = create_storage(desc).await?;
        tracing::info!(
            storage_id = %desc.storage_id,
            backend = %desc.backend,
            storage_uri = %desc.storage_uri,
            "Opened storage backend"
        );
        opened.insert(
            desc.storage_id.clone(),
            OpenedStorage {
                backend: desc.backend,
                storage_uri: desc.storage_uri.clone(),
                properties: desc.properties.clone(),
                storage: storage.clone(),
            },
        );
        Ok(storage)
    }
}
