use crate::traits::{Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tokio::fs;

/// Local filesystem tier. Also used for NFS tiers, which are mounted filesystems.
#[derive(Clone)]
pub struct LocalStorage {
    storage_id: String,
    base_path: PathBuf,
    backend: StorageBackend,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `storage_id` - ID of the storage descriptor
    /// * `base_path` - Root directory of the tier (e.g., "/var/lib/vesalius/fs1")
    pub async fn new(
        storage_id: impl Into<String>,
        base_path: impl Into<PathBuf>,
    ) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalStorage {
            storage_id: storage_id.into(),
            base_path,
            backend: StorageBackend::Local,
        })
    }

    pub fn with_backend(mut self, backend: StorageBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Convert a storage path to a filesystem path with security validation
    ///
    /// Rejects paths containing traversal sequences that could escape the base
    /// directory of the tier.
    fn key_to_path(&self, storage_path: &str) -> StorageResult<PathBuf> {
        if storage_path.is_empty() || storage_path.contains("..") || storage_path.starts_with('/')
        {
            return Err(StorageError::InvalidKey(format!(
                "Storage path contains invalid characters: {}",
                storage_path
            )));
        }

        let path = self.base_path.join(storage_path);

        let base_canonical = self.base_path.canonicalize().map_err(|e| {
            StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
        })?;

        if let Ok(canonical) = path.canonicalize() {
            if canonical.strip_prefix(&base_canonical).is_err() {
                return Err(StorageError::InvalidKey(
                    "Storage path resolves outside storage directory".to_string(),
                ));
            }
        }

        Ok(path)
    }

    /// Remove directories left empty by a delete, stopping at the base directory.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.base_path || !dir.starts_with(&self.base_path) {
                break;
            }
            // Fails on non-empty directories, which ends the walk.
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

/// Free space on the filesystem holding `path`: the disk with the longest mount point
/// that is a prefix of the path.
fn available_space_at(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[async_trait]
impl Storage for LocalStorage {
    fn storage_id(&self) -> &str {
        &self.storage_id
    }

    fn backend_type(&self) -> StorageBackend {
        self.backend
    }

    async fn delete(&self, storage_path: &str) -> StorageResult<()> {
        let path = self.key_to_path(storage_path)?;
        let start = std::time::Instant::now();

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(storage_path.to_string()));
            }
            Err(e) => {
                return Err(StorageError::DeleteFailed(format!(
                    "Failed to delete file {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        self.prune_empty_parents(&path).await;

        tracing::debug!(
            storage_id = %self.storage_id,
            path = %path.display(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage delete successful"
        );

        Ok(())
    }

    async fn read(&self, storage_path: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(storage_path)?;

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(storage_path.to_string()))
            }
            Err(e) => Err(StorageError::ReadFailed(format!(
                "Failed to read file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn usable_space(&self) -> StorageResult<u64> {
        let base = self.base_path.canonicalize()?;
        let lookup = base.clone();
        let available = tokio::task::spawn_blocking(move || available_space_at(&lookup))
            .await
            .map_err(|e| StorageError::BackendError(format!("Disk query task failed: {}", e)))?;

        available.ok_or_else(|| {
            StorageError::BackendError(format!(
                "Could not determine disk space for path: {}",
                base.display()
            ))
        })
    }
}
