//! Shared handles of the purge engine.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use vesalius_core::{AppError, ArchiveConfig, ConfigStore, PurgeSettings, StorageDescriptor};
use vesalius_db::{retry_with_delay, PurgeRepository};
use vesalius_storage::StorageFactory;

/// Cached view of the archive configuration document.
///
/// Scans read the cached snapshot and call [`ConfigHandle::reload`] between
/// increments, so an administrator disabling the purge takes effect within one batch.
pub struct ConfigHandle {
    store: Arc<dyn ConfigStore>,
    current: RwLock<ArchiveConfig>,
    /// Serializes read-modify-write cycles against the store.
    write_lock: Mutex<()>,
}

impl ConfigHandle {
    pub async fn load(store: Arc<dyn ConfigStore>) -> Result<Self, AppError> {
        let config = store.load().await?;
        Ok(Self {
            store,
            current: RwLock::new(config),
            write_lock: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> ArchiveConfig {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn settings(&self) -> PurgeSettings {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .purge
            .clone()
    }

    pub fn descriptor(&self, storage_id: &str) -> Option<StorageDescriptor> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .descriptor(storage_id)
            .cloned()
    }

    pub fn bookmark(&self, storage_id: &str) -> Option<DateTime<Utc>> {
        self.descriptor(storage_id)
            .and_then(|d| d.deleter_min_study_access_time)
    }

    /// Re-read the document. On failure the cached snapshot stays in use.
    pub async fn reload(&self) {
        match self.store.load().await {
            Ok(config) => {
                *self.current.write().unwrap_or_else(|e| e.into_inner()) = config;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reload archive configuration, keeping cached copy");
            }
        }
    }

    /// Reload, then report whether the purge feature is still enabled.
    pub async fn still_enabled(&self) -> bool {
        self.reload().await;
        self.settings().is_enabled()
    }

    /// Move the tier's sliding-window bookmark forward to `scanned` and persist it.
    ///
    /// The document is re-read and saved under one lock, so scans of different tiers
    /// persisting at the same time never drop each other's update. A bookmark already
    /// at or past `scanned` is left alone.
    pub async fn persist_bookmark(
        &self,
        storage_id: &str,
        scanned: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let _write = self.write_lock.lock().await;
        let mut config = self.store.load().await?;
        let Some(desc) = config.descriptor_mut(storage_id) else {
            return Err(AppError::Config(format!(
                "Storage[id={}] not configured",
                storage_id
            )));
        };
        if !desc.advance_bookmark(scanned) {
            *self.current.write().unwrap_or_else(|e| e.into_inner()) = config;
            return Ok(());
        }
        self.store.save(&config).await?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = config;
        tracing::debug!(storage_id = storage_id, bookmark = %scanned, "Deleter bookmark advanced");
        Ok(())
    }
}

/// Collaborators shared by every component of the purge engine.
#[derive(Clone)]
pub struct PurgeContext {
    pub repository: Arc<dyn PurgeRepository>,
    pub storage: Arc<dyn StorageFactory>,
    pub config: Arc<ConfigHandle>,
    stopping: Arc<AtomicBool>,
}

impl PurgeContext {
    pub fn new(
        repository: Arc<dyn PurgeRepository>,
        storage: Arc<dyn StorageFactory>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self {
            repository,
            storage,
            config,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask running scans to stop after their current batch.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Checked by scans before every increment: false once shutdown was requested or
    /// the purge feature was disabled.
    pub async fn keep_going(&self) -> bool {
        !self.is_stopping() && self.config.still_enabled().await
    }

    /// Run a repository update with the configured bounded retry.
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let settings = self.config.settings();
        retry_with_delay(
            operation,
            settings.db_retry_attempts,
            settings.db_retry_delay(),
            f,
        )
        .await
    }
}
