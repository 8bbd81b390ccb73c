//! Archive configuration document
//!
//! Purge settings and storage descriptors, stored as one JSON document. The purge
//! scheduler re-reads the document between scan increments and writes it back when a
//! tier's sliding-window bookmark advances.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::AppError;
use crate::models::StorageDescriptor;

const PURGE_FETCH_SIZE: usize = 100;
const DELETE_STUDY_BATCH_SIZE: usize = 10;
const DELETE_STUDY_CHUNK_SIZE: usize = 100;
const DB_RETRY_ATTEMPTS: u32 = 3;
const DB_RETRY_DELAY_MS: u64 = 100;

fn default_fetch_size() -> usize {
    PURGE_FETCH_SIZE
}

fn default_batch_size() -> usize {
    DELETE_STUDY_BATCH_SIZE
}

fn default_chunk_size() -> usize {
    DELETE_STUDY_CHUNK_SIZE
}

fn default_retry_attempts() -> u32 {
    DB_RETRY_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    DB_RETRY_DELAY_MS
}

/// Device-wide purge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeSettings {
    /// Absent means the purge feature is disabled; running scans exit early.
    #[serde(default)]
    pub purge_polling_interval_secs: Option<u64>,
    /// Maximum number of metadata/location records fetched per purge batch.
    #[serde(default = "default_fetch_size")]
    pub purge_fetch_size: usize,
    /// Maximum number of studies selected for eviction per query.
    #[serde(default = "default_batch_size")]
    pub delete_study_batch_size: usize,
    /// Number of instances whose records are deleted per transaction.
    #[serde(default = "default_chunk_size")]
    pub delete_study_chunk_size: usize,
    /// Step by which the sliding-window bookmark advances.
    #[serde(default)]
    pub delete_study_interval_secs: Option<u64>,
    /// Studies accessed more recently than this are never eligible.
    #[serde(default)]
    pub preserve_study_interval_secs: Option<u64>,
    #[serde(default = "default_retry_attempts")]
    pub db_retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub db_retry_delay_ms: u64,
}

impl Default for PurgeSettings {
    fn default() -> Self {
        Self {
            purge_polling_interval_secs: None,
            purge_fetch_size: PURGE_FETCH_SIZE,
            delete_study_batch_size: DELETE_STUDY_BATCH_SIZE,
            delete_study_chunk_size: DELETE_STUDY_CHUNK_SIZE,
            delete_study_interval_secs: None,
            preserve_study_interval_secs: None,
            db_retry_attempts: DB_RETRY_ATTEMPTS,
            db_retry_delay_ms: DB_RETRY_DELAY_MS,
        }
    }
}

impl PurgeSettings {
    pub fn polling_interval(&self) -> Option<Duration> {
        self.purge_polling_interval_secs.map(Duration::from_secs)
    }

    pub fn is_enabled(&self) -> bool {
        self.purge_polling_interval_secs.is_some()
    }

    pub fn delete_study_interval(&self) -> Option<chrono::Duration> {
        self.delete_study_interval_secs.map(secs_to_chrono)
    }

    pub fn preserve_study_interval(&self) -> Option<chrono::Duration> {
        self.preserve_study_interval_secs.map(secs_to_chrono)
    }

    pub fn db_retry_delay(&self) -> Duration {
        Duration::from_millis(self.db_retry_delay_ms)
    }
}

fn secs_to_chrono(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub purge: PurgeSettings,
    #[serde(default)]
    pub storage_descriptors: Vec<StorageDescriptor>,
}

impl ArchiveConfig {
    pub fn descriptor(&self, storage_id: &str) -> Option<&StorageDescriptor> {
        self.storage_descriptors
            .iter()
            .find(|d| d.storage_id == storage_id)
    }

    pub fn descriptor_mut(&mut self, storage_id: &str) -> Option<&mut StorageDescriptor> {
        self.storage_descriptors
            .iter_mut()
            .find(|d| d.storage_id == storage_id)
    }

    /// The tier itself followed by the other members of its storage cluster.
    pub fn storage_ids_for_deletion(&self, desc: &StorageDescriptor) -> Vec<String> {
        let mut ids = vec![desc.storage_id.clone()];
        if let Some(cluster) = desc.storage_cluster_id.as_deref() {
            ids.extend(
                self.storage_descriptors
                    .iter()
                    .filter(|d| {
                        d.storage_id != desc.storage_id
                            && d.storage_cluster_id.as_deref() == Some(cluster)
                    })
                    .map(|d| d.storage_id.clone()),
            );
        }
        ids
    }
}

/// Persistent home of the archive configuration document.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<ArchiveConfig, AppError>;

    async fn save(&self, config: &ArchiveConfig) -> Result<(), AppError>;
}

/// JSON file store. Writes go to a temporary file in the same directory which is then
/// renamed over the original, so readers never observe a partial document.
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn load(&self) -> Result<ArchiveConfig, AppError> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            AppError::Config(format!(
                "Failed to read archive configuration {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn save(&self, config: &ArchiveConfig) -> Result<(), AppError> {
        let data = serde_json::to_vec_pretty(config)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), AppError> {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| {
                AppError::Config(format!(
                    "Failed to persist archive configuration {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Config writer task failed: {}", e)))??;

        tracing::debug!(path = %self.path.display(), "Archive configuration saved");
        Ok(())
    }
}

/// In-process store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryConfigStore {
    config: Mutex<ArchiveConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    /// Apply an out-of-band change, as an administrator editing the configuration would.
    pub fn update(&self, f: impl FnOnce(&mut ArchiveConfig)) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut config);
    }

    pub fn current(&self) -> ArchiveConfig {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<ArchiveConfig, AppError> {
        Ok(self.current())
    }

    async fn save(&self, config: &ArchiveConfig) -> Result<(), AppError> {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cluster_config() -> ArchiveConfig {
        let mut a = StorageDescriptor::new("cache-a", "/cache/a");
        a.storage_cluster_id = Some("cache".to_string());
        let mut b = StorageDescriptor::new("cache-b", "/cache/b");
        b.storage_cluster_id = Some("cache".to_string());
        let c = StorageDescriptor::new("fs1", "/fs1");
        ArchiveConfig {
            purge: PurgeSettings::default(),
            storage_descriptors: vec![a, b, c],
        }
    }

    #[test]
    fn test_storage_ids_for_deletion_include_cluster_members() {
        let config = cluster_config();
        let a = config.descriptor("cache-a").unwrap();
        assert_eq!(
            config.storage_ids_for_deletion(a),
            vec!["cache-a".to_string(), "cache-b".to_string()]
        );
        let fs1 = config.descriptor("fs1").unwrap();
        assert_eq!(config.storage_ids_for_deletion(fs1), vec!["fs1".to_string()]);
    }

    #[test]
    fn test_huge_intervals_saturate() {
        let mut settings = PurgeSettings::default();
        settings.preserve_study_interval_secs = Some(u64::MAX);
        settings.delete_study_interval_secs = Some(i64::MAX as u64);
        assert_eq!(settings.preserve_study_interval(), Some(chrono::Duration::MAX));
        assert_eq!(settings.delete_study_interval(), Some(chrono::Duration::MAX));
    }

    #[test]
    fn test_settings_defaults_when_fields_missing() {
        let config: ArchiveConfig = serde_json::from_str(r#"{"purge":{}}"#).unwrap();
        assert!(!config.purge.is_enabled());
        assert_eq!(config.purge.purge_fetch_size, 100);
        assert_eq!(config.purge.delete_study_chunk_size, 100);
        assert!(config.storage_descriptors.is_empty());
    }

    #[tokio::test]
    async fn test_json_store_persists_bookmark() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.json");
        let store = JsonFileConfigStore::new(&path);

        let mut config = cluster_config();
        config.purge.purge_polling_interval_secs = Some(60);
        let bookmark = chrono::Utc::now();
        config
            .descriptor_mut("cache-a")
            .unwrap()
            .advance_bookmark(bookmark);
        store.save(&config).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded
                .descriptor("cache-a")
                .unwrap()
                .deleter_min_study_access_time,
            Some(bookmark)
        );
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_config_error() {
        let dir = tempdir().unwrap();
        let store = JsonFileConfigStore::new(dir.path().join("absent.json"));
        assert!(matches!(store.load().await, Err(AppError::Config(_))));
    }
}
