//! In-memory tier with simulated capacity, used by tests and dry runs.

use crate::factory::StorageFactory;
use crate::traits::{Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use vesalius_core::StorageDescriptor;

#[derive(Default)]
struct State {
    objects: HashMap<String, Vec<u8>>,
    usable_space: u64,
    failing: HashSet<String>,
    deleted: Vec<String>,
}

/// Tier that keeps objects in memory. Deleting an object adds its size to the
/// reported usable space.
pub struct MemoryStorage {
    storage_id: String,
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new(storage_id: impl Into<String>) -> Self {
        Self {
            storage_id: storage_id.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, storage_path: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.state().objects.insert(storage_path.into(), data.into());
    }

    pub fn set_usable_space(&self, bytes: u64) {
        self.state().usable_space = bytes;
    }

    /// Make every delete of `storage_path` fail with a backend error.
    pub fn fail_deletes_of(&self, storage_path: impl Into<String>) {
        self.state().failing.insert(storage_path.into());
    }

    pub fn contains(&self, storage_path: &str) -> bool {
        self.state().objects.contains_key(storage_path)
    }

    /// Paths successfully deleted, in call order.
    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn storage_id(&self) -> &str {
        &self.storage_id
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }

    async fn delete(&self, storage_path: &str) -> StorageResult<()> {
        let mut state = self.state();
        if state.failing.contains(storage_path) {
            return Err(StorageError::DeleteFailed(format!(
                "Simulated failure deleting {}",
                storage_path
            )));
        }
        let data = state
            .objects
            .remove(storage_path)
            .ok_or_else(|| StorageError::NotFound(storage_path.to_string()))?;
        state.usable_space = state.usable_space.saturating_add(data.len() as u64);
        state.deleted.push(storage_path.to_string());
        Ok(())
    }

    async fn read(&self, storage_path: &str) -> StorageResult<Vec<u8>> {
        self.state()
            .objects
            .get(storage_path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(storage_path.to_string()))
    }

    async fn usable_space(&self) -> StorageResult<u64> {
        Ok(self.state().usable_space)
    }
}

/// Hands out registered `MemoryStorage` tiers by storage ID.
#[derive(Default)]
pub struct MemoryStorageFactory {
    tiers: Mutex<HashMap<String, Arc<MemoryStorage>>>,
}

impl MemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tier and return it for later inspection.
    pub fn tier(&self, storage_id: &str) -> Arc<MemoryStorage> {
        self.tiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(storage_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStorage::new(storage_id)))
            .clone()
    }
}

#[async_trait]
impl StorageFactory for MemoryStorageFactory {
    async fn open(&self, desc: &StorageDescriptor) -> StorageResult<Arc<dyn Storage>> {
        Ok(self.tier(&desc.storage_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_frees_space_once() {
        let storage = MemoryStorage::new("cache");
        storage.put("a", vec![0u8; 20]);
        storage.set_usable_space(40);

        storage.delete("a").await.unwrap();
        assert_eq!(storage.usable_space().await.unwrap(), 60);
        assert!(storage.delete("a").await.unwrap_err().is_not_found());
        assert_eq!(storage.usable_space().await.unwrap(), 60);
    }

    #[tokio::test]
    async fn test_injected_failure_keeps_object() {
        let storage = MemoryStorage::new("cache");
        storage.put("a", b"x".to_vec());
        storage.fail_deletes_of("a");

        assert!(matches!(
            storage.delete("a").await,
            Err(StorageError::DeleteFailed(_))
        ));
        assert!(storage.contains("a"));
        assert!(storage.deleted().is_empty());
    }
}
