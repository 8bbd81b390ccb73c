//! Storage abstraction trait
//!
//! This module defines the Storage trait that all tier backends must implement.

use crate::StorageBackend;
use async_trait::async_trait;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage path: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// One storage tier.
///
/// Implementations must be safe to call from several deleter workers at once.
#[async_trait]
pub trait Storage: Send + Sync {
    /// ID of the storage descriptor this backend was opened for
    fn storage_id(&self) -> &str;

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;

    /// Delete one object. Backends that can tell report a missing object as
    /// `StorageError::NotFound`; callers treat that as already deleted.
    async fn delete(&self, storage_path: &str) -> StorageResult<()>;

    /// Read a whole object, used for series metadata archives
    async fn read(&self, storage_path: &str) -> StorageResult<Vec<u8>>;

    /// Bytes still available for new objects on this tier
    async fn usable_space(&self) -> StorageResult<u64>;
}
