//! Vesalius Storage Library
//!
//! Storage tier backends as seen by the purge engine: delete an object, read a
//! series metadata archive, and report usable space.
//!
//! # Storage paths
//!
//! Paths are relative to the tier's base (directory or bucket) and must not contain
//! `..` or a leading `/`. On TAR-packed tiers the purge engine strips the in-archive
//! entry (everything from the first `!`) before calling into a backend.

pub mod factory;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod memory;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use factory::{create_storage, DefaultStorageFactory, StorageFactory};
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use memory::{MemoryStorage, MemoryStorageFactory};
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{Storage, StorageError, StorageResult};
pub use vesalius_core::StorageBackend;
