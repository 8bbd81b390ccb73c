//! Vesalius Core Library
//!
//! This crate provides the domain models, error types and configuration shared by
//! the archive's storage, persistence and purge components.

pub mod archive_config;
pub mod config;
pub mod error;
pub mod models;
pub mod storage_types;

// Re-export commonly used types
pub use archive_config::{
    ArchiveConfig, ConfigStore, JsonFileConfigStore, MemoryConfigStore, PurgeSettings,
};
pub use config::DaemonConfig;
pub use error::{log_error, AppError, ErrorMetadata, LogLevel};
pub use models::{
    ClaimOutcome, DeleterThreshold, ExportCompleted, ExportOutcome, ExportScope, HourRange,
    Location, LocationStatus, Metadata, MetadataStatus, PurgedSeries, RestoredInstance,
    RestoredPlacement, RetentionPeriod, ScheduleExpression, StorageDescriptor, StorageDuration,
    StorageIds, StudyRef,
};
pub use storage_types::StorageBackend;
// Note: Storage, StorageError, StorageResult live in vesalius-storage
