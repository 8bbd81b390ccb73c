//! Domain models for the storage lifecycle.

pub mod claim;
pub mod export;
pub mod location;
pub mod storage;
pub mod study;

pub use claim::ClaimOutcome;
pub use export::{ExportCompleted, ExportOutcome, ExportScope};
pub use location::{
    Location, LocationStatus, Metadata, MetadataStatus, PurgedSeries, RestoredInstance,
    RestoredPlacement,
};
pub use storage::{
    DeleterThreshold, HourRange, RetentionPeriod, ScheduleExpression, StorageDescriptor,
    StorageDuration,
};
pub use study::{StorageIds, StudyRef, STORAGE_IDS_DELIMITER};
