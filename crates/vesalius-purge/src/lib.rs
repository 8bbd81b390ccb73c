//! Vesalius purge engine
//!
//! Decides when objects leave a storage tier and deletes them safely while several
//! scans and export notifications race for the same records.
//!
//! * [`PurgeScheduler`] runs one scan per writable tier per polling cycle.
//! * [`RetentionEvaluator`] selects studies past their retention or needed to bring a
//!   tier back under its space thresholds, deferring studies not yet exported.
//! * [`evict_objects_of_study`] takes a study off a cache tier.
//! * [`DeletionPool`] claims and deletes queued objects with bounded concurrency.
//! * [`ExportCompletionTrigger`] clears an exporter's origin tier right after a
//!   successful study export.

pub mod claims;
pub mod context;
pub mod deleter;
pub mod evaluator;
pub mod export;
pub mod metadata;
pub mod report;
pub mod scheduler;

pub use claims::{evict_objects_of_study, read_series_metadata, restore_purged_instances};
pub use context::{ConfigHandle, PurgeContext};
pub use deleter::{physical_path, DeletionPool, PurgeTarget};
pub use evaluator::{advance, RetentionEvaluator};
pub use export::{ExportCompletionTrigger, ExportDisposition};
pub use metadata::{
    count_unexported, read_placement_records, restored_instances, PlacementRecord, StoragePlacement,
};
pub use report::{BatchReport, PurgeReport};
pub use scheduler::{purge_metadata, purge_objects, PurgeScheduler, TierGuard};
