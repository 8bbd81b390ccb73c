//! Test helpers: an in-memory archive, in-memory tiers and a purge scheduler wired
//! together.
//!
//! Run with: `cargo test -p vesalius-purge`

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use std::io::{Cursor, Write};
use std::sync::Arc;
use vesalius_core::{
    ArchiveConfig, DeleterThreshold, LocationStatus, MemoryConfigStore, StorageDescriptor,
    StorageDuration, StudyRef,
};
use vesalius_db::InMemoryArchive;
use vesalius_purge::{ConfigHandle, PurgeContext, PurgeScheduler};
use vesalius_storage::{MemoryStorage, MemoryStorageFactory};
use zip::write::{FileOptions, ZipWriter};

pub struct TestArchive {
    pub archive: Arc<InMemoryArchive>,
    pub tiers: Arc<MemoryStorageFactory>,
    pub config: Arc<MemoryConfigStore>,
    pub scheduler: Arc<PurgeScheduler>,
}

/// Purge enabled with a one minute polling interval and fast retries.
pub fn enabled_config(descriptors: Vec<StorageDescriptor>) -> ArchiveConfig {
    let mut config = ArchiveConfig::default();
    config.purge.purge_polling_interval_secs = Some(60);
    config.purge.db_retry_delay_ms = 1;
    config.storage_descriptors = descriptors;
    config
}

pub async fn setup_test_archive(config: ArchiveConfig) -> TestArchive {
    let archive = Arc::new(InMemoryArchive::new());
    let tiers = Arc::new(MemoryStorageFactory::new());
    let store = Arc::new(MemoryConfigStore::new(config));
    let handle = ConfigHandle::load(store.clone())
        .await
        .expect("load archive configuration");
    let ctx = PurgeContext::new(archive.clone(), tiers.clone(), Arc::new(handle));

    TestArchive {
        archive,
        tiers,
        config: store,
        scheduler: Arc::new(PurgeScheduler::new(ctx)),
    }
}

impl TestArchive {
    pub fn ctx(&self) -> &PurgeContext {
        self.scheduler.context()
    }

    pub fn tier(&self, storage_id: &str) -> Arc<MemoryStorage> {
        self.tiers.tier(storage_id)
    }

    pub fn descriptor(&self, storage_id: &str) -> StorageDescriptor {
        self.config
            .current()
            .descriptor(storage_id)
            .cloned()
            .expect("descriptor configured")
    }

    pub fn bookmark(&self, storage_id: &str) -> Option<DateTime<Utc>> {
        self.descriptor(storage_id).deleter_min_study_access_time
    }

    /// A study with one instance whose object of `size` bytes is stored on every tier
    /// in `tiers` at `<uid>/<tier>`, with status `OK`.
    pub fn add_study_with_objects(
        &self,
        uid: &str,
        access_time: DateTime<Utc>,
        tiers: &[&str],
        size: usize,
    ) -> StudyRef {
        let study = self.archive.add_study(uid, access_time, tiers);
        let series = self.archive.add_series(study.pk, &format!("{}.1", uid));
        let instance = self.archive.add_instance(series);
        for tier in tiers {
            self.add_object(instance, tier, &format!("{}/{}", uid, tier), size);
        }
        study
    }

    pub fn add_object(&self, instance_pk: i64, storage_id: &str, path: &str, size: usize) -> i64 {
        self.tier(storage_id).put(path, vec![0u8; size]);
        self.archive
            .add_location(Some(instance_pk), storage_id, path, size as u64, LocationStatus::Ok)
            .pk
    }
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

pub fn tier(storage_id: &str, duration: StorageDuration) -> StorageDescriptor {
    let mut desc = StorageDescriptor::new(storage_id, format!("/var/lib/vesalius/{}", storage_id));
    desc.storage_duration = duration;
    desc
}

/// A cache tier that evicts oldest studies first, without retention or thresholds.
pub fn unconstrained_cache(storage_id: &str) -> StorageDescriptor {
    let mut desc = tier(storage_id, StorageDuration::Cache);
    desc.no_deletion_constraint = true;
    desc
}

pub fn min_usable_space(bytes: u64) -> DeleterThreshold {
    DeleterThreshold {
        min_usable_space: Some(bytes),
        max_used_space: None,
        schedule: None,
    }
}

/// A series metadata archive holding one JSON record per entry.
pub fn metadata_zip(records: &[serde_json::Value]) -> Vec<u8> {
    let mut buffer = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
        for (i, record) in records.iter().enumerate() {
            zip.start_file(format!("{}.json", i), FileOptions::default())
                .expect("start entry");
            zip.write_all(record.to_string().as_bytes())
                .expect("write entry");
        }
        zip.finish().expect("finish archive");
    }
    buffer
}
