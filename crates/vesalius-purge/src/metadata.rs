//! Series metadata archives.
//!
//! Once a series' instance records are purged from the database, the only record of
//! where its objects live is the series metadata archive: a ZIP file holding one JSON
//! placement record per instance.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use vesalius_core::{LocationStatus, RestoredInstance, RestoredPlacement};

/// One placement of an object on a storage tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePlacement {
    pub storage_id: Option<String>,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub size: u64,
    /// Absent means the object was stored without problems.
    #[serde(default)]
    pub status: Option<String>,
}

impl StoragePlacement {
    fn is_on(&self, storage_ids: &[String]) -> bool {
        self.storage_id
            .as_ref()
            .is_some_and(|id| storage_ids.contains(id))
    }

    fn location_status(&self) -> Result<LocationStatus> {
        match self.status.as_deref() {
            None => Ok(LocationStatus::Ok),
            Some(status) => status.parse(),
        }
    }

    fn is_healthy_on(&self, storage_ids: &[String]) -> bool {
        self.is_on(storage_ids)
            && self
                .location_status()
                .is_ok_and(|status| status.is_healthy())
    }

    /// `None` for placements recorded without a storage path.
    fn to_restored(&self) -> Result<Option<RestoredPlacement>> {
        let (Some(storage_id), Some(storage_path)) = (&self.storage_id, &self.storage_path) else {
            return Ok(None);
        };
        Ok(Some(RestoredPlacement {
            storage_id: storage_id.clone(),
            storage_path: storage_path.clone(),
            size: self.size,
            status: self.location_status()?,
        }))
    }
}

/// Placement record of one instance, as stored in a metadata archive entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    #[serde(default)]
    pub sop_instance_uid: String,
    #[serde(flatten)]
    pub primary: StoragePlacement,
    #[serde(default)]
    pub other_storage: Vec<StoragePlacement>,
}

impl PlacementRecord {
    fn placements(&self) -> impl Iterator<Item = &StoragePlacement> {
        std::iter::once(&self.primary).chain(self.other_storage.iter())
    }

    /// Whether the instance has a copy on `storage_id` but no healthy copy on any of
    /// `export_storage_ids`.
    pub fn lacks_export_copy(&self, storage_id: &str, export_storage_ids: &[String]) -> bool {
        let tier = [storage_id.to_string()];
        self.placements().any(|p| p.is_on(&tier))
            && !self.placements().any(|p| p.is_healthy_on(export_storage_ids))
    }

    pub fn to_restored(&self) -> Result<RestoredInstance> {
        let mut placements = Vec::new();
        for placement in self.placements() {
            if let Some(restored) = placement.to_restored().with_context(|| {
                format!("Invalid placement of instance {}", self.sop_instance_uid)
            })? {
                placements.push(restored);
            }
        }
        Ok(RestoredInstance {
            sop_instance_uid: self.sop_instance_uid.clone(),
            placements,
        })
    }
}

/// Count the instances in a metadata archive that are on `storage_id` without a
/// healthy copy on an export storage.
pub fn count_unexported(
    archive: &[u8],
    storage_id: &str,
    export_storage_ids: &[String],
) -> Result<u64> {
    let records = read_placement_records(archive)?;
    Ok(records
        .iter()
        .filter(|r| r.lacks_export_copy(storage_id, export_storage_ids))
        .count() as u64)
}

/// Instance records to recreate from a metadata archive.
pub fn restored_instances(archive: &[u8]) -> Result<Vec<RestoredInstance>> {
    read_placement_records(archive)?
        .iter()
        .map(PlacementRecord::to_restored)
        .collect()
}

pub fn read_placement_records(archive: &[u8]) -> Result<Vec<PlacementRecord>> {
    let mut zip =
        zip::ZipArchive::new(Cursor::new(archive)).context("Not a metadata ZIP archive")?;
    let mut records = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .with_context(|| format!("Failed to open archive entry {}", i))?;
        if entry.is_dir() {
            continue;
        }
        let mut json = String::new();
        entry
            .read_to_string(&mut json)
            .with_context(|| format!("Failed to read archive entry {}", entry.name()))?;
        let record: PlacementRecord = serde_json::from_str(&json)
            .with_context(|| format!("Invalid placement record in {}", entry.name()))?;
        records.push(record);
    }
    Ok(records)
}
