//! Physical object placements and series metadata blobs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of one physical object placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationStatus {
    Ok,
    ToDelete,
    /// Claimed by a deleter; only the claim owner may delete the object.
    Deleting,
    FailedToDelete,
    MissingObject,
    VerifyAccessState,
    AccessStateOffline,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Ok => "OK",
            LocationStatus::ToDelete => "TO_DELETE",
            LocationStatus::Deleting => "DELETING",
            LocationStatus::FailedToDelete => "FAILED_TO_DELETE",
            LocationStatus::MissingObject => "MISSING_OBJECT",
            LocationStatus::VerifyAccessState => "VERIFY_ACCESS_STATE",
            LocationStatus::AccessStateOffline => "ACCESS_STATE_OFFLINE",
        }
    }

    /// Whether a placement with this status counts as a durable, healthy copy.
    pub fn is_healthy(&self) -> bool {
        matches!(self, LocationStatus::Ok)
    }

    /// Whether the placement is already queued for, or undergoing, deletion.
    pub fn is_pending_deletion(&self) -> bool {
        matches!(self, LocationStatus::ToDelete | LocationStatus::Deleting)
    }
}

impl FromStr for LocationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(LocationStatus::Ok),
            "TO_DELETE" => Ok(LocationStatus::ToDelete),
            "DELETING" => Ok(LocationStatus::Deleting),
            "FAILED_TO_DELETE" => Ok(LocationStatus::FailedToDelete),
            "MISSING_OBJECT" => Ok(LocationStatus::MissingObject),
            "VERIFY_ACCESS_STATE" => Ok(LocationStatus::VerifyAccessState),
            "ACCESS_STATE_OFFLINE" => Ok(LocationStatus::AccessStateOffline),
            _ => Err(anyhow::anyhow!("Invalid location status: {}", s)),
        }
    }
}

impl fmt::Display for LocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one physical object's placement on a storage tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub pk: i64,
    pub storage_id: String,
    /// Path on the backend. On TAR-packed tiers it may carry an in-archive entry
    /// after `!`.
    pub storage_path: String,
    pub size: u64,
    pub status: LocationStatus,
    /// Shared by all locations packed into the same archive file.
    pub multi_ref: Option<i32>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Location[pk={}, storage={}, path={}, status={}]",
            self.pk, self.storage_id, self.storage_path, self.status
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataStatus {
    Ok,
    ToDelete,
    Deleting,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::Ok => "OK",
            MetadataStatus::ToDelete => "TO_DELETE",
            MetadataStatus::Deleting => "DELETING",
        }
    }
}

impl FromStr for MetadataStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(MetadataStatus::Ok),
            "TO_DELETE" => Ok(MetadataStatus::ToDelete),
            "DELETING" => Ok(MetadataStatus::Deleting),
            _ => Err(anyhow::anyhow!("Invalid metadata status: {}", s)),
        }
    }
}

impl fmt::Display for MetadataStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One series-level metadata blob, tracked separately from object locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub pk: i64,
    pub storage_id: String,
    pub storage_path: String,
    pub status: MetadataStatus,
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Metadata[pk={}, storage={}, path={}, status={}]",
            self.pk, self.storage_id, self.storage_path, self.status
        )
    }
}

/// A series whose instance records were purged; its object placements survive only
/// inside the series metadata archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgedSeries {
    pub series_pk: i64,
    pub series_uid: String,
    pub metadata_storage_id: String,
    pub metadata_storage_path: String,
}

/// An object placement recovered from a series metadata archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredPlacement {
    pub storage_id: String,
    pub storage_path: String,
    pub size: u64,
    pub status: LocationStatus,
}

/// An instance record recovered from a series metadata archive, with its placements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredInstance {
    pub sop_instance_uid: String,
    pub placements: Vec<RestoredPlacement>,
}
