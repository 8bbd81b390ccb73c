//! Storage descriptor model: per-tier purge policy.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::storage_types::StorageBackend;

const DEFAULT_DELETER_THREADS: usize = 1;

fn default_deleter_threads() -> usize {
    DEFAULT_DELETER_THREADS
}

/// How long objects are meant to stay on a tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageDuration {
    /// Nothing is ever evicted automatically.
    #[default]
    Permanent,
    /// Studies are deleted from the archive once eligible.
    Temporary,
    /// Objects are evicted while the study record survives on other tiers.
    Cache,
}

impl fmt::Display for StorageDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageDuration::Permanent => f.write_str("PERMANENT"),
            StorageDuration::Temporary => f.write_str("TEMPORARY"),
            StorageDuration::Cache => f.write_str("CACHE"),
        }
    }
}

/// Hour-of-day window `[start, end)` in UTC. Wraps around midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl HourRange {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            self.start <= hour && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// When a retention period or deleter threshold applies. Empty fields match always.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleExpression {
    #[serde(default)]
    pub days_of_week: Vec<Weekday>,
    #[serde(default)]
    pub hours: Option<HourRange>,
}

impl ScheduleExpression {
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        (self.days_of_week.is_empty() || self.days_of_week.contains(&at.weekday()))
            && self.hours.map_or(true, |hours| hours.contains(at.hour()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPeriod {
    pub days: u32,
    #[serde(default)]
    pub schedule: Option<ScheduleExpression>,
}

impl RetentionPeriod {
    fn applies_at(&self, at: DateTime<Utc>) -> bool {
        self.schedule.as_ref().map_or(true, |s| s.matches(at))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleterThreshold {
    /// Evict while the backend reports less usable space than this (bytes).
    #[serde(default)]
    pub min_usable_space: Option<u64>,
    /// Evict while the external accounting reports more used space than this (bytes).
    #[serde(default)]
    pub max_used_space: Option<u64>,
    #[serde(default)]
    pub schedule: Option<ScheduleExpression>,
}

impl DeleterThreshold {
    fn applies_at(&self, at: DateTime<Utc>) -> bool {
        self.schedule.as_ref().map_or(true, |s| s.matches(at))
    }
}

/// Configuration of one physical storage tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub storage_id: String,
    #[serde(default)]
    pub backend: StorageBackend,
    /// Base directory for filesystem backends, bucket name for S3.
    pub storage_uri: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub storage_duration: StorageDuration,
    #[serde(default)]
    pub retention_periods: Vec<RetentionPeriod>,
    #[serde(default)]
    pub deleter_thresholds: Vec<DeleterThreshold>,
    /// File whose first token is the number of 1 KiB blocks in use on this tier.
    #[serde(default)]
    pub deleter_threshold_blocks_file: Option<PathBuf>,
    #[serde(default = "default_deleter_threads")]
    pub deleter_threads: usize,
    /// Tiers that must hold a healthy copy before this tier may evict.
    #[serde(default)]
    pub export_storage_ids: Vec<String>,
    #[serde(default)]
    pub storage_cluster_id: Option<String>,
    /// Whole series are packed into one TAR file per series.
    #[serde(default)]
    pub archive_series_as_tar: bool,
    /// Evict oldest studies without retention or thresholds.
    #[serde(default)]
    pub no_deletion_constraint: bool,
    /// Sliding-window bookmark: access times before this were already scanned.
    #[serde(default)]
    pub deleter_min_study_access_time: Option<DateTime<Utc>>,
}

impl StorageDescriptor {
    pub fn new(storage_id: impl Into<String>, storage_uri: impl Into<String>) -> Self {
        Self {
            storage_id: storage_id.into(),
            backend: StorageBackend::default(),
            storage_uri: storage_uri.into(),
            properties: HashMap::new(),
            read_only: false,
            storage_duration: StorageDuration::default(),
            retention_periods: Vec::new(),
            deleter_thresholds: Vec::new(),
            deleter_threshold_blocks_file: None,
            deleter_threads: DEFAULT_DELETER_THREADS,
            export_storage_ids: Vec::new(),
            storage_cluster_id: None,
            archive_series_as_tar: false,
            no_deletion_constraint: false,
            deleter_min_study_access_time: None,
        }
    }

    pub fn is_cache(&self) -> bool {
        self.storage_duration == StorageDuration::Cache
    }

    pub fn has_retention_periods(&self) -> bool {
        !self.retention_periods.is_empty()
    }

    pub fn has_deleter_thresholds(&self) -> bool {
        self.deleter_thresholds
            .iter()
            .any(|t| t.min_usable_space.is_some() || t.max_used_space.is_some())
    }

    /// Studies last accessed before the returned instant have outlived the longest
    /// retention period applicable at `now`.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.retention_periods
            .iter()
            .filter(|p| p.applies_at(now))
            .map(|p| p.days)
            .max()
            .map(|days| {
                now.checked_sub_signed(Duration::days(i64::from(days)))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            })
    }

    pub fn min_usable_space(&self, now: DateTime<Utc>) -> Option<u64> {
        self.deleter_thresholds
            .iter()
            .filter(|t| t.applies_at(now))
            .find_map(|t| t.min_usable_space)
    }

    pub fn max_used_space(&self, now: DateTime<Utc>) -> Option<u64> {
        self.deleter_thresholds
            .iter()
            .filter(|t| t.applies_at(now))
            .find_map(|t| t.max_used_space)
    }

    /// Move the bookmark forward to `scanned`. Never moves it backwards.
    ///
    /// Returns true if the bookmark changed.
    pub fn advance_bookmark(&mut self, scanned: DateTime<Utc>) -> bool {
        match self.deleter_min_study_access_time {
            Some(current) if current >= scanned => false,
            _ => {
                self.deleter_min_study_access_time = Some(scanned);
                true
            }
        }
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

impl fmt::Display for StorageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage[id={}, uri={}]", self.storage_id, self.storage_uri)
    }
}
