//! Study handles and storage-ID assignments.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delimiter between storage IDs in a persisted study assignment.
pub const STORAGE_IDS_DELIMITER: char = '\\';

/// Lightweight handle identifying one study by primary key and instance UID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudyRef {
    pub pk: i64,
    pub uid: String,
}

impl StudyRef {
    pub fn new(pk: i64, uid: impl Into<String>) -> Self {
        Self {
            pk,
            uid: uid.into(),
        }
    }
}

impl fmt::Display for StudyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Study[pk={}, uid={}]", self.pk, self.uid)
    }
}

/// The set of storage IDs a study is assigned to, in persisted order.
///
/// Persisted as a single delimiter-joined column; an empty assignment is persisted
/// as NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StorageIds(Vec<String>);

impl StorageIds {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }

    /// Parse a persisted assignment. Empty segments are ignored.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(s) => Self(
                s.split(STORAGE_IDS_DELIMITER)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            None => Self::default(),
        }
    }

    /// The persisted form: `None` when empty.
    pub fn to_db_value(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.join(&STORAGE_IDS_DELIMITER.to_string()))
        }
    }

    pub fn contains(&self, storage_id: &str) -> bool {
        self.0.iter().any(|id| id == storage_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The assignment with every ID in `removed` dropped.
    pub fn without(&self, removed: &[String]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|id| !removed.contains(id))
                .cloned()
                .collect(),
        )
    }
}

impl fmt::Display for StorageIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_db_value().unwrap_or_default())
    }
}
