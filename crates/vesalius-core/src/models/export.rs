//! Export completion notifications.

use serde::{Deserialize, Serialize};

/// What an export covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportScope {
    Study,
    Series,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportOutcome {
    Completed,
    Warning,
    Failed,
}

/// Delivered by the exporter after an export task finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCompleted {
    pub exporter_id: String,
    pub study_uid: String,
    #[serde(default)]
    pub series_uid: Option<String>,
    #[serde(default)]
    pub sop_instance_uid: Option<String>,
    /// Tier the exporter is configured to clear after a successful export.
    #[serde(default)]
    pub delete_from_storage_id: Option<String>,
    pub outcome: ExportOutcome,
}

impl ExportCompleted {
    /// Any SOP instance UID narrows the export to one instance, even without a series.
    pub fn scope(&self) -> ExportScope {
        match (&self.series_uid, &self.sop_instance_uid) {
            (_, Some(_)) => ExportScope::Instance,
            (Some(_), None) => ExportScope::Series,
            (None, None) => ExportScope::Study,
        }
    }
}
