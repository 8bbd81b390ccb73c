//! Export-completion trigger.
//!
//! Once an exporter has copied a whole study to its destination, the study's objects
//! on the exporter's origin tier can go right away instead of waiting for the next
//! scheduled scan of that tier.

use std::sync::Arc;
use tokio::sync::mpsc;
use vesalius_core::{ExportCompleted, ExportOutcome, ExportScope, StudyRef};

use crate::claims::{evict_objects_of_study, restore_purged_instances};
use crate::scheduler::{purge_objects, PurgeScheduler};

/// What the trigger did with one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportDisposition {
    /// No origin tier to clear, export not fully successful, or unknown tier.
    Ignored,
    /// Series or instance export: the study keeps its objects.
    Suppressed,
    /// Study unknown, already evicted from the tier, or its purged series could not be
    /// restored.
    Skipped,
    Evicted,
}

pub struct ExportCompletionTrigger {
    scheduler: Arc<PurgeScheduler>,
}

impl ExportCompletionTrigger {
    pub fn new(scheduler: Arc<PurgeScheduler>) -> Self {
        Self { scheduler }
    }

    #[tracing::instrument(skip(self, event), fields(exporter_id = %event.exporter_id, study_uid = %event.study_uid))]
    pub async fn on_export_completed(
        &self,
        event: &ExportCompleted,
    ) -> anyhow::Result<ExportDisposition> {
        let Some(storage_id) = event.delete_from_storage_id.as_deref() else {
            return Ok(ExportDisposition::Ignored);
        };
        if event.outcome != ExportOutcome::Completed {
            tracing::debug!(outcome = ?event.outcome, "Export not completed, keeping objects");
            return Ok(ExportDisposition::Ignored);
        }
        match event.scope() {
            ExportScope::Study => {}
            scope => {
                tracing::info!(
                    storage_id = storage_id,
                    scope = ?scope,
                    "Suppress deletion of objects from storage after partial export"
                );
                return Ok(ExportDisposition::Suppressed);
            }
        }

        let ctx = self.scheduler.context();
        let config = ctx.config.snapshot();
        let Some(desc) = config.descriptor(storage_id) else {
            tracing::warn!(storage_id = storage_id, "Storage to delete exported objects from not configured");
            return Ok(ExportDisposition::Ignored);
        };

        let Some(study_pk) = ctx.repository.study_pk_by_uid(&event.study_uid).await? else {
            tracing::warn!(storage_id = storage_id, "Exported study not found");
            return Ok(ExportDisposition::Skipped);
        };
        let study = StudyRef::new(study_pk, event.study_uid.clone());
        if let Err(e) = restore_purged_instances(ctx, &study).await {
            tracing::warn!(
                storage_id = storage_id,
                error = format!("{:#}", e),
                "Keep exported study: failed to restore purged instances"
            );
            return Ok(ExportDisposition::Skipped);
        }
        let storage_ids = config.storage_ids_for_deletion(desc);
        if !evict_objects_of_study(ctx, desc, &study, &storage_ids).await {
            return Ok(ExportDisposition::Skipped);
        }

        // A running scan of the tier picks the marked objects up itself.
        if let Some(_guard) = self.scheduler.try_acquire(storage_id) {
            let report = purge_objects(ctx, desc).await?;
            tracing::info!(
                storage_id = storage_id,
                objects = %report,
                bytes_freed = report.bytes_freed,
                "Deleted exported objects"
            );
        }
        Ok(ExportDisposition::Evicted)
    }

    /// Handle notifications until the sending side closes.
    pub async fn run(self, mut events: mpsc::Receiver<ExportCompleted>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.on_export_completed(&event).await {
                tracing::warn!(
                    exporter_id = %event.exporter_id,
                    study_uid = %event.study_uid,
                    error = format!("{:#}", e),
                    "Failed to handle export completion"
                );
            }
        }
        tracing::info!("Export completion trigger stopped");
    }
}
