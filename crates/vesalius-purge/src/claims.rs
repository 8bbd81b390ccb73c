//! Object-only eviction of a study from a cache tier.

use anyhow::Context;
use vesalius_core::{ClaimOutcome, PurgedSeries, StorageDescriptor, StorageIds, StudyRef};

use crate::context::PurgeContext;
use crate::metadata::restored_instances;

/// Take the study off `storage_ids` and queue its objects there for deletion.
///
/// Returns true if this call won the claim and marked the objects. A lost claim is
/// expected under concurrency and returns false without touching anything. If the
/// objects cannot be marked after a won claim, the study assignment is repaired: the
/// previous assignment is restored while the study still has objects on the tier,
/// otherwise only the tier is dropped from it.
pub async fn evict_objects_of_study(
    ctx: &PurgeContext,
    desc: &StorageDescriptor,
    study: &StudyRef,
    storage_ids: &[String],
) -> bool {
    let repo = ctx.repository.as_ref();

    let previous = match repo.claim_study(study, &desc.storage_id, storage_ids).await {
        Ok(ClaimOutcome::Claimed(previous)) => previous,
        Ok(outcome) => {
            tracing::debug!(
                study = %study,
                storage_id = %desc.storage_id,
                outcome = ?outcome,
                "Study already evicted from storage by another worker"
            );
            return false;
        }
        Err(e) => {
            tracing::warn!(
                study = %study,
                storage_id = %desc.storage_id,
                error = %e,
                "Failed to claim study for deletion"
            );
            return false;
        }
    };

    match repo
        .mark_objects_of_study_for_deletion(study.pk, storage_ids)
        .await
    {
        Ok(marked) => {
            tracing::info!(
                study = %study,
                storage_id = %desc.storage_id,
                objects = marked,
                "Marked objects of study for deletion"
            );
            true
        }
        Err(e) => {
            tracing::warn!(
                study = %study,
                storage_id = %desc.storage_id,
                error = %e,
                "Failed to mark objects of study for deletion"
            );
            repair_assignment(ctx, desc, study, previous).await;
            false
        }
    }
}

async fn repair_assignment(
    ctx: &PurgeContext,
    desc: &StorageDescriptor,
    study: &StudyRef,
    previous: StorageIds,
) {
    let repo = ctx.repository.as_ref();

    let still_on_tier = ctx
        .with_retry("has_objects_on_storage", || {
            repo.has_objects_on_storage(study.pk, &desc.storage_id)
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(study = %study, error = %e, "Failed to check objects of study");
            true
        });

    let assignment = if still_on_tier {
        previous
    } else {
        previous.without(std::slice::from_ref(&desc.storage_id))
    };

    match ctx
        .with_retry("set_study_storage_ids", || {
            repo.set_study_storage_ids(study.pk, &assignment)
        })
        .await
    {
        Ok(()) => tracing::info!(
            study = %study,
            storage_ids = %assignment,
            "Restored storage assignment of study"
        ),
        Err(e) => tracing::error!(
            study = %study,
            storage_ids = %assignment,
            error = %e,
            "Failed to restore storage assignment of study"
        ),
    }
}

/// Recreate the instance records of the study's purged series from their metadata
/// archives, so that marking the study's objects reaches every object it has.
pub async fn restore_purged_instances(ctx: &PurgeContext, study: &StudyRef) -> anyhow::Result<usize> {
    let repo = ctx.repository.as_ref();
    let mut restored = 0;
    for series in repo.find_series_with_purged_instances(study.pk).await? {
        let data = read_series_metadata(ctx, &series).await?;
        let instances = restored_instances(&data).with_context(|| {
            format!("Failed to parse metadata of series {}", series.series_uid)
        })?;
        restored += ctx
            .with_retry("restore_instances", || {
                repo.restore_instances(series.series_pk, &instances)
            })
            .await?;
    }
    if restored > 0 {
        tracing::info!(
            study = %study,
            instances = restored,
            "Restored purged instance records of study"
        );
    }
    Ok(restored)
}

pub async fn read_series_metadata(ctx: &PurgeContext, series: &PurgedSeries) -> anyhow::Result<Vec<u8>> {
    let desc = ctx
        .config
        .descriptor(&series.metadata_storage_id)
        .with_context(|| {
            format!(
                "Metadata storage {} of series {} not configured",
                series.metadata_storage_id, series.series_uid
            )
        })?;
    let storage = ctx.storage.open(&desc).await?;
    let data = storage
        .read(&series.metadata_storage_path)
        .await
        .with_context(|| {
            format!(
                "Failed to read metadata {} of series {}",
                series.metadata_storage_path, series.series_uid
            )
        })?;
    Ok(data)
}
