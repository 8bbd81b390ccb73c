//! Retention and threshold evaluation: which studies leave a tier, and whether a tier
//! is short of space.

use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use vesalius_core::{AppError, PurgedSeries, StorageDescriptor, StudyRef};
use vesalius_storage::Storage;

use crate::claims::{evict_objects_of_study, read_series_metadata, restore_purged_instances};
use crate::context::PurgeContext;
use crate::metadata::count_unexported;
use crate::report::PurgeReport;

/// Size of one block in the external used-space accounting file.
const ACCOUNTING_BLOCK_SIZE: u64 = 1024;

/// Next upper bound of the sliding window after `from`.
///
/// Moves `step` forward, clamped to `floor` (studies accessed after it are never
/// eligible). Returns `None` once the window would reach `now`, meaning the remaining
/// scan is unbounded.
pub fn advance(
    from: DateTime<Utc>,
    step: Duration,
    floor: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // Past the calendar range counts as past any floor and past now.
    let next = from.checked_add_signed(step);
    match (next, floor) {
        (None, Some(floor)) => Some(floor),
        (Some(next), Some(floor)) if next >= floor => Some(floor),
        (Some(next), _) if next < now => Some(next),
        _ => None,
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Selects and evicts studies from one tier.
pub struct RetentionEvaluator<'a> {
    ctx: &'a PurgeContext,
    desc: &'a StorageDescriptor,
    storage_ids: Vec<String>,
}

impl<'a> RetentionEvaluator<'a> {
    pub fn new(ctx: &'a PurgeContext, desc: &'a StorageDescriptor) -> Self {
        let storage_ids = ctx.config.snapshot().storage_ids_for_deletion(desc);
        Self {
            ctx,
            desc,
            storage_ids,
        }
    }

    /// Evict the next batch of eligible studies. Returns the number of studies
    /// evicted; zero once no study qualifies.
    ///
    /// With `using_retention` only studies older than the longest applicable retention
    /// period qualify. When a step interval is configured the candidate window starts
    /// at the tier's bookmark and moves forward one step at a time while it is empty,
    /// persisting the bookmark after every step.
    #[tracing::instrument(skip(self, report), fields(storage_id = %self.desc.storage_id))]
    pub async fn delete_studies(&self, using_retention: bool, report: &mut PurgeReport) -> usize {
        let settings = self.ctx.config.settings();
        let now = Utc::now();
        let storage_id = self.desc.storage_id.as_str();

        let retention_cutoff = if using_retention {
            match self.desc.retention_cutoff(now) {
                Some(cutoff) => Some(cutoff),
                None => {
                    tracing::debug!(storage_id = storage_id, "No retention period applies now");
                    return 0;
                }
            }
        } else {
            None
        };
        let preserve = settings
            .preserve_study_interval()
            .map(|i| now.checked_sub_signed(i).unwrap_or(DateTime::<Utc>::MIN_UTC));
        let floor = earliest(preserve, retention_cutoff);
        let step = settings
            .delete_study_interval()
            .filter(|step| *step > Duration::zero());

        let mut max = match step {
            Some(step) => {
                let min = match self.ctx.config.bookmark(storage_id) {
                    Some(bookmark) => bookmark,
                    None => match self
                        .ctx
                        .repository
                        .min_study_access_time(storage_id, retention_cutoff)
                        .await
                    {
                        Ok(Some(min)) => min,
                        Ok(None) => {
                            tracing::warn!(storage_id = storage_id, "No studies for deletion found");
                            return 0;
                        }
                        Err(e) => {
                            tracing::warn!(
                                storage_id = storage_id,
                                error = %e,
                                "Failed to query minimum study access time"
                            );
                            return 0;
                        }
                    },
                };
                self.persist_bookmark(min).await;
                advance(min, step, floor, now)
            }
            None => floor,
        };

        loop {
            let studies = match self
                .find_studies_for_deletion(max, settings.delete_study_batch_size, report)
                .await
            {
                Ok(studies) => studies,
                Err(e) => {
                    tracing::warn!(
                        storage_id = storage_id,
                        error = %e,
                        "Query for studies for deletion failed"
                    );
                    return 0;
                }
            };

            if !studies.is_empty() {
                let evicted = if self.desc.is_cache() {
                    self.delete_objects_of_studies(studies, report).await
                } else {
                    self.delete_studies_from_db(studies, settings.delete_study_chunk_size, report)
                        .await
                };
                report.studies_evicted += evicted;
                return evicted;
            }

            let Some(step) = step else { break };
            self.persist_bookmark(max.unwrap_or(now)).await;
            match max {
                Some(current) if Some(current) != floor => {
                    tracing::info!(
                        storage_id = storage_id,
                        not_accessed_before = %current,
                        "No studies for deletion found, advancing window"
                    );
                    max = advance(current, step, floor, now);
                }
                _ => break,
            }
        }

        tracing::warn!(
            storage_id = storage_id,
            not_accessed_before = ?max,
            "No studies for deletion found"
        );
        0
    }

    async fn persist_bookmark(&self, scanned: DateTime<Utc>) {
        if let Err(e) = self
            .ctx
            .config
            .persist_bookmark(&self.desc.storage_id, scanned)
            .await
        {
            tracing::warn!(
                storage_id = %self.desc.storage_id,
                error = %e,
                "Failed to persist deleter bookmark"
            );
        }
    }

    /// Candidates accessed before `before`, minus the studies deferred because some of
    /// their objects have no healthy copy on an export storage yet.
    pub async fn find_studies_for_deletion(
        &self,
        before: Option<DateTime<Utc>>,
        limit: usize,
        report: &mut PurgeReport,
    ) -> Result<Vec<StudyRef>, AppError> {
        let studies = self
            .ctx
            .repository
            .find_studies_for_deletion(&self.desc.storage_id, before, limit)
            .await?;
        if self.desc.export_storage_ids.is_empty() {
            return Ok(studies);
        }

        let mut eligible = Vec::with_capacity(studies.len());
        for study in studies {
            match self.objects_not_on_export_storage(&study).await {
                Ok(0) => {
                    eligible.push(study);
                    continue;
                }
                Ok(pending) => tracing::info!(
                    study = %study,
                    storage_id = %self.desc.storage_id,
                    pending = pending,
                    "Defer deletion of study: objects not yet stored on export storage"
                ),
                Err(e) => tracing::warn!(
                    study = %study,
                    storage_id = %self.desc.storage_id,
                    error = %e,
                    "Defer deletion of study: failed to verify export of its objects"
                ),
            }
            self.defer(&study, report).await;
        }
        Ok(eligible)
    }

    /// Bump the study's access time so the next selections pass over it.
    async fn defer(&self, study: &StudyRef, report: &mut PurgeReport) {
        let repo = self.ctx.repository.as_ref();
        if let Err(e) = self
            .ctx
            .with_retry("update_study_access_time", || {
                repo.update_study_access_time(study.pk)
            })
            .await
        {
            tracing::warn!(study = %study, error = %e, "Failed to defer study");
        }
        report.studies_deferred += 1;
    }

    /// Restore the study's purged instances before it is evicted. A study that cannot
    /// be restored is deferred instead.
    async fn ready_for_eviction(&self, study: &StudyRef, report: &mut PurgeReport) -> bool {
        match restore_purged_instances(self.ctx, study).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    study = %study,
                    storage_id = %self.desc.storage_id,
                    error = format!("{:#}", e),
                    "Defer deletion of study: failed to restore purged instances"
                );
                self.defer(study, report).await;
                false
            }
        }
    }

    async fn objects_not_on_export_storage(&self, study: &StudyRef) -> Result<u64, AppError> {
        let repo = self.ctx.repository.as_ref();
        let mut count = repo
            .instances_not_stored_on_export_storage(
                study.pk,
                &self.desc.storage_id,
                &self.desc.export_storage_ids,
            )
            .await?;
        for series in repo.find_series_with_purged_instances(study.pk).await? {
            count += self.objects_not_on_export_storage_in(&series).await;
        }
        Ok(count)
    }

    /// Count from the series metadata archive. An archive that cannot be read counts as
    /// one object whose export is unverified.
    async fn objects_not_on_export_storage_in(&self, series: &PurgedSeries) -> u64 {
        let counted = match read_series_metadata(self.ctx, series).await {
            Ok(data) => count_unexported(
                &data,
                &self.desc.storage_id,
                &self.desc.export_storage_ids,
            ),
            Err(e) => Err(e),
        };
        match counted {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(
                    series_uid = %series.series_uid,
                    path = %series.metadata_storage_path,
                    error = format!("{:#}", e),
                    "Failed to read metadata of series"
                );
                1
            }
        }
    }

    /// Delete the records of each study, chunk by chunk. Returns the number of studies
    /// removed.
    async fn delete_studies_from_db(
        &self,
        studies: Vec<StudyRef>,
        chunk_size: usize,
        report: &mut PurgeReport,
    ) -> usize {
        let mut removed = 0;
        for study in studies {
            if !self.ctx.keep_going().await {
                tracing::info!(storage_id = %self.desc.storage_id, "Deletion of studies interrupted");
                break;
            }
            if !self.ready_for_eviction(&study, report).await {
                continue;
            }
            match self.delete_study_from_db(&study, chunk_size.max(1)).await {
                Ok(instances) => {
                    removed += 1;
                    tracing::info!(
                        study = %study,
                        storage_id = %self.desc.storage_id,
                        instances = instances,
                        "Deleted study from archive"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        study = %study,
                        storage_id = %self.desc.storage_id,
                        error = %e,
                        "Failed to delete study"
                    );
                }
            }
        }
        removed
    }

    async fn delete_study_from_db(&self, study: &StudyRef, chunk_size: usize) -> Result<usize, AppError> {
        let repo = self.ctx.repository.as_ref();
        let mut instances = 0;
        loop {
            let deleted = self
                .ctx
                .with_retry("delete_study_chunk", || {
                    repo.delete_study_chunk(study.pk, chunk_size)
                })
                .await?;
            if deleted == 0 {
                return Ok(instances);
            }
            instances += deleted;
        }
    }

    async fn delete_objects_of_studies(
        &self,
        studies: Vec<StudyRef>,
        report: &mut PurgeReport,
    ) -> usize {
        let mut evicted = 0;
        for study in studies {
            if !self.ctx.keep_going().await {
                tracing::info!(storage_id = %self.desc.storage_id, "Eviction of studies interrupted");
                break;
            }
            if !self.ready_for_eviction(&study, report).await {
                continue;
            }
            if evict_objects_of_study(self.ctx, self.desc, &study, &self.storage_ids).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Bytes missing to reach the tier's minimum usable space. Zero when no minimum
    /// applies or the backend cannot tell.
    pub async fn usable_space_underflow(&self, storage: &Arc<dyn Storage>) -> u64 {
        let Some(min) = self.desc.min_usable_space(Utc::now()) else {
            return 0;
        };
        match storage.usable_space().await {
            Ok(usable) => min.saturating_sub(usable),
            Err(e) => {
                tracing::warn!(
                    storage_id = %self.desc.storage_id,
                    error = %e,
                    "Failed to determine usable space"
                );
                0
            }
        }
    }

    /// Bytes used beyond the tier's maximum, according to the external accounting file.
    pub async fn used_space_overflow(&self) -> u64 {
        let max = match self.desc.max_used_space(Utc::now()) {
            Some(max) if max > 0 => max,
            _ => return 0,
        };
        let Some(path) = self.desc.deleter_threshold_blocks_file.as_deref() else {
            return 0;
        };
        match read_used_blocks(path).await {
            Ok(0) => {
                tracing::warn!(
                    storage_id = %self.desc.storage_id,
                    path = %path.display(),
                    "Used space accounting reports zero blocks"
                );
                0
            }
            Ok(blocks) => blocks
                .saturating_mul(ACCOUNTING_BLOCK_SIZE)
                .saturating_sub(max),
            Err(e) => {
                tracing::warn!(
                    storage_id = %self.desc.storage_id,
                    path = %path.display(),
                    error = format!("{:#}", e),
                    "Failed to read used space accounting"
                );
                0
            }
        }
    }
}

/// First whitespace-separated token of the accounting file, as a block count.
async fn read_used_blocks(path: &Path) -> anyhow::Result<u64> {
    use anyhow::Context;

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let token = content
        .split_whitespace()
        .next()
        .with_context(|| format!("{} is empty", path.display()))?;
    token
        .parse::<u64>()
        .with_context(|| format!("Invalid block count in {}: {}", path.display(), token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_advance_clamps_to_floor() {
        let now = Utc::now();
        let floor = now - Duration::days(10);
        assert_eq!(
            advance(now - Duration::days(12), Duration::days(1), Some(floor), now),
            Some(now - Duration::days(11))
        );
        assert_eq!(
            advance(now - Duration::days(11), Duration::days(5), Some(floor), now),
            Some(floor)
        );
    }

    #[test]
    fn test_advance_past_now_is_unbounded() {
        let now = Utc::now();
        assert_eq!(
            advance(now - Duration::hours(1), Duration::days(1), None, now),
            None
        );
    }

    #[test]
    fn test_advance_with_huge_step_does_not_overflow() {
        let now = Utc::now();
        let from = now - Duration::days(3);
        let floor = now - Duration::days(1);
        assert_eq!(advance(from, Duration::MAX, Some(floor), now), Some(floor));
        assert_eq!(advance(from, Duration::MAX, None, now), None);
    }

    #[tokio::test]
    async fn test_read_used_blocks_takes_first_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        std::fs::write(&path, "2048\t/var/lib/cache\n").unwrap();
        assert_eq!(read_used_blocks(&path).await.unwrap(), 2048);

        std::fs::write(&path, "lots").unwrap();
        assert!(read_used_blocks(&path).await.is_err());
        assert!(read_used_blocks(&dir.path().join("absent")).await.is_err());
    }

    proptest! {
        #[test]
        fn advance_never_passes_floor_and_always_moves(
            from_days in 1i64..1000,
            step_hours in 1i64..500,
            floor_days in proptest::option::of(0i64..1000),
        ) {
            let now = Utc::now();
            let from = now - Duration::days(from_days);
            let floor = floor_days.map(|d| now - Duration::days(d));
            // The window only advances while it is still below the floor.
            prop_assume!(floor.map_or(true, |f| from < f));

            match advance(from, Duration::hours(step_hours), floor, now) {
                Some(next) => {
                    prop_assert!(next > from);
                    prop_assert!(next < now || Some(next) == floor);
                    if let Some(floor) = floor {
                        prop_assert!(next <= floor);
                    }
                }
                None => prop_assert!(from + Duration::hours(step_hours) >= now),
            }
        }
    }
}
