//! Deletion worker pool.
//!
//! Each queued item is claimed, physically deleted, then its record removed. Claim
//! losses are counted as skipped; any failure after a successful claim releases the
//! claim so the item is retried next cycle.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use vesalius_core::{log_error, AppError, ClaimOutcome, Location, Metadata};
use vesalius_db::PurgeRepository;
use vesalius_storage::Storage;

use crate::report::BatchReport;

/// Separates the archive file from the entry inside it in storage paths on TAR-packed
/// tiers.
pub const TAR_ENTRY_DELIMITER: char = '!';

/// Physical delete target of `storage_path`. On TAR-packed tiers everything from the
/// first `!` on names an entry inside the archive file and is dropped.
pub fn physical_path(storage_path: &str, archive_series_as_tar: bool) -> &str {
    if !archive_series_as_tar {
        return storage_path;
    }
    match storage_path.find(TAR_ENTRY_DELIMITER) {
        Some(index) if index > 0 => &storage_path[..index],
        _ => storage_path,
    }
}

/// A record queued for physical deletion.
#[async_trait]
pub trait PurgeTarget: fmt::Display + Send + Sync + 'static {
    fn storage_path(&self) -> &str;

    /// Bytes freed once the item is gone.
    fn size(&self) -> u64;

    async fn claim(&self, repo: &dyn PurgeRepository) -> Result<ClaimOutcome, AppError>;

    async fn release(&self, repo: &dyn PurgeRepository) -> Result<(), AppError>;

    async fn remove(&self, repo: &dyn PurgeRepository) -> Result<(), AppError>;
}

#[async_trait]
impl PurgeTarget for Location {
    fn storage_path(&self) -> &str {
        &self.storage_path
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn claim(&self, repo: &dyn PurgeRepository) -> Result<ClaimOutcome, AppError> {
        repo.claim_location(self).await
    }

    async fn release(&self, repo: &dyn PurgeRepository) -> Result<(), AppError> {
        repo.release_location(self).await
    }

    async fn remove(&self, repo: &dyn PurgeRepository) -> Result<(), AppError> {
        repo.remove_location(self).await
    }
}

#[async_trait]
impl PurgeTarget for Metadata {
    fn storage_path(&self) -> &str {
        &self.storage_path
    }

    fn size(&self) -> u64 {
        0
    }

    async fn claim(&self, repo: &dyn PurgeRepository) -> Result<ClaimOutcome, AppError> {
        repo.claim_metadata(self).await
    }

    async fn release(&self, repo: &dyn PurgeRepository) -> Result<(), AppError> {
        repo.release_metadata(self).await
    }

    async fn remove(&self, repo: &dyn PurgeRepository) -> Result<(), AppError> {
        repo.remove_metadata(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Deleted(u64),
    Skipped,
    Failed,
}

impl ItemOutcome {
    fn count(self, report: &mut BatchReport) {
        match self {
            ItemOutcome::Deleted(bytes) => {
                report.succeeded += 1;
                report.bytes_freed += bytes;
            }
            ItemOutcome::Skipped => report.skipped += 1,
            ItemOutcome::Failed => report.failed += 1,
        }
    }
}

/// Deletes batches of queued items with at most `concurrency` deletes in flight.
#[derive(Debug, Clone, Copy)]
pub struct DeletionPool {
    concurrency: usize,
}

impl DeletionPool {
    /// A concurrency of 0 is treated as 1.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Delete every item, returning once all of them completed.
    pub async fn delete_batch<T: PurgeTarget>(
        &self,
        repo: Arc<dyn PurgeRepository>,
        storage: Arc<dyn Storage>,
        items: Vec<T>,
        archive_series_as_tar: bool,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        if self.concurrency == 1 {
            for item in items {
                delete_one(repo.as_ref(), storage.as_ref(), &item, archive_series_as_tar)
                    .await
                    .count(&mut report);
            }
            return report;
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(error = %e, "Deleter semaphore closed");
                    report.failed += 1;
                    continue;
                }
            };
            let repo = repo.clone();
            let storage = storage.clone();

            handles.push(tokio::spawn(async move {
                let outcome =
                    delete_one(repo.as_ref(), storage.as_ref(), &item, archive_series_as_tar)
                        .await;
                drop(permit);
                outcome
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(outcome) => outcome.count(&mut report),
                Err(e) => {
                    tracing::error!(error = %e, "Deletion task panicked");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

async fn delete_one<T: PurgeTarget>(
    repo: &dyn PurgeRepository,
    storage: &dyn Storage,
    item: &T,
    archive_series_as_tar: bool,
) -> ItemOutcome {
    match item.claim(repo).await {
        Ok(ClaimOutcome::Claimed(())) => {}
        Ok(outcome) => {
            tracing::debug!(item = %item, outcome = ?outcome, "Deletion claimed elsewhere, skipping");
            return ItemOutcome::Skipped;
        }
        Err(e) => {
            log_error(&e, &format!("Failed to claim {} for deletion", item));
            return ItemOutcome::Failed;
        }
    }

    let path = physical_path(item.storage_path(), archive_series_as_tar);
    match storage.delete(path).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            tracing::debug!(item = %item, path = path, "Object already gone from storage");
        }
        Err(e) => {
            tracing::warn!(
                item = %item,
                storage_id = storage.storage_id(),
                error = %e,
                "Failed to delete object from storage"
            );
            release(repo, item).await;
            return ItemOutcome::Failed;
        }
    }

    match item.remove(repo).await {
        Ok(()) => {
            tracing::debug!(item = %item, "Deleted");
            ItemOutcome::Deleted(item.size())
        }
        Err(e) => {
            log_error(&e, &format!("Deleted {} but failed to remove its record", item));
            // The next claim finds the object gone and removes the record.
            release(repo, item).await;
            ItemOutcome::Failed
        }
    }
}

async fn release<T: PurgeTarget>(repo: &dyn PurgeRepository, item: &T) {
    if let Err(e) = item.release(repo).await {
        log_error(&e, &format!("Failed to release deletion claim of {}", item));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesalius_core::{LocationStatus, MetadataStatus};
    use vesalius_db::InMemoryArchive;
    use vesalius_storage::MemoryStorage;

    #[test]
    fn test_physical_path_truncates_tar_entries() {
        assert_eq!(physical_path("2026/series1.tar!obj1", true), "2026/series1.tar");
        assert_eq!(physical_path("a.tar!b!c", true), "a.tar");
        assert_eq!(physical_path("!entry", true), "!entry");
        assert_eq!(physical_path("plain/obj", true), "plain/obj");
        assert_eq!(physical_path("2026/series1.tar!obj1", false), "2026/series1.tar!obj1");
    }

    #[tokio::test]
    async fn test_delete_batch_counts_outcomes() {
        let archive = Arc::new(InMemoryArchive::new());
        let storage = Arc::new(MemoryStorage::new("fs1"));
        let ok = archive.add_location(None, "fs1", "ok", 5, LocationStatus::ToDelete);
        let gone = archive.add_location(None, "fs1", "gone", 7, LocationStatus::ToDelete);
        let broken = archive.add_location(None, "fs1", "broken", 9, LocationStatus::ToDelete);
        let taken = archive.add_location(None, "fs1", "taken", 3, LocationStatus::Deleting);
        storage.put("ok", vec![0u8; 5]);
        storage.put("broken", vec![0u8; 9]);
        storage.fail_deletes_of("broken");

        let report = DeletionPool::new(1)
            .delete_batch(
                archive.clone(),
                storage.clone(),
                vec![ok.clone(), gone.clone(), broken.clone(), taken.clone()],
                false,
            )
            .await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.bytes_freed, 12);
        assert!(archive.location(ok.pk).is_none());
        assert!(archive.location(gone.pk).is_none());
        assert_eq!(
            archive.location(broken.pk).unwrap().status,
            LocationStatus::ToDelete
        );
        assert_eq!(
            archive.location(taken.pk).unwrap().status,
            LocationStatus::Deleting
        );
    }

    #[tokio::test]
    async fn test_record_left_behind_is_removed_next_batch() {
        let archive = Arc::new(InMemoryArchive::new());
        let storage = Arc::new(MemoryStorage::new("fs1"));
        let location = archive.add_location(None, "fs1", "obj", 4, LocationStatus::ToDelete);
        storage.put("obj", vec![0u8; 4]);
        archive.fail_next_remove_of("obj");
        let pool = DeletionPool::new(1);

        let first = pool
            .delete_batch(archive.clone(), storage.clone(), vec![location.clone()], false)
            .await;
        assert_eq!(first.failed, 1);
        assert!(!storage.contains("obj"));
        assert_eq!(
            archive.location(location.pk).unwrap().status,
            LocationStatus::ToDelete
        );

        let second = pool
            .delete_batch(archive.clone(), storage.clone(), vec![location.clone()], false)
            .await;
        assert_eq!(second.succeeded, 1);
        assert_eq!(second.bytes_freed, 4);
        assert!(archive.location(location.pk).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_pool_deletes_everything_once() {
        let archive = Arc::new(InMemoryArchive::new());
        let storage = Arc::new(MemoryStorage::new("fs1"));
        let mut items = Vec::new();
        for i in 0..20 {
            let path = format!("obj{}", i);
            storage.put(path.clone(), vec![0u8; 2]);
            items.push(archive.add_metadata("fs1", &path, MetadataStatus::ToDelete));
        }

        let report = DeletionPool::new(4)
            .delete_batch(archive.clone(), storage.clone(), items, false)
            .await;

        assert_eq!(report.succeeded, 20);
        assert_eq!(report.total(), 20);
        // Metadata archives do not count towards freed bytes.
        assert_eq!(report.bytes_freed, 0);
        assert_eq!(storage.deleted().len(), 20);
    }

    #[tokio::test]
    async fn test_tar_tier_deletes_archive_file() {
        let archive = Arc::new(InMemoryArchive::new());
        let storage = Arc::new(MemoryStorage::new("tar1"));
        storage.put("2026/series1.tar", vec![0u8; 30]);
        let location =
            archive.add_location(None, "tar1", "2026/series1.tar!obj1", 10, LocationStatus::ToDelete);

        let report = DeletionPool::new(1)
            .delete_batch(archive.clone(), storage.clone(), vec![location], true)
            .await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(storage.deleted(), vec!["2026/series1.tar".to_string()]);
    }
}
