//! Eviction scheduler: one scan per writable tier per polling cycle.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use vesalius_core::{log_error, AppError, LocationStatus, MetadataStatus, StorageDescriptor, StorageDuration};

use crate::context::PurgeContext;
use crate::deleter::{DeletionPool, PurgeTarget};
use crate::evaluator::RetentionEvaluator;
use crate::report::{BatchReport, PurgeReport};

/// How often a disabled purge looks for a polling interval to appear.
const DISABLED_RECHECK_INTERVAL: Duration = Duration::from_secs(60);

type InProcess = Arc<Mutex<HashSet<String>>>;

fn lock(in_process: &InProcess) -> MutexGuard<'_, HashSet<String>> {
    in_process.lock().unwrap_or_else(|e| e.into_inner())
}

/// Exclusive right to scan one tier. Released on drop.
pub struct TierGuard {
    storage_id: String,
    in_process: InProcess,
}

impl TierGuard {
    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }
}

impl Drop for TierGuard {
    fn drop(&mut self) {
        lock(&self.in_process).remove(&self.storage_id);
    }
}

pub struct PurgeScheduler {
    ctx: PurgeContext,
    in_process: InProcess,
}

impl PurgeScheduler {
    pub fn new(ctx: PurgeContext) -> Self {
        Self {
            ctx,
            in_process: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn context(&self) -> &PurgeContext {
        &self.ctx
    }

    /// Take the tier's exclusivity token, or `None` while a scan of it is running.
    pub fn try_acquire(&self, storage_id: &str) -> Option<TierGuard> {
        if !lock(&self.in_process).insert(storage_id.to_string()) {
            return None;
        }
        Some(TierGuard {
            storage_id: storage_id.to_string(),
            in_process: self.in_process.clone(),
        })
    }

    pub fn is_in_process(&self, storage_id: &str) -> bool {
        lock(&self.in_process).contains(storage_id)
    }

    /// Start a scan of every writable tier not already being scanned. Scan failures
    /// are logged and never propagate; the tier is retried next cycle.
    pub async fn run_cycle(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.ctx.config.reload().await;
        let config = self.ctx.config.snapshot();
        if !config.purge.is_enabled() || self.ctx.is_stopping() {
            return Vec::new();
        }

        let mut handles = Vec::new();
        for desc in config.storage_descriptors {
            if desc.read_only {
                continue;
            }
            let Some(guard) = self.try_acquire(&desc.storage_id) else {
                tracing::debug!(storage_id = %desc.storage_id, "Deletion still in process, skipping tier");
                continue;
            };

            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                tracing::info!(storage_id = %desc.storage_id, "Start deletion on {}", desc);
                match scheduler.process(&desc).await {
                    Ok(report) => tracing::info!(
                        storage_id = %desc.storage_id,
                        metadata = %report.metadata,
                        objects = %report.objects,
                        bytes_freed = report.bytes_freed(),
                        studies_evicted = report.studies_evicted,
                        studies_deferred = report.studies_deferred,
                        "Finished deletion on {}",
                        desc
                    ),
                    Err(e) => match e.downcast_ref::<AppError>() {
                        Some(app_error) => {
                            log_error(app_error, &format!("Deletion on {} failed", desc))
                        }
                        None => tracing::error!(
                            storage_id = %desc.storage_id,
                            error = format!("{:#}", e),
                            "Deletion on {} failed",
                            desc
                        ),
                    },
                }
            }));
        }
        handles
    }

    /// Poll until a message arrives on `shutdown_rx`, then wait for running scans to
    /// finish their current batch.
    pub async fn start(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut period = self.current_period();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut running: Vec<JoinHandle<()>> = Vec::new();

        tracing::info!(poll_interval_secs = period.as_secs(), "Purge scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    running.retain(|handle| !handle.is_finished());
                    running.extend(self.run_cycle().await);

                    let configured = self.current_period();
                    if configured != period {
                        tracing::info!(
                            poll_interval_secs = configured.as_secs(),
                            "Purge polling interval changed"
                        );
                        period = configured;
                        ticker = interval(period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        ticker.tick().await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Purge scheduler shutting down");
                    break;
                }
            }
        }

        self.ctx.request_stop();
        for handle in running {
            let _ = handle.await;
        }
    }

    fn current_period(&self) -> Duration {
        self.ctx
            .config
            .settings()
            .polling_interval()
            .filter(|p| !p.is_zero())
            .unwrap_or(DISABLED_RECHECK_INTERVAL)
    }

    /// One scan of one tier.
    #[tracing::instrument(skip(self, desc), fields(storage_id = %desc.storage_id))]
    pub async fn process(&self, desc: &StorageDescriptor) -> anyhow::Result<PurgeReport> {
        let ctx = &self.ctx;
        let mut report = PurgeReport::new(&desc.storage_id);

        report.metadata += purge_metadata(ctx, desc).await?;
        report.objects += purge_objects(ctx, desc).await?;
        if desc.storage_duration == StorageDuration::Permanent {
            return Ok(report);
        }

        let evaluator = RetentionEvaluator::new(ctx, desc);
        while desc.has_retention_periods()
            && ctx.keep_going().await
            && evaluator.delete_studies(true, &mut report).await > 0
        {
            report.objects += purge_objects(ctx, desc).await?;
        }

        if desc.has_deleter_thresholds() {
            let storage = ctx
                .storage
                .open(desc)
                .await
                .map_err(|e| AppError::Storage(e.to_string()))?;
            let mut underflow = evaluator.usable_space_underflow(&storage).await;
            let mut overflow = evaluator.used_space_overflow().await;
            if underflow == 0 && overflow == 0 {
                return Ok(report);
            }
            if underflow > overflow {
                tracing::info!(
                    storage_id = %desc.storage_id,
                    bytes = underflow,
                    "Usable space below threshold"
                );
            } else {
                tracing::info!(
                    storage_id = %desc.storage_id,
                    bytes = overflow,
                    "Used space above threshold"
                );
            }

            while (underflow > 0 || overflow > 0)
                && ctx.keep_going().await
                && evaluator.delete_studies(false, &mut report).await > 0
            {
                let purged = purge_objects(ctx, desc).await?;
                overflow = overflow.saturating_sub(purged.bytes_freed);
                report.objects += purged;
                underflow = evaluator.usable_space_underflow(&storage).await;
            }
        } else if !desc.has_retention_periods() && desc.no_deletion_constraint {
            while ctx.keep_going().await && evaluator.delete_studies(false, &mut report).await > 0
            {
                report.objects += purge_objects(ctx, desc).await?;
            }
        }

        Ok(report)
    }
}

/// Delete the tier's metadata archives queued for deletion.
pub async fn purge_metadata(
    ctx: &PurgeContext,
    desc: &StorageDescriptor,
) -> Result<BatchReport, AppError> {
    let repo = ctx.repository.clone();
    let storage_id = desc.storage_id.clone();
    drain(ctx, desc, "metadata", move |limit| {
        let repo = repo.clone();
        let storage_id = storage_id.clone();
        async move {
            repo.find_metadata_with_status(&storage_id, MetadataStatus::ToDelete, limit)
                .await
        }
    })
    .await
}

/// Delete the tier's objects queued for deletion. The report carries the bytes freed.
pub async fn purge_objects(
    ctx: &PurgeContext,
    desc: &StorageDescriptor,
) -> Result<BatchReport, AppError> {
    let repo = ctx.repository.clone();
    let storage_id = desc.storage_id.clone();
    drain(ctx, desc, "objects", move |limit| {
        let repo = repo.clone();
        let storage_id = storage_id.clone();
        async move {
            repo.find_locations_with_status(&storage_id, LocationStatus::ToDelete, limit)
                .await
        }
    })
    .await
}

/// Fetch and delete batches until the queue is drained, the purge is disabled, or a
/// whole batch failed.
async fn drain<T, F, Fut>(
    ctx: &PurgeContext,
    desc: &StorageDescriptor,
    what: &'static str,
    mut fetch: F,
) -> Result<BatchReport, AppError>
where
    T: PurgeTarget,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, AppError>>,
{
    let pool = DeletionPool::new(desc.deleter_threads);
    let mut total = BatchReport::default();

    loop {
        if !ctx.keep_going().await {
            break;
        }
        let fetch_size = ctx.config.settings().purge_fetch_size.max(1);
        let items = fetch(fetch_size).await?;
        if items.is_empty() {
            break;
        }
        let fetched = items.len();

        let storage = ctx
            .storage
            .open(desc)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;
        let report = pool
            .delete_batch(
                ctx.repository.clone(),
                storage,
                items,
                desc.archive_series_as_tar,
            )
            .await;
        tracing::info!(
            storage_id = %desc.storage_id,
            what = what,
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed,
            bytes = report.bytes_freed,
            "Finished deleting {} {} from {}",
            report,
            what,
            desc
        );
        total += report;

        // Released failures come back first in the next fetch.
        if fetched < fetch_size || report.failed >= fetched {
            break;
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConfigHandle;
    use vesalius_core::{ArchiveConfig, MemoryConfigStore};
    use vesalius_db::InMemoryArchive;
    use vesalius_storage::MemoryStorageFactory;

    async fn scheduler(config: ArchiveConfig) -> Arc<PurgeScheduler> {
        let store = Arc::new(MemoryConfigStore::new(config));
        let ctx = PurgeContext::new(
            Arc::new(InMemoryArchive::new()),
            Arc::new(MemoryStorageFactory::new()),
            Arc::new(ConfigHandle::load(store).await.unwrap()),
        );
        Arc::new(PurgeScheduler::new(ctx))
    }

    #[tokio::test]
    async fn test_tier_token_is_exclusive_until_dropped() {
        let scheduler = scheduler(ArchiveConfig::default()).await;

        let guard = scheduler.try_acquire("cache").unwrap();
        assert!(scheduler.try_acquire("cache").is_none());
        assert!(scheduler.try_acquire("fs1").is_some());
        assert!(scheduler.is_in_process("cache"));

        drop(guard);
        assert!(!scheduler.is_in_process("cache"));
        assert!(scheduler.try_acquire("cache").is_some());
    }

    #[tokio::test]
    async fn test_cycle_skips_read_only_and_busy_tiers() {
        let mut config = ArchiveConfig::default();
        config.purge.purge_polling_interval_secs = Some(60);
        let mut read_only = StorageDescriptor::new("ro", "/ro");
        read_only.read_only = true;
        config.storage_descriptors = vec![
            StorageDescriptor::new("fs1", "/fs1"),
            StorageDescriptor::new("busy", "/busy"),
            read_only,
        ];
        let scheduler = scheduler(config).await;
        let _busy = scheduler.try_acquire("busy").unwrap();

        let handles = scheduler.run_cycle().await;
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!scheduler.is_in_process("fs1"));
        assert!(scheduler.is_in_process("busy"));
    }

    #[tokio::test]
    async fn test_disabled_purge_starts_nothing() {
        let mut config = ArchiveConfig::default();
        config.storage_descriptors = vec![StorageDescriptor::new("fs1", "/fs1")];
        let scheduler = scheduler(config).await;

        assert!(scheduler.run_cycle().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown() {
        let mut config = ArchiveConfig::default();
        config.purge.purge_polling_interval_secs = Some(3600);
        let scheduler = scheduler(config).await;
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(scheduler.clone().start(rx));
        tx.send(()).await.unwrap();
        handle.await.unwrap();

        assert!(scheduler.context().is_stopping());
    }
}
