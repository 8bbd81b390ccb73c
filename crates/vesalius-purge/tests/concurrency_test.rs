//! Racing claims and overlapping scans.
//!
//! Run with: `cargo test -p vesalius-purge --test concurrency_test`

mod helpers;

use futures::future::join_all;
use helpers::{days_ago, enabled_config, setup_test_archive, tier, unconstrained_cache};
use vesalius_core::{LocationStatus, StorageDuration};
use vesalius_purge::{evict_objects_of_study, DeletionPool};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_study_claims_have_one_winner() {
    let desc = unconstrained_cache("cache");
    let test = setup_test_archive(enabled_config(vec![
        desc.clone(),
        tier("fs1", StorageDuration::Permanent),
    ]))
    .await;
    let study = test.add_study_with_objects("1.1", days_ago(3), &["cache", "fs1"], 10);
    let storage_ids = vec!["cache".to_string()];

    let attempts = (0..8).map(|_| {
        let ctx = test.ctx().clone();
        let desc = desc.clone();
        let study = study.clone();
        let storage_ids = storage_ids.clone();
        tokio::spawn(async move { evict_objects_of_study(&ctx, &desc, &study, &storage_ids).await })
    });
    let winners = join_all(attempts)
        .await
        .into_iter()
        .filter(|won| *won.as_ref().unwrap())
        .count();

    assert_eq!(winners, 1);
    assert_eq!(test.archive.count_calls("mark_objects_of_study_for_deletion"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_pools_delete_each_object_once() {
    let test = setup_test_archive(enabled_config(vec![tier("fs1", StorageDuration::Permanent)])).await;
    let storage = test.tier("fs1");
    let mut locations = Vec::new();
    for i in 0..50 {
        let path = format!("obj/{}", i);
        storage.put(path.clone(), vec![0u8; 4]);
        locations.push(
            test.archive
                .add_location(None, "fs1", &path, 4, LocationStatus::ToDelete),
        );
    }

    let runs = (0..3).map(|_| {
        let repo = test.ctx().repository.clone();
        let storage = storage.clone();
        let items = locations.clone();
        tokio::spawn(async move { DeletionPool::new(4).delete_batch(repo, storage, items, false).await })
    });
    let reports: Vec<_> = join_all(runs)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let succeeded: usize = reports.iter().map(|r| r.succeeded).sum();
    let skipped: usize = reports.iter().map(|r| r.skipped).sum();
    assert_eq!(succeeded, 50);
    assert_eq!(skipped, 100);
    assert_eq!(reports.iter().map(|r| r.failed).sum::<usize>(), 0);
    assert_eq!(storage.deleted().len(), 50);
    assert_eq!(reports.iter().map(|r| r.bytes_freed).sum::<u64>(), 200);
    assert!(test.archive.locations_on("fs1").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_cycles_scan_each_tier_once() {
    let test = setup_test_archive(enabled_config(vec![
        unconstrained_cache("cache"),
        tier("fs1", StorageDuration::Permanent),
    ]))
    .await;
    for i in 0..5 {
        test.add_study_with_objects(&format!("2.{}", i), days_ago(10 + i), &["cache", "fs1"], 8);
    }
    let _fs1_busy = test.scheduler.try_acquire("fs1").unwrap();

    let first = test.scheduler.run_cycle().await;
    let second = test.scheduler.run_cycle().await;
    // fs1 is held above; cache is held by the first cycle's scan unless it already
    // finished.
    assert_eq!(first.len(), 1);
    assert!(second.len() <= 1);
    for handle in first.into_iter().chain(second) {
        handle.await.unwrap();
    }

    assert_eq!(test.tier("cache").deleted().len(), 5);
    assert_eq!(test.archive.count_calls("mark_objects_of_study_for_deletion"), 5);
    assert!(!test.scheduler.is_in_process("cache"));
    assert!(test.scheduler.is_in_process("fs1"));
}

#[tokio::test]
async fn test_run_cycle_evicts_from_unconstrained_cache() {
    let test = setup_test_archive(enabled_config(vec![unconstrained_cache("cache")])).await;
    let study = test.add_study_with_objects("3.1", days_ago(10), &["cache"], 8);
    let storage = test.tier("cache");

    let handles = test.scheduler.run_cycle().await;
    for handle in handles {
        handle.await.unwrap();
    }

    // The only copy lived on the cache tier and no export storage is configured:
    // nothing stops an unconstrained cache from evicting it.
    assert!(test.archive.study_storage_ids(study.pk).unwrap().is_empty());
    assert!(!storage.contains("3.1/cache"));
}
