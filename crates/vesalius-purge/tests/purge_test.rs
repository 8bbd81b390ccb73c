//! Tier scan scenarios against the in-memory archive.
//!
//! Run with: `cargo test -p vesalius-purge --test purge_test`

mod helpers;

use chrono::{Duration, Utc};
use helpers::{
    days_ago, enabled_config, metadata_zip, min_usable_space, setup_test_archive, tier,
    unconstrained_cache,
};
use serde_json::json;
use vesalius_core::{LocationStatus, MetadataStatus, RetentionPeriod, StorageDuration};

#[tokio::test]
async fn test_metadata_is_purged_before_objects() {
    let desc = tier("fs1", StorageDuration::Permanent);
    let test = setup_test_archive(enabled_config(vec![desc.clone()])).await;
    let metadata = test
        .archive
        .add_metadata("fs1", "meta/s1.zip", MetadataStatus::ToDelete);
    let location = test
        .archive
        .add_location(None, "fs1", "obj/1", 8, LocationStatus::ToDelete);
    test.tier("fs1").put("meta/s1.zip", vec![0u8; 4]);
    test.tier("fs1").put("obj/1", vec![0u8; 8]);

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.metadata.succeeded, 1);
    assert_eq!(report.objects.succeeded, 1);
    assert_eq!(report.bytes_freed(), 8);
    assert!(test.archive.metadata(metadata.pk).is_none());
    assert!(test.archive.location(location.pk).is_none());

    let calls = test.archive.calls();
    let first_object_fetch = calls
        .iter()
        .position(|c| c == "find_locations_with_status")
        .unwrap();
    let last_metadata_call = calls
        .iter()
        .rposition(|c| c.contains("metadata"))
        .unwrap();
    assert!(last_metadata_call < first_object_fetch);
}

#[tokio::test]
async fn test_permanent_tier_never_selects_studies() {
    let mut desc = tier("fs1", StorageDuration::Permanent);
    desc.retention_periods = vec![RetentionPeriod {
        days: 1,
        schedule: None,
    }];
    desc.deleter_thresholds = vec![min_usable_space(u64::MAX)];
    desc.no_deletion_constraint = true;
    let test = setup_test_archive(enabled_config(vec![desc.clone()])).await;
    let study = test.add_study_with_objects("1.1", days_ago(400), &["fs1"], 10);
    let queued = test
        .archive
        .add_location(None, "fs1", "orphan", 3, LocationStatus::ToDelete);
    test.tier("fs1").put("orphan", vec![0u8; 3]);

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.objects.succeeded, 1);
    assert!(test.archive.location(queued.pk).is_none());
    assert!(test.archive.study_exists(study.pk));
    assert_eq!(test.archive.count_calls("min_study_access_time"), 0);
    assert_eq!(test.archive.count_calls("find_studies_for_deletion"), 0);
}

#[tokio::test]
async fn test_retention_deletes_only_expired_studies() {
    let mut desc = tier("fs1", StorageDuration::Temporary);
    desc.retention_periods = vec![RetentionPeriod {
        days: 30,
        schedule: None,
    }];
    let test = setup_test_archive(enabled_config(vec![desc.clone()])).await;
    let expired = test.add_study_with_objects("1.1", days_ago(40), &["fs1"], 10);
    let recent = test.add_study_with_objects("1.2", days_ago(10), &["fs1"], 10);

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.studies_evicted, 1);
    assert!(!test.archive.study_exists(expired.pk));
    assert!(test.archive.study_exists(recent.pk));
    assert!(!test.tier("fs1").contains("1.1/fs1"));
    assert!(test.tier("fs1").contains("1.2/fs1"));
    // Records of the expired study are gone, the object queue is drained.
    assert_eq!(test.archive.locations_on("fs1").len(), 1);
    assert_eq!(report.objects.bytes_freed, 10);
}

#[tokio::test]
async fn test_threshold_eviction_stops_once_space_recovered() {
    let mut desc = tier("cache", StorageDuration::Cache);
    desc.deleter_thresholds = vec![min_usable_space(100)];
    let mut config = enabled_config(vec![desc.clone(), tier("fs1", StorageDuration::Permanent)]);
    config.purge.delete_study_batch_size = 1;
    let test = setup_test_archive(config).await;
    test.tier("cache").set_usable_space(40);
    let studies: Vec<_> = (0..6)
        .map(|i| {
            test.add_study_with_objects(&format!("1.{}", i), days_ago(60 - i), &["cache", "fs1"], 20)
        })
        .collect();

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.studies_evicted, 3);
    assert_eq!(report.objects.bytes_freed, 60);
    assert_eq!(test.tier("cache").deleted().len(), 3);
    for (i, study) in studies.iter().enumerate() {
        let on_cache = test
            .archive
            .study_storage_ids(study.pk)
            .unwrap()
            .contains("cache");
        // Oldest first.
        assert_eq!(on_cache, i >= 3, "study {}", i);
        assert!(test.archive.study_exists(study.pk));
    }
    // The surviving copy on fs1 is untouched.
    assert_eq!(test.archive.locations_on("fs1").len(), 6);
}

#[tokio::test]
async fn test_unexported_study_is_deferred_not_evicted() {
    let mut desc = unconstrained_cache("cache");
    desc.export_storage_ids = vec!["nearline".to_string()];
    let mut config = enabled_config(vec![desc.clone(), tier("nearline", StorageDuration::Permanent)]);
    config.purge.preserve_study_interval_secs = Some(3600);
    let test = setup_test_archive(config).await;

    let exported = test.add_study_with_objects("1.1", days_ago(20), &["cache", "nearline"], 10);
    let pending = test.add_study_with_objects("1.2", days_ago(30), &["cache"], 10);
    let verifying = test.archive.add_study("1.3", days_ago(25), &["cache", "nearline"]);
    let series = test.archive.add_series(verifying.pk, "1.3.1");
    let instance = test.archive.add_instance(series);
    test.add_object(instance, "cache", "1.3/cache", 10);
    test.archive.add_location(
        Some(instance),
        "nearline",
        "1.3/nearline",
        10,
        LocationStatus::VerifyAccessState,
    );

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.studies_evicted, 1);
    assert_eq!(report.studies_deferred, 2);
    assert!(!test.tier("cache").contains("1.1/cache"));
    assert!(test.tier("cache").contains("1.2/cache"));
    assert!(test.tier("cache").contains("1.3/cache"));
    assert_eq!(
        test.archive
            .study_storage_ids(exported.pk)
            .unwrap()
            .to_db_value()
            .as_deref(),
        Some("nearline")
    );
    for study in [&pending, &verifying] {
        assert!(test.archive.study_storage_ids(study.pk).unwrap().contains("cache"));
        let bumped = test.archive.study_access_time(study.pk).unwrap();
        assert!(bumped > Utc::now() - Duration::minutes(1));
    }
}

#[tokio::test]
async fn test_purged_series_metadata_decides_export_durability() {
    let mut desc = unconstrained_cache("cache");
    desc.export_storage_ids = vec!["nearline".to_string()];
    let mut config = enabled_config(vec![
        desc.clone(),
        tier("nearline", StorageDuration::Permanent),
        tier("meta", StorageDuration::Permanent),
    ]);
    config.purge.preserve_study_interval_secs = Some(3600);
    let test = setup_test_archive(config).await;

    let exported = test.archive.add_study("2.1", days_ago(20), &["cache", "nearline"]);
    let exported_series = test
        .archive
        .add_purged_series(exported.pk, "2.1.1", "meta", "2.1.1.zip");
    test.tier("meta").put(
        "2.1.1.zip",
        metadata_zip(&[json!({
            "sop_instance_uid": "2.1.1.1",
            "storage_id": "cache",
            "storage_path": "2.1.1.1/cache",
            "size": 12,
            "other_storage": [{
                "storage_id": "nearline",
                "storage_path": "2.1.1.1/nearline",
                "size": 12
            }]
        })]),
    );
    test.tier("cache").put("2.1.1.1/cache", vec![0u8; 12]);
    test.tier("nearline").put("2.1.1.1/nearline", vec![0u8; 12]);

    let unexported = test.archive.add_study("2.2", days_ago(21), &["cache"]);
    test.archive
        .add_purged_series(unexported.pk, "2.2.1", "meta", "2.2.1.zip");
    test.tier("meta").put(
        "2.2.1.zip",
        metadata_zip(&[json!({ "sop_instance_uid": "2.2.1.1", "storage_id": "cache" })]),
    );

    let unreadable = test.archive.add_study("2.3", days_ago(22), &["cache", "nearline"]);
    test.archive
        .add_purged_series(unreadable.pk, "2.3.1", "meta", "2.3.1.zip");
    test.tier("meta").put("2.3.1.zip", b"truncated".to_vec());

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.studies_evicted, 1);
    assert_eq!(report.studies_deferred, 2);
    assert!(!test.archive.study_storage_ids(exported.pk).unwrap().contains("cache"));
    assert!(test.archive.study_storage_ids(unexported.pk).unwrap().contains("cache"));
    assert!(test.archive.study_storage_ids(unreadable.pk).unwrap().contains("cache"));

    // The evicted study's objects came back from its metadata and left the cache.
    assert_eq!(test.archive.series_instances_purged(exported_series), Some(false));
    assert_eq!(test.tier("cache").deleted(), vec!["2.1.1.1/cache".to_string()]);
    assert_eq!(report.objects.bytes_freed, 12);
    assert!(test.tier("nearline").contains("2.1.1.1/nearline"));
    assert_eq!(test.archive.locations_on("nearline").len(), 1);
    assert!(test.archive.locations_on("cache").is_empty());
}

#[tokio::test]
async fn test_purged_series_without_readable_metadata_is_not_evicted() {
    let mut desc = unconstrained_cache("cache");
    desc.export_storage_ids = vec!["nearline".to_string()];
    let mut config = enabled_config(vec![
        desc.clone(),
        tier("nearline", StorageDuration::Permanent),
        tier("meta", StorageDuration::Permanent),
    ]);
    config.purge.preserve_study_interval_secs = Some(3600);
    let test = setup_test_archive(config).await;

    // Exported per its live instance, but one series' metadata has vanished.
    let study = test.add_study_with_objects("2.4", days_ago(20), &["cache", "nearline"], 10);
    let series = test
        .archive
        .add_purged_series(study.pk, "2.4.2", "meta", "2.4.2.zip");

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.studies_evicted, 0);
    assert_eq!(report.studies_deferred, 1);
    assert!(test.tier("cache").contains("2.4/cache"));
    assert!(test.archive.study_storage_ids(study.pk).unwrap().contains("cache"));
    assert_eq!(test.archive.series_instances_purged(series), Some(true));
}

#[tokio::test]
async fn test_threshold_eviction_defers_unexported_study() {
    let mut desc = tier("cache", StorageDuration::Cache);
    desc.deleter_thresholds = vec![min_usable_space(500_000_000)];
    desc.export_storage_ids = vec!["nearline".to_string()];
    let mut config = enabled_config(vec![desc.clone(), tier("nearline", StorageDuration::Permanent)]);
    config.purge.preserve_study_interval_secs = Some(3600);
    let test = setup_test_archive(config).await;
    test.tier("cache").set_usable_space(1_000);
    let study = test.add_study_with_objects("8.1", days_ago(30), &["cache"], 10);

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.studies_evicted, 0);
    assert!(report.studies_deferred >= 1);
    assert!(test.tier("cache").contains("8.1/cache"));
    assert!(test.tier("cache").deleted().is_empty());
    assert!(test.archive.study_storage_ids(study.pk).unwrap().contains("cache"));
    let bumped = test.archive.study_access_time(study.pk).unwrap();
    assert!(bumped > Utc::now() - Duration::minutes(1));
}

#[tokio::test]
async fn test_failed_export_check_defers_only_that_study() {
    let mut desc = unconstrained_cache("cache");
    desc.export_storage_ids = vec!["nearline".to_string()];
    let mut config = enabled_config(vec![desc.clone(), tier("nearline", StorageDuration::Permanent)]);
    config.purge.preserve_study_interval_secs = Some(3600);
    let test = setup_test_archive(config).await;
    let unchecked = test.add_study_with_objects("9.1", days_ago(30), &["cache", "nearline"], 10);
    let exported = test.add_study_with_objects("9.2", days_ago(20), &["cache", "nearline"], 10);
    test.archive.fail_export_check_of(unchecked.pk);

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.studies_evicted, 1);
    assert_eq!(report.studies_deferred, 1);
    assert!(test.tier("cache").contains("9.1/cache"));
    assert!(!test.tier("cache").contains("9.2/cache"));
    assert!(test.archive.study_storage_ids(unchecked.pk).unwrap().contains("cache"));
    assert!(!test.archive.study_storage_ids(exported.pk).unwrap().contains("cache"));
    let bumped = test.archive.study_access_time(unchecked.pk).unwrap();
    assert!(bumped > Utc::now() - Duration::minutes(1));
}

#[tokio::test]
async fn test_sliding_window_bookmark_only_moves_forward() {
    let desc = unconstrained_cache("cache");
    let mut config = enabled_config(vec![desc.clone(), tier("fs1", StorageDuration::Permanent)]);
    config.purge.delete_study_interval_secs = Some(86_400);
    config.purge.preserve_study_interval_secs = Some(3600);
    config.storage_descriptors[0].deleter_min_study_access_time = Some(days_ago(5));
    let test = setup_test_archive(config).await;
    let old = test.add_study_with_objects("3.1", days_ago(10), &["cache", "fs1"], 10);
    let fresh = test.add_study_with_objects("3.2", Utc::now(), &["cache", "fs1"], 10);

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.studies_evicted, 1);
    assert!(!test.archive.study_storage_ids(old.pk).unwrap().contains("cache"));
    assert!(test.archive.study_storage_ids(fresh.pk).unwrap().contains("cache"));

    // The window walked up to the preservation floor and stopped there.
    let bookmark = test.bookmark("cache").unwrap();
    assert!(bookmark >= days_ago(5));
    assert!(bookmark <= Utc::now() - Duration::minutes(59));
    assert!(bookmark >= Utc::now() - Duration::minutes(61));

    // A later scan never moves it back.
    test.scheduler.process(&desc).await.unwrap();
    assert!(test.bookmark("cache").unwrap() >= bookmark);
}

#[tokio::test]
async fn test_bookmark_starts_at_oldest_study() {
    let desc = unconstrained_cache("cache");
    let mut config = enabled_config(vec![desc.clone(), tier("fs1", StorageDuration::Permanent)]);
    config.purge.delete_study_interval_secs = Some(86_400);
    config.purge.preserve_study_interval_secs = Some(3600);
    let test = setup_test_archive(config).await;
    let oldest = days_ago(40);
    test.add_study_with_objects("4.1", oldest, &["cache", "fs1"], 10);

    let mut report = vesalius_purge::PurgeReport::new("cache");
    let evaluator = vesalius_purge::RetentionEvaluator::new(test.ctx(), &desc);
    assert_eq!(evaluator.delete_studies(false, &mut report).await, 1);
    assert_eq!(test.bookmark("cache"), Some(oldest));
}

#[tokio::test]
async fn test_second_scan_claims_nothing() {
    let desc = unconstrained_cache("cache");
    let test = setup_test_archive(enabled_config(vec![
        desc.clone(),
        tier("fs1", StorageDuration::Permanent),
    ]))
    .await;
    for i in 0..3 {
        test.add_study_with_objects(&format!("5.{}", i), days_ago(10 + i), &["cache", "fs1"], 10);
    }

    let first = test.scheduler.process(&desc).await.unwrap();
    assert_eq!(first.studies_evicted, 3);
    assert_eq!(first.objects.succeeded, 3);

    test.archive.clear_calls();
    let second = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(second.studies_evicted, 0);
    assert_eq!(second.objects.total(), 0);
    assert_eq!(test.archive.count_calls("claim_study"), 0);
    assert_eq!(test.archive.count_calls("claim_location"), 0);
    assert_eq!(test.archive.count_calls("claim_metadata"), 0);
}

#[tokio::test]
async fn test_failed_delete_is_left_for_next_cycle() {
    let desc = tier("fs1", StorageDuration::Permanent);
    let test = setup_test_archive(enabled_config(vec![desc.clone()])).await;
    let ok = test
        .archive
        .add_location(None, "fs1", "obj/ok", 5, LocationStatus::ToDelete);
    let broken = test
        .archive
        .add_location(None, "fs1", "obj/broken", 5, LocationStatus::ToDelete);
    test.tier("fs1").put("obj/ok", vec![0u8; 5]);
    test.tier("fs1").put("obj/broken", vec![0u8; 5]);
    test.tier("fs1").fail_deletes_of("obj/broken");

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.objects.succeeded, 1);
    assert_eq!(report.objects.failed, 1);
    assert!(test.archive.location(ok.pk).is_none());
    assert_eq!(
        test.archive.location(broken.pk).unwrap().status,
        LocationStatus::ToDelete
    );
    assert!(test.tier("fs1").contains("obj/broken"));
}

#[tokio::test]
async fn test_tar_tier_deletes_shared_archive_once() {
    let mut desc = tier("tar1", StorageDuration::Permanent);
    desc.archive_series_as_tar = true;
    let test = setup_test_archive(enabled_config(vec![desc.clone()])).await;
    test.tier("tar1").put("2026/s1.tar", vec![0u8; 64]);
    let a = test
        .archive
        .add_location(None, "tar1", "2026/s1.tar!1", 30, LocationStatus::ToDelete);
    let b = test
        .archive
        .add_location(None, "tar1", "2026/s1.tar!2", 34, LocationStatus::ToDelete);

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.objects.succeeded, 2);
    assert_eq!(test.tier("tar1").deleted(), vec!["2026/s1.tar".to_string()]);
    assert!(test.archive.location(a.pk).is_none());
    assert!(test.archive.location(b.pk).is_none());
}

#[tokio::test]
async fn test_disabled_purge_stops_scan() {
    let desc = unconstrained_cache("cache");
    let test = setup_test_archive(enabled_config(vec![
        desc.clone(),
        tier("fs1", StorageDuration::Permanent),
    ]))
    .await;
    let study = test.add_study_with_objects("6.1", days_ago(10), &["cache", "fs1"], 10);
    let queued = test
        .archive
        .add_location(None, "cache", "queued", 4, LocationStatus::ToDelete);
    test.config
        .update(|c| c.purge.purge_polling_interval_secs = None);

    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.objects.total(), 0);
    assert_eq!(report.studies_evicted, 0);
    assert!(test.archive.location(queued.pk).is_some());
    assert!(test.archive.study_storage_ids(study.pk).unwrap().contains("cache"));
}

#[tokio::test]
async fn test_stop_request_ends_scan_before_next_batch() {
    let desc = unconstrained_cache("cache");
    let test = setup_test_archive(enabled_config(vec![
        desc.clone(),
        tier("fs1", StorageDuration::Permanent),
    ]))
    .await;
    let study = test.add_study_with_objects("7.1", days_ago(10), &["cache", "fs1"], 10);

    test.ctx().request_stop();
    let report = test.scheduler.process(&desc).await.unwrap();

    assert_eq!(report.studies_evicted, 0);
    assert!(test.archive.study_storage_ids(study.pk).unwrap().contains("cache"));
}
