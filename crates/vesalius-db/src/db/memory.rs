//! In-process archive implementing [`PurgeRepository`]
//!
//! Mirrors the Postgres semantics closely enough to drive the purge engine in tests and
//! dry runs. All state sits behind one lock, so every claim is atomic. Each trait call
//! is appended to a journal that tests use to assert call order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use vesalius_core::{
    AppError, ClaimOutcome, Location, LocationStatus, Metadata, MetadataStatus, PurgedSeries,
    RestoredInstance, StorageIds, StudyRef,
};

use super::purge::PurgeRepository;

#[derive(Debug, Clone)]
struct StudyRecord {
    uid: String,
    access_time: DateTime<Utc>,
    storage_ids: StorageIds,
}

#[derive(Debug, Clone)]
struct SeriesRecord {
    study_pk: i64,
    uid: String,
    metadata_pk: Option<i64>,
    instances_purged: bool,
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    series_pk: i64,
}

#[derive(Debug, Clone)]
struct LocationRecord {
    instance_pk: Option<i64>,
    location: Location,
}

#[derive(Default)]
struct State {
    next_pk: i64,
    studies: BTreeMap<i64, StudyRecord>,
    series: BTreeMap<i64, SeriesRecord>,
    instances: BTreeMap<i64, InstanceRecord>,
    locations: BTreeMap<i64, LocationRecord>,
    metadata: BTreeMap<i64, Metadata>,
    journal: Vec<String>,
    failing_marks: HashSet<i64>,
    failing_export_checks: HashSet<i64>,
    failing_removes: HashSet<String>,
}

impl State {
    fn next_pk(&mut self) -> i64 {
        self.next_pk += 1;
        self.next_pk
    }

    fn instance_pks_of_study(&self, study_pk: i64) -> Vec<i64> {
        self.instances
            .iter()
            .filter(|(_, i)| {
                self.series
                    .get(&i.series_pk)
                    .is_some_and(|s| s.study_pk == study_pk)
            })
            .map(|(pk, _)| *pk)
            .collect()
    }

    fn locations_of_study(&self, study_pk: i64) -> impl Iterator<Item = &LocationRecord> {
        let instances: HashSet<i64> = self.instance_pks_of_study(study_pk).into_iter().collect();
        self.locations
            .values()
            .filter(move |l| l.instance_pk.is_some_and(|pk| instances.contains(&pk)))
    }

    fn record(&mut self, call: &str) {
        self.journal.push(call.to_string());
    }
}

/// In-memory archive records.
#[derive(Default)]
pub struct InMemoryArchive {
    state: Mutex<State>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_study(
        &self,
        uid: &str,
        access_time: DateTime<Utc>,
        storage_ids: &[&str],
    ) -> StudyRef {
        let mut state = self.state();
        let pk = state.next_pk();
        state.studies.insert(
            pk,
            StudyRecord {
                uid: uid.to_string(),
                access_time,
                storage_ids: StorageIds::new(storage_ids.iter().copied()),
            },
        );
        StudyRef::new(pk, uid)
    }

    pub fn add_series(&self, study_pk: i64, uid: &str) -> i64 {
        let mut state = self.state();
        let pk = state.next_pk();
        state.series.insert(
            pk,
            SeriesRecord {
                study_pk,
                uid: uid.to_string(),
                metadata_pk: None,
                instances_purged: false,
            },
        );
        pk
    }

    /// A series whose instance records were purged into a metadata archive stored at
    /// `storage_path` on `storage_id`.
    pub fn add_purged_series(
        &self,
        study_pk: i64,
        uid: &str,
        storage_id: &str,
        storage_path: &str,
    ) -> i64 {
        let metadata = self.add_metadata(storage_id, storage_path, MetadataStatus::Ok);
        let mut state = self.state();
        let pk = state.next_pk();
        state.series.insert(
            pk,
            SeriesRecord {
                study_pk,
                uid: uid.to_string(),
                metadata_pk: Some(metadata.pk),
                instances_purged: true,
            },
        );
        pk
    }

    pub fn add_instance(&self, series_pk: i64) -> i64 {
        let mut state = self.state();
        let pk = state.next_pk();
        state.instances.insert(pk, InstanceRecord { series_pk });
        pk
    }

    pub fn add_location(
        &self,
        instance_pk: Option<i64>,
        storage_id: &str,
        storage_path: &str,
        size: u64,
        status: LocationStatus,
    ) -> Location {
        let mut state = self.state();
        let pk = state.next_pk();
        let location = Location {
            pk,
            storage_id: storage_id.to_string(),
            storage_path: storage_path.to_string(),
            size,
            status,
            multi_ref: None,
        };
        state.locations.insert(
            pk,
            LocationRecord {
                instance_pk,
                location: location.clone(),
            },
        );
        location
    }

    pub fn add_metadata(
        &self,
        storage_id: &str,
        storage_path: &str,
        status: MetadataStatus,
    ) -> Metadata {
        let mut state = self.state();
        let pk = state.next_pk();
        let metadata = Metadata {
            pk,
            storage_id: storage_id.to_string(),
            storage_path: storage_path.to_string(),
            status,
        };
        state.metadata.insert(pk, metadata.clone());
        metadata
    }

    /// Make `mark_objects_of_study_for_deletion` fail for this study.
    pub fn fail_marking_objects_of(&self, study_pk: i64) {
        self.state().failing_marks.insert(study_pk);
    }

    /// Make `instances_not_stored_on_export_storage` fail for this study.
    pub fn fail_export_check_of(&self, study_pk: i64) {
        self.state().failing_export_checks.insert(study_pk);
    }

    /// Make the next `remove_location` of this storage path fail once.
    pub fn fail_next_remove_of(&self, storage_path: &str) {
        self.state().failing_removes.insert(storage_path.to_string());
    }

    pub fn location(&self, pk: i64) -> Option<Location> {
        self.state().locations.get(&pk).map(|l| l.location.clone())
    }

    pub fn locations_on(&self, storage_id: &str) -> Vec<Location> {
        self.state()
            .locations
            .values()
            .filter(|l| l.location.storage_id == storage_id)
            .map(|l| l.location.clone())
            .collect()
    }

    pub fn metadata(&self, pk: i64) -> Option<Metadata> {
        self.state().metadata.get(&pk).cloned()
    }

    pub fn series_instances_purged(&self, series_pk: i64) -> Option<bool> {
        self.state().series.get(&series_pk).map(|s| s.instances_purged)
    }

    pub fn study_exists(&self, study_pk: i64) -> bool {
        self.state().studies.contains_key(&study_pk)
    }

    pub fn study_storage_ids(&self, study_pk: i64) -> Option<StorageIds> {
        self.state()
            .studies
            .get(&study_pk)
            .map(|s| s.storage_ids.clone())
    }

    pub fn study_access_time(&self, study_pk: i64) -> Option<DateTime<Utc>> {
        self.state().studies.get(&study_pk).map(|s| s.access_time)
    }

    /// Names of the repository calls made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.state().journal.iter().filter(|c| *c == name).count()
    }

    pub fn clear_calls(&self) {
        self.state().journal.clear();
    }
}

#[async_trait]
impl PurgeRepository for InMemoryArchive {
    async fn find_metadata_with_status(
        &self,
        storage_id: &str,
        status: MetadataStatus,
        limit: usize,
    ) -> Result<Vec<Metadata>, AppError> {
        let mut state = self.state();
        state.record("find_metadata_with_status");
        Ok(state
            .metadata
            .values()
            .filter(|m| m.storage_id == storage_id && m.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_metadata(&self, metadata: &Metadata) -> Result<ClaimOutcome, AppError> {
        let mut state = self.state();
        state.record("claim_metadata");
        Ok(match state.metadata.get_mut(&metadata.pk) {
            None => ClaimOutcome::NotFound,
            Some(m) if m.status == MetadataStatus::ToDelete => {
                m.status = MetadataStatus::Deleting;
                ClaimOutcome::Claimed(())
            }
            Some(_) => ClaimOutcome::AlreadyClaimed,
        })
    }

    async fn release_metadata(&self, metadata: &Metadata) -> Result<(), AppError> {
        let mut state = self.state();
        state.record("release_metadata");
        if let Some(m) = state.metadata.get_mut(&metadata.pk) {
            if m.status == MetadataStatus::Deleting {
                m.status = MetadataStatus::ToDelete;
            }
        }
        Ok(())
    }

    async fn remove_metadata(&self, metadata: &Metadata) -> Result<(), AppError> {
        let mut state = self.state();
        state.record("remove_metadata");
        state.metadata.remove(&metadata.pk);
        for series in state.series.values_mut() {
            if series.metadata_pk == Some(metadata.pk) {
                series.metadata_pk = None;
            }
        }
        Ok(())
    }

    async fn find_locations_with_status(
        &self,
        storage_id: &str,
        status: LocationStatus,
        limit: usize,
    ) -> Result<Vec<Location>, AppError> {
        let mut state = self.state();
        state.record("find_locations_with_status");
        Ok(state
            .locations
            .values()
            .map(|l| &l.location)
            .filter(|l| l.storage_id == storage_id && l.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_location(&self, location: &Location) -> Result<ClaimOutcome, AppError> {
        let mut state = self.state();
        state.record("claim_location");
        Ok(match state.locations.get_mut(&location.pk) {
            None => ClaimOutcome::NotFound,
            Some(l) if l.location.status == LocationStatus::ToDelete => {
                l.location.status = LocationStatus::Deleting;
                ClaimOutcome::Claimed(())
            }
            Some(_) => ClaimOutcome::AlreadyClaimed,
        })
    }

    async fn release_location(&self, location: &Location) -> Result<(), AppError> {
        let mut state = self.state();
        state.record("release_location");
        if let Some(l) = state.locations.get_mut(&location.pk) {
            if l.location.status == LocationStatus::Deleting {
                l.location.status = LocationStatus::ToDelete;
            }
        }
        Ok(())
    }

    async fn remove_location(&self, location: &Location) -> Result<(), AppError> {
        let mut state = self.state();
        state.record("remove_location");
        if state.failing_removes.remove(&location.storage_path) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        state.locations.remove(&location.pk);
        Ok(())
    }

    async fn min_study_access_time(
        &self,
        storage_id: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let mut state = self.state();
        state.record("min_study_access_time");
        Ok(state
            .studies
            .values()
            .filter(|s| s.storage_ids.contains(storage_id))
            .filter(|s| before.map_or(true, |b| s.access_time < b))
            .map(|s| s.access_time)
            .min())
    }

    async fn find_studies_for_deletion(
        &self,
        storage_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StudyRef>, AppError> {
        let mut state = self.state();
        state.record("find_studies_for_deletion");
        let mut candidates: Vec<(DateTime<Utc>, i64, String)> = state
            .studies
            .iter()
            .filter(|(_, s)| s.storage_ids.contains(storage_id))
            .filter(|(_, s)| before.map_or(true, |b| s.access_time < b))
            .map(|(pk, s)| (s.access_time, *pk, s.uid.clone()))
            .collect();
        candidates.sort();
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, pk, uid)| StudyRef::new(pk, uid))
            .collect())
    }

    async fn update_study_access_time(&self, study_pk: i64) -> Result<(), AppError> {
        let mut state = self.state();
        state.record("update_study_access_time");
        if let Some(study) = state.studies.get_mut(&study_pk) {
            study.access_time = Utc::now();
        }
        Ok(())
    }

    async fn instances_not_stored_on_export_storage(
        &self,
        study_pk: i64,
        storage_id: &str,
        export_storage_ids: &[String],
    ) -> Result<u64, AppError> {
        let mut state = self.state();
        state.record("instances_not_stored_on_export_storage");
        if state.failing_export_checks.contains(&study_pk) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        let locations: Vec<&LocationRecord> = state.locations_of_study(study_pk).collect();
        let on_tier: HashSet<i64> = locations
            .iter()
            .filter(|l| l.location.storage_id == storage_id)
            .filter_map(|l| l.instance_pk)
            .collect();
        let exported: HashSet<i64> = locations
            .iter()
            .filter(|l| {
                export_storage_ids.contains(&l.location.storage_id)
                    && l.location.status == LocationStatus::Ok
            })
            .filter_map(|l| l.instance_pk)
            .collect();
        Ok(on_tier.difference(&exported).count() as u64)
    }

    async fn find_series_with_purged_instances(
        &self,
        study_pk: i64,
    ) -> Result<Vec<PurgedSeries>, AppError> {
        let mut state = self.state();
        state.record("find_series_with_purged_instances");
        Ok(state
            .series
            .iter()
            .filter(|(_, s)| s.study_pk == study_pk && s.instances_purged)
            .filter_map(|(pk, s)| {
                let metadata = state.metadata.get(&s.metadata_pk?)?;
                Some(PurgedSeries {
                    series_pk: *pk,
                    series_uid: s.uid.clone(),
                    metadata_storage_id: metadata.storage_id.clone(),
                    metadata_storage_path: metadata.storage_path.clone(),
                })
            })
            .collect())
    }

    async fn restore_instances(
        &self,
        series_pk: i64,
        instances: &[RestoredInstance],
    ) -> Result<usize, AppError> {
        let mut state = self.state();
        state.record("restore_instances");
        match state.series.get_mut(&series_pk) {
            Some(series) if series.instances_purged => series.instances_purged = false,
            _ => return Ok(0),
        }
        for instance in instances {
            let instance_pk = state.next_pk();
            state.instances.insert(instance_pk, InstanceRecord { series_pk });
            for placement in &instance.placements {
                let pk = state.next_pk();
                state.locations.insert(
                    pk,
                    LocationRecord {
                        instance_pk: Some(instance_pk),
                        location: Location {
                            pk,
                            storage_id: placement.storage_id.clone(),
                            storage_path: placement.storage_path.clone(),
                            size: placement.size,
                            status: placement.status,
                            multi_ref: None,
                        },
                    },
                );
            }
        }
        Ok(instances.len())
    }

    async fn claim_study(
        &self,
        study: &StudyRef,
        storage_id: &str,
        storage_ids: &[String],
    ) -> Result<ClaimOutcome<StorageIds>, AppError> {
        let mut state = self.state();
        state.record("claim_study");
        Ok(match state.studies.get_mut(&study.pk) {
            None => ClaimOutcome::NotFound,
            Some(s) if !s.storage_ids.contains(storage_id) => ClaimOutcome::AlreadyClaimed,
            Some(s) => {
                let previous = s.storage_ids.clone();
                s.storage_ids = previous.without(storage_ids);
                ClaimOutcome::Claimed(previous)
            }
        })
    }

    async fn mark_objects_of_study_for_deletion(
        &self,
        study_pk: i64,
        storage_ids: &[String],
    ) -> Result<u64, AppError> {
        let mut state = self.state();
        state.record("mark_objects_of_study_for_deletion");
        if state.failing_marks.contains(&study_pk) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        let instances: HashSet<i64> = state.instance_pks_of_study(study_pk).into_iter().collect();
        let mut marked = 0;
        for record in state.locations.values_mut() {
            if record.instance_pk.is_some_and(|pk| instances.contains(&pk))
                && storage_ids.contains(&record.location.storage_id)
                && record.location.status == LocationStatus::Ok
            {
                record.location.status = LocationStatus::ToDelete;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn has_objects_on_storage(
        &self,
        study_pk: i64,
        storage_id: &str,
    ) -> Result<bool, AppError> {
        let mut state = self.state();
        state.record("has_objects_on_storage");
        let found = state.locations_of_study(study_pk).any(|l| {
            l.location.storage_id == storage_id && !l.location.status.is_pending_deletion()
        });
        Ok(found)
    }

    async fn set_study_storage_ids(
        &self,
        study_pk: i64,
        storage_ids: &StorageIds,
    ) -> Result<(), AppError> {
        let mut state = self.state();
        state.record("set_study_storage_ids");
        if let Some(study) = state.studies.get_mut(&study_pk) {
            study.storage_ids = storage_ids.clone();
        }
        Ok(())
    }

    async fn delete_study_chunk(&self, study_pk: i64, limit: usize) -> Result<usize, AppError> {
        let mut state = self.state();
        state.record("delete_study_chunk");
        let chunk: Vec<i64> = state
            .instance_pks_of_study(study_pk)
            .into_iter()
            .take(limit)
            .collect();

        if !chunk.is_empty() {
            for record in state.locations.values_mut() {
                if record.instance_pk.is_some_and(|pk| chunk.contains(&pk)) {
                    record.instance_pk = None;
                    if record.location.status != LocationStatus::Deleting {
                        record.location.status = LocationStatus::ToDelete;
                    }
                }
            }
            for pk in &chunk {
                state.instances.remove(pk);
            }
            return Ok(chunk.len());
        }

        let series_pks: Vec<i64> = state
            .series
            .iter()
            .filter(|(_, s)| s.study_pk == study_pk)
            .map(|(pk, _)| *pk)
            .collect();
        for pk in series_pks {
            if let Some(series) = state.series.remove(&pk) {
                if let Some(metadata) = series
                    .metadata_pk
                    .and_then(|m| state.metadata.get_mut(&m))
                {
                    metadata.status = MetadataStatus::ToDelete;
                }
            }
        }
        state.studies.remove(&study_pk);
        Ok(0)
    }

    async fn study_pk_by_uid(&self, study_uid: &str) -> Result<Option<i64>, AppError> {
        let mut state = self.state();
        state.record("study_pk_by_uid");
        Ok(state
            .studies
            .iter()
            .find(|(_, s)| s.uid == study_uid)
            .map(|(pk, _)| *pk))
    }
}
