//! Purge repository: claims, queries and record removal for the storage lifecycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use vesalius_core::{
    AppError, ClaimOutcome, Location, LocationStatus, Metadata, MetadataStatus, PurgedSeries,
    RestoredInstance, StorageIds, StudyRef,
};

/// Persistence operations the purge engine depends on.
///
/// Every `claim_*` method is a single atomic conditional update. `Claimed` grants the
/// caller the exclusive right to delete the claimed bytes; the other outcomes mean a
/// concurrent worker got there first and are not errors.
#[async_trait]
pub trait PurgeRepository: Send + Sync {
    /// Metadata blobs on `storage_id` with `status`, oldest record first.
    async fn find_metadata_with_status(
        &self,
        storage_id: &str,
        status: MetadataStatus,
        limit: usize,
    ) -> Result<Vec<Metadata>, AppError>;

    /// `TO_DELETE -> DELETING`.
    async fn claim_metadata(&self, metadata: &Metadata) -> Result<ClaimOutcome, AppError>;

    /// `DELETING -> TO_DELETE`, after a failed physical delete.
    async fn release_metadata(&self, metadata: &Metadata) -> Result<(), AppError>;

    async fn remove_metadata(&self, metadata: &Metadata) -> Result<(), AppError>;

    /// Object placements on `storage_id` with `status`, oldest record first.
    async fn find_locations_with_status(
        &self,
        storage_id: &str,
        status: LocationStatus,
        limit: usize,
    ) -> Result<Vec<Location>, AppError>;

    /// `TO_DELETE -> DELETING`.
    async fn claim_location(&self, location: &Location) -> Result<ClaimOutcome, AppError>;

    /// `DELETING -> TO_DELETE`, after a failed physical delete.
    async fn release_location(&self, location: &Location) -> Result<(), AppError>;

    async fn remove_location(&self, location: &Location) -> Result<(), AppError>;

    /// Oldest access time of the studies assigned to `storage_id`, optionally only
    /// among those accessed before `before`.
    async fn min_study_access_time(
        &self,
        storage_id: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, AppError>;

    /// Studies assigned to `storage_id` and accessed before `before`, in increasing
    /// order of access time.
    async fn find_studies_for_deletion(
        &self,
        storage_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StudyRef>, AppError>;

    /// Bump the study's access time to now, deferring it in the eviction order.
    async fn update_study_access_time(&self, study_pk: i64) -> Result<(), AppError>;

    /// Instances of the study placed on `storage_id` without an `OK` placement on any
    /// of `export_storage_ids`.
    async fn instances_not_stored_on_export_storage(
        &self,
        study_pk: i64,
        storage_id: &str,
        export_storage_ids: &[String],
    ) -> Result<u64, AppError>;

    /// Series of the study whose instance records were purged into their metadata
    /// archive.
    async fn find_series_with_purged_instances(
        &self,
        study_pk: i64,
    ) -> Result<Vec<PurgedSeries>, AppError>;

    /// Recreate the instance and location records of a purged series from its metadata
    /// archive and flag the series as no longer purged. Returns the number of instances
    /// restored; zero when another worker restored the series first.
    async fn restore_instances(
        &self,
        series_pk: i64,
        instances: &[RestoredInstance],
    ) -> Result<usize, AppError>;

    /// Drop `storage_ids` from the study's assignment with a compare-and-swap.
    ///
    /// Returns the previous assignment on success. A study not assigned to
    /// `storage_id` any more counts as already claimed.
    async fn claim_study(
        &self,
        study: &StudyRef,
        storage_id: &str,
        storage_ids: &[String],
    ) -> Result<ClaimOutcome<StorageIds>, AppError>;

    /// Mark the study's `OK` placements on `storage_ids` as `TO_DELETE`. Returns the
    /// number of placements marked.
    async fn mark_objects_of_study_for_deletion(
        &self,
        study_pk: i64,
        storage_ids: &[String],
    ) -> Result<u64, AppError>;

    /// Whether any placement of the study on `storage_id` is not yet queued for deletion.
    async fn has_objects_on_storage(&self, study_pk: i64, storage_id: &str)
        -> Result<bool, AppError>;

    async fn set_study_storage_ids(
        &self,
        study_pk: i64,
        storage_ids: &StorageIds,
    ) -> Result<(), AppError>;

    /// Delete up to `limit` instance records of the study, queueing their placements for
    /// deletion. Once no instance is left, queues the series metadata and removes the
    /// series and study rows. Returns the number of instance records deleted; zero
    /// means the study is gone.
    async fn delete_study_chunk(&self, study_pk: i64, limit: usize) -> Result<usize, AppError>;

    async fn study_pk_by_uid(&self, study_uid: &str) -> Result<Option<i64>, AppError>;
}

/// Row type for the location table (for FromRow).
#[derive(Debug, sqlx::FromRow)]
pub struct LocationRow {
    pub pk: i64,
    pub storage_id: String,
    pub storage_path: String,
    pub object_size: i64,
    pub status: String,
    pub multi_ref: Option<i32>,
}

impl LocationRow {
    pub fn to_location(self) -> Result<Location, AppError> {
        let status = self
            .status
            .parse::<LocationStatus>()
            .map_err(|e| AppError::InvalidData(e.to_string()))?;
        Ok(Location {
            pk: self.pk,
            storage_id: self.storage_id,
            storage_path: self.storage_path,
            size: u64::try_from(self.object_size).unwrap_or(0),
            status,
            multi_ref: self.multi_ref,
        })
    }
}

/// Row type for the metadata table (for FromRow).
#[derive(Debug, sqlx::FromRow)]
pub struct MetadataRow {
    pub pk: i64,
    pub storage_id: String,
    pub storage_path: String,
    pub status: String,
}

impl MetadataRow {
    pub fn to_metadata(self) -> Result<Metadata, AppError> {
        let status = self
            .status
            .parse::<MetadataStatus>()
            .map_err(|e| AppError::InvalidData(e.to_string()))?;
        Ok(Metadata {
            pk: self.pk,
            storage_id: self.storage_id,
            storage_path: self.storage_path,
            status,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StudyRow {
    pk: i64,
    study_iuid: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PurgedSeriesRow {
    pk: i64,
    series_iuid: String,
    storage_id: String,
    storage_path: String,
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Postgres implementation of [`PurgeRepository`].
#[derive(Clone)]
pub struct PgPurgeRepository {
    pool: PgPool,
}

impl PgPurgeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, table: &'static str, pk: i64) -> Result<bool, AppError> {
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {} WHERE pk = $1)", table);
        let exists: bool = sqlx::query_scalar::<Postgres, bool>(&sql)
            .bind(pk)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl PurgeRepository for PgPurgeRepository {
    #[tracing::instrument(skip(self), fields(db.table = "metadata"))]
    async fn find_metadata_with_status(
        &self,
        storage_id: &str,
        status: MetadataStatus,
        limit: usize,
    ) -> Result<Vec<Metadata>, AppError> {
        let rows: Vec<MetadataRow> = sqlx::query_as::<Postgres, MetadataRow>(
            r#"
            SELECT pk, storage_id, storage_path, status
            FROM metadata
            WHERE storage_id = $1 AND status = $2
            ORDER BY pk
            LIMIT $3
            "#,
        )
        .bind(storage_id)
        .bind(status.as_str())
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MetadataRow::to_metadata).collect()
    }

    #[tracing::instrument(skip(self, metadata), fields(db.table = "metadata", db.record_id = metadata.pk))]
    async fn claim_metadata(&self, metadata: &Metadata) -> Result<ClaimOutcome, AppError> {
        let result = sqlx::query("UPDATE metadata SET status = $2 WHERE pk = $1 AND status = $3")
            .bind(metadata.pk)
            .bind(MetadataStatus::Deleting.as_str())
            .bind(MetadataStatus::ToDelete.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            Ok(ClaimOutcome::Claimed(()))
        } else if self.exists("metadata", metadata.pk).await? {
            Ok(ClaimOutcome::AlreadyClaimed)
        } else {
            Ok(ClaimOutcome::NotFound)
        }
    }

    #[tracing::instrument(skip(self, metadata), fields(db.table = "metadata", db.record_id = metadata.pk))]
    async fn release_metadata(&self, metadata: &Metadata) -> Result<(), AppError> {
        sqlx::query("UPDATE metadata SET status = $2 WHERE pk = $1 AND status = $3")
            .bind(metadata.pk)
            .bind(MetadataStatus::ToDelete.as_str())
            .bind(MetadataStatus::Deleting.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, metadata), fields(db.table = "metadata", db.record_id = metadata.pk))]
    async fn remove_metadata(&self, metadata: &Metadata) -> Result<(), AppError> {
        sqlx::query("DELETE FROM metadata WHERE pk = $1")
            .bind(metadata.pk)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "location"))]
    async fn find_locations_with_status(
        &self,
        storage_id: &str,
        status: LocationStatus,
        limit: usize,
    ) -> Result<Vec<Location>, AppError> {
        let rows: Vec<LocationRow> = sqlx::query_as::<Postgres, LocationRow>(
            r#"
            SELECT pk, storage_id, storage_path, object_size, status, multi_ref
            FROM location
            WHERE storage_id = $1 AND status = $2
            ORDER BY pk
            LIMIT $3
            "#,
        )
        .bind(storage_id)
        .bind(status.as_str())
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LocationRow::to_location).collect()
    }

    #[tracing::instrument(skip(self, location), fields(db.table = "location", db.record_id = location.pk))]
    async fn claim_location(&self, location: &Location) -> Result<ClaimOutcome, AppError> {
        let result = sqlx::query("UPDATE location SET status = $2 WHERE pk = $1 AND status = $3")
            .bind(location.pk)
            .bind(LocationStatus::Deleting.as_str())
            .bind(LocationStatus::ToDelete.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            Ok(ClaimOutcome::Claimed(()))
        } else if self.exists("location", location.pk).await? {
            Ok(ClaimOutcome::AlreadyClaimed)
        } else {
            Ok(ClaimOutcome::NotFound)
        }
    }

    #[tracing::instrument(skip(self, location), fields(db.table = "location", db.record_id = location.pk))]
    async fn release_location(&self, location: &Location) -> Result<(), AppError> {
        sqlx::query("UPDATE location SET status = $2 WHERE pk = $1 AND status = $3")
            .bind(location.pk)
            .bind(LocationStatus::ToDelete.as_str())
            .bind(LocationStatus::Deleting.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, location), fields(db.table = "location", db.record_id = location.pk))]
    async fn remove_location(&self, location: &Location) -> Result<(), AppError> {
        sqlx::query("DELETE FROM location WHERE pk = $1")
            .bind(location.pk)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "study"))]
    async fn min_study_access_time(
        &self,
        storage_id: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let min: Option<DateTime<Utc>> = sqlx::query_scalar::<Postgres, Option<DateTime<Utc>>>(
            r#"
            SELECT MIN(access_time)
            FROM study
            WHERE $1 = ANY(string_to_array(storage_ids, E'\\'))
              AND ($2::timestamptz IS NULL OR access_time < $2)
            "#,
        )
        .bind(storage_id)
        .bind(before)
        .fetch_one(&self.pool)
        .await?;
        Ok(min)
    }

    #[tracing::instrument(skip(self), fields(db.table = "study"))]
    async fn find_studies_for_deletion(
        &self,
        storage_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<StudyRef>, AppError> {
        let rows: Vec<StudyRow> = sqlx::query_as::<Postgres, StudyRow>(
            r#"
            SELECT pk, study_iuid
            FROM study
            WHERE $1 = ANY(string_to_array(storage_ids, E'\\'))
              AND ($2::timestamptz IS NULL OR access_time < $2)
            ORDER BY access_time ASC, pk ASC
            LIMIT $3
            "#,
        )
        .bind(storage_id)
        .bind(before)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StudyRef::new(r.pk, r.study_iuid))
            .collect())
    }

    #[tracing::instrument(skip(self), fields(db.table = "study", db.record_id = study_pk))]
    async fn update_study_access_time(&self, study_pk: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE study SET access_time = NOW() WHERE pk = $1")
            .bind(study_pk)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "location", db.record_id = study_pk))]
    async fn instances_not_stored_on_export_storage(
        &self,
        study_pk: i64,
        storage_id: &str,
        export_storage_ids: &[String],
    ) -> Result<u64, AppError> {
        let count: i64 = sqlx::query_scalar::<Postgres, i64>(
            r#"
            SELECT COUNT(DISTINCT i.pk)
            FROM instance i
            JOIN series se ON i.series_fk = se.pk
            JOIN location l ON l.instance_fk = i.pk
            WHERE se.study_fk = $1
              AND l.storage_id = $2
              AND NOT EXISTS (
                  SELECT 1 FROM location e
                  WHERE e.instance_fk = i.pk
                    AND e.storage_id = ANY($3)
                    AND e.status = 'OK'
              )
            "#,
        )
        .bind(study_pk)
        .bind(storage_id)
        .bind(export_storage_ids)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    #[tracing::instrument(skip(self), fields(db.table = "series", db.record_id = study_pk))]
    async fn find_series_with_purged_instances(
        &self,
        study_pk: i64,
    ) -> Result<Vec<PurgedSeries>, AppError> {
        let rows: Vec<PurgedSeriesRow> = sqlx::query_as::<Postgres, PurgedSeriesRow>(
            r#"
            SELECT se.pk, se.series_iuid, m.storage_id, m.storage_path
            FROM series se
            JOIN metadata m ON se.metadata_fk = m.pk
            WHERE se.study_fk = $1 AND se.instance_purge_state = 1
            ORDER BY se.pk
            "#,
        )
        .bind(study_pk)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| PurgedSeries {
                series_pk: r.pk,
                series_uid: r.series_iuid,
                metadata_storage_id: r.storage_id,
                metadata_storage_path: r.storage_path,
            })
            .collect())
    }

    #[tracing::instrument(skip(self, instances), fields(db.table = "series", db.record_id = series_pk))]
    async fn restore_instances(
        &self,
        series_pk: i64,
        instances: &[RestoredInstance],
    ) -> Result<usize, AppError> {
        let mut tx = self.pool.begin().await?;

        let purge_state: Option<i32> = sqlx::query_scalar::<Postgres, i32>(
            "SELECT instance_purge_state FROM series WHERE pk = $1 FOR UPDATE",
        )
        .bind(series_pk)
        .fetch_optional(&mut *tx)
        .await?;
        if purge_state != Some(1) {
            return Ok(0);
        }

        for instance in instances {
            let instance_pk: i64 = sqlx::query_scalar::<Postgres, i64>(
                "INSERT INTO instance (series_fk, sop_iuid) VALUES ($1, $2) RETURNING pk",
            )
            .bind(series_pk)
            .bind(&instance.sop_instance_uid)
            .fetch_one(&mut *tx)
            .await?;

            for placement in &instance.placements {
                sqlx::query(
                    r#"
                    INSERT INTO location (instance_fk, storage_id, storage_path, object_size, status)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(instance_pk)
                .bind(&placement.storage_id)
                .bind(&placement.storage_path)
                .bind(i64::try_from(placement.size).unwrap_or(i64::MAX))
                .bind(placement.status.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE series SET instance_purge_state = 0 WHERE pk = $1")
            .bind(series_pk)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(instances.len())
    }

    #[tracing::instrument(skip(self, study), fields(db.table = "study", db.record_id = study.pk))]
    async fn claim_study(
        &self,
        study: &StudyRef,
        storage_id: &str,
        storage_ids: &[String],
    ) -> Result<ClaimOutcome<StorageIds>, AppError> {
        let current: Option<Option<String>> =
            sqlx::query_scalar::<Postgres, Option<String>>("SELECT storage_ids FROM study WHERE pk = $1")
                .bind(study.pk)
                .fetch_optional(&self.pool)
                .await?;

        let Some(raw) = current else {
            return Ok(ClaimOutcome::NotFound);
        };
        let previous = StorageIds::parse(raw.as_deref());
        if !previous.contains(storage_id) {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        let remaining = previous.without(storage_ids);

        let result = sqlx::query(
            "UPDATE study SET storage_ids = $2 WHERE pk = $1 AND storage_ids IS NOT DISTINCT FROM $3",
        )
        .bind(study.pk)
        .bind(remaining.to_db_value())
        .bind(raw)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(ClaimOutcome::Claimed(previous))
        } else {
            Ok(ClaimOutcome::AlreadyClaimed)
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "location", db.record_id = study_pk))]
    async fn mark_objects_of_study_for_deletion(
        &self,
        study_pk: i64,
        storage_ids: &[String],
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE location SET status = 'TO_DELETE'
            WHERE status = 'OK'
              AND storage_id = ANY($2)
              AND instance_fk IN (
                  SELECT i.pk FROM instance i
                  JOIN series se ON i.series_fk = se.pk
                  WHERE se.study_fk = $1
              )
            "#,
        )
        .bind(study_pk)
        .bind(storage_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self), fields(db.table = "location", db.record_id = study_pk))]
    async fn has_objects_on_storage(
        &self,
        study_pk: i64,
        storage_id: &str,
    ) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar::<Postgres, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM location l
                JOIN instance i ON l.instance_fk = i.pk
                JOIN series se ON i.series_fk = se.pk
                WHERE se.study_fk = $1
                  AND l.storage_id = $2
                  AND l.status NOT IN ('TO_DELETE', 'DELETING')
            )
            "#,
        )
        .bind(study_pk)
        .bind(storage_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    #[tracing::instrument(skip(self, storage_ids), fields(db.table = "study", db.record_id = study_pk))]
    async fn set_study_storage_ids(
        &self,
        study_pk: i64,
        storage_ids: &StorageIds,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE study SET storage_ids = $2 WHERE pk = $1")
            .bind(study_pk)
            .bind(storage_ids.to_db_value())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "instance", db.record_id = study_pk))]
    async fn delete_study_chunk(&self, study_pk: i64, limit: usize) -> Result<usize, AppError> {
        let mut tx = self.pool.begin().await?;

        let instance_pks: Vec<i64> = sqlx::query_scalar::<Postgres, i64>(
            r#"
            SELECT i.pk FROM instance i
            JOIN series se ON i.series_fk = se.pk
            WHERE se.study_fk = $1
            ORDER BY i.pk
            LIMIT $2
            FOR UPDATE OF i SKIP LOCKED
            "#,
        )
        .bind(study_pk)
        .bind(to_limit(limit))
        .fetch_all(&mut *tx)
        .await?;

        if !instance_pks.is_empty() {
            sqlx::query(
                r#"
                UPDATE location
                SET status = CASE WHEN status = 'DELETING' THEN status ELSE 'TO_DELETE' END,
                    instance_fk = NULL
                WHERE instance_fk = ANY($1)
                "#,
            )
            .bind(&instance_pks)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM instance WHERE pk = ANY($1)")
                .bind(&instance_pks)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            return Ok(instance_pks.len());
        }

        sqlx::query(
            r#"
            UPDATE metadata SET status = 'TO_DELETE'
            WHERE pk IN (SELECT metadata_fk FROM series WHERE study_fk = $1 AND metadata_fk IS NOT NULL)
            "#,
        )
        .bind(study_pk)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM series WHERE study_fk = $1")
            .bind(study_pk)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM study WHERE pk = $1")
            .bind(study_pk)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(0)
    }

    #[tracing::instrument(skip(self), fields(db.table = "study"))]
    async fn study_pk_by_uid(&self, study_uid: &str) -> Result<Option<i64>, AppError> {
        let pk: Option<i64> =
            sqlx::query_scalar::<Postgres, i64>("SELECT pk FROM study WHERE study_iuid = $1")
                .bind(study_uid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(pk)
    }
}
