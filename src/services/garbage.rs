//! Detection of rows whose backend counterpart must be cleaned up.
//!
//! Tombstoned rows and pending rows older than their timeout are reported
//! here; the maintenance worker deletes their backend content and purges
//! the rows.

use crate::{
    models::{object::ObjectRecord, part::{PartRecord, PartState}},
    services::{
        error::MetadataResult,
        metadata_service::{MetadataService, OBJECT_COLUMNS},
        multipart::PART_COLUMNS,
    },
};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

/// Rows eligible for removal. Binds: failed-put cutoff, multipart cutoff.
const OBJECT_GARBAGE: &str = "uuid IS NOT NULL AND (
        deleted_timestamp IS NOT NULL
        OR (last_modified IS NULL AND upload_id IS NULL AND creation_timestamp < ?)
        OR (last_modified IS NULL AND upload_id IS NOT NULL AND creation_timestamp < ?)
    )";

/// Parts eligible for removal. Binds: deleting, pending, cutoff.
const PART_GARBAGE: &str = "(state = ? OR (state = ? AND creation_timestamp < ?))";

impl MetadataService {
    /// Tombstoned rows plus pending rows past their timeout.
    pub async fn get_failed_or_deleted(&self) -> MetadataResult<Vec<ObjectRecord>> {
        self.failed_or_deleted_at(Utc::now()).await
    }

    pub(crate) async fn failed_or_deleted_at(
        &self,
        now: DateTime<Utc>,
    ) -> MetadataResult<Vec<ObjectRecord>> {
        let (put_cutoff, upload_cutoff) = self.cutoffs(now);
        let rows: Vec<ObjectRecord> = sqlx::query_as(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE {OBJECT_GARBAGE}
             ORDER BY creation_timestamp ASC"
        ))
        .bind(put_cutoff)
        .bind(upload_cutoff)
        .fetch_all(&*self.db)
        .await?;
        debug!(count = rows.len(), "collected failed or deleted records");
        Ok(rows)
    }

    /// Parts queued for removal plus pending parts past the upload timeout.
    pub async fn get_deleted_parts(&self) -> MetadataResult<Vec<PartRecord>> {
        self.deleted_parts_at(Utc::now()).await
    }

    pub(crate) async fn deleted_parts_at(&self, now: DateTime<Utc>) -> MetadataResult<Vec<PartRecord>> {
        let (_, upload_cutoff) = self.cutoffs(now);
        let parts: Vec<PartRecord> = sqlx::query_as(&format!(
            "SELECT {PART_COLUMNS} FROM parts WHERE {PART_GARBAGE}
             ORDER BY creation_timestamp ASC"
        ))
        .bind(PartState::Deleting.as_str())
        .bind(PartState::Pending.as_str())
        .bind(upload_cutoff)
        .fetch_all(&*self.db)
        .await?;
        debug!(count = parts.len(), "collected deleted parts");
        Ok(parts)
    }

    /// Physically remove an object row. Only rows that
    /// [`MetadataService::get_failed_or_deleted`] would report are removed.
    pub async fn purge_object(&self, uuid: Uuid) -> MetadataResult<bool> {
        let (put_cutoff, upload_cutoff) = self.cutoffs(Utc::now());
        let result = sqlx::query(&format!(
            "DELETE FROM objects WHERE uuid = ? AND {OBJECT_GARBAGE}"
        ))
        .bind(uuid)
        .bind(put_cutoff)
        .bind(upload_cutoff)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Physically remove a part row reported by
    /// [`MetadataService::get_deleted_parts`].
    pub async fn purge_part(&self, uuid: Uuid) -> MetadataResult<bool> {
        let (_, upload_cutoff) = self.cutoffs(Utc::now());
        let result = sqlx::query(&format!("DELETE FROM parts WHERE uuid = ? AND {PART_GARBAGE}"))
            .bind(uuid)
            .bind(PartState::Deleting.as_str())
            .bind(PartState::Pending.as_str())
            .bind(upload_cutoff)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn cutoffs(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            now - self.config.failed_put_timeout,
            now - self.config.multipart_timeout,
        )
    }
}
