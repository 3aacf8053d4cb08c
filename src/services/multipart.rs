//! Multipart upload bookkeeping.
//!
//! An upload is a pending object record carrying an `upload_id`; its parts
//! live in the `parts` table. Parts are never deleted synchronously: removal
//! marks them `deleting` and the maintenance worker clears the backend copy
//! before purging the row.

use crate::{
    models::{
        bucket::Bucket,
        object::ObjectRecord,
        part::{MAX_PART_NUMBER, MIN_PART_NUMBER, PartRecord, PartState},
    },
    services::{
        backend::ContentReceipt,
        error::{MetadataError, MetadataResult},
        listing::PaginatedResult,
        metadata_service::MetadataService,
        protocol::{self, BackendOp},
    },
};
use chrono::{DateTime, Utc};
use sqlx::{Executor, sqlite::Sqlite};
use tracing::{debug, error, warn};

/// Column list matching [`PartRecord`]'s field order.
pub(crate) const PART_COLUMNS: &str = "uuid, bucket, key, upload_id, part_number, size, etag, \
     state, creation_timestamp, last_modified, deleted_timestamp";

impl MetadataService {
    /// Record a part of `part.upload_id` and store it through `op`.
    ///
    /// A confirmed part supersedes earlier completed parts with the same
    /// number. A failed part is queued for removal.
    pub async fn create_part(
        &self,
        bucket: &Bucket,
        part: PartRecord,
        op: BackendOp<ContentReceipt>,
    ) -> MetadataResult<PartRecord> {
        Self::ensure_target(bucket, &part.key)?;
        if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part.part_number) {
            return Err(MetadataError::InvalidPartNumber(part.part_number));
        }
        self.get_object(bucket, &part.key, &part.upload_id).await?;

        let mut pending = part;
        pending.bucket = bucket.name.clone();
        pending.state = PartState::Pending;
        pending.creation_timestamp = Utc::now();
        pending.last_modified = None;
        pending.deleted_timestamp = None;
        insert_part(&*self.db, &pending).await?;
        debug!(upload_id = %pending.upload_id, part_number = pending.part_number, uuid = %pending.uuid, "persisted pending part");

        let uuid = pending.uuid;
        let confirm_service = self.clone();
        let abort_service = self.clone();
        protocol::execute(
            "create_part",
            op,
            move |receipt| async move { confirm_service.confirm_part(pending, receipt).await },
            move || async move {
                let result = sqlx::query(
                    "UPDATE parts SET state = ?, deleted_timestamp = ? WHERE uuid = ? AND state = ?",
                )
                .bind(PartState::Deleting.as_str())
                .bind(Utc::now())
                .bind(uuid)
                .bind(PartState::Pending.as_str())
                .execute(&*abort_service.db)
                .await;
                if let Err(err) = result {
                    error!(%uuid, error = %err, "failed to retire pending part");
                }
            },
        )
        .await
    }

    async fn confirm_part(&self, pending: PartRecord, receipt: ContentReceipt) -> PartRecord {
        let mut part = pending;
        part.size = receipt.size;
        part.etag = receipt.etag;
        part.last_modified = Some(receipt.last_modified);
        part.state = PartState::Completed;

        match self.commit_part(&part).await {
            Ok(state) => part.state = state,
            Err(err) => {
                error!(uuid = %part.uuid, upload_id = %part.upload_id, error = %err, "failed to commit part after backend success");
                part.state = PartState::Pending;
            }
        }
        part
    }

    /// Complete `part` while its upload is still in progress; otherwise
    /// queue it for removal. Returns the state the part was left in.
    async fn commit_part(&self, part: &PartRecord) -> MetadataResult<PartState> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let confirmed = sqlx::query(
            "UPDATE parts SET state = ?, size = ?, etag = ?, last_modified = ?
             WHERE uuid = ? AND state = ?
               AND EXISTS (
                   SELECT 1 FROM objects
                    WHERE bucket = ? AND key = ? AND upload_id = ?
                      AND last_modified IS NULL AND deleted_timestamp IS NULL
               )",
        )
        .bind(PartState::Completed.as_str())
        .bind(part.size)
        .bind(&part.etag)
        .bind(part.last_modified)
        .bind(part.uuid)
        .bind(PartState::Pending.as_str())
        .bind(&part.bucket)
        .bind(&part.key)
        .bind(&part.upload_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if confirmed == 0 {
            // upload finished or aborted while the part was being stored
            let retired = sqlx::query(
                "UPDATE parts SET state = ?, size = ?, etag = ?, last_modified = ?, deleted_timestamp = ?
                 WHERE uuid = ? AND state = ?",
            )
            .bind(PartState::Deleting.as_str())
            .bind(part.size)
            .bind(&part.etag)
            .bind(part.last_modified)
            .bind(now)
            .bind(part.uuid)
            .bind(PartState::Pending.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tx.commit().await?;
            if retired > 0 {
                warn!(uuid = %part.uuid, upload_id = %part.upload_id, "upload no longer in progress, part queued for removal");
            } else {
                warn!(uuid = %part.uuid, "part left its pending state before confirmation");
            }
            return Ok(PartState::Deleting);
        }

        let superseded = sqlx::query(
            "UPDATE parts SET state = ?, deleted_timestamp = ?
             WHERE upload_id = ? AND part_number = ? AND state = ? AND uuid != ?",
        )
        .bind(PartState::Deleting.as_str())
        .bind(now)
        .bind(&part.upload_id)
        .bind(part.part_number)
        .bind(PartState::Completed.as_str())
        .bind(part.uuid)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        debug!(upload_id = %part.upload_id, part_number = part.part_number, superseded, "completed part");
        Ok(PartState::Completed)
    }

    /// Total size of the completed parts of an upload.
    pub async fn get_upload_size(
        &self,
        bucket: &Bucket,
        key: &str,
        upload_id: &str,
    ) -> MetadataResult<i64> {
        Self::ensure_target(bucket, key)?;
        let size = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(size), 0) FROM parts
             WHERE bucket = ? AND key = ? AND upload_id = ? AND state = ?",
        )
        .bind(&bucket.name)
        .bind(key)
        .bind(upload_id)
        .bind(PartState::Completed.as_str())
        .fetch_one(&*self.db)
        .await?;
        Ok(size)
    }

    /// Completed parts of an upload ordered by part number.
    pub async fn get_parts(&self, bucket: &Bucket, upload_id: &str) -> MetadataResult<Vec<PartRecord>> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let parts = sqlx::query_as(&format!(
            "SELECT {PART_COLUMNS} FROM parts
             WHERE bucket = ? AND upload_id = ? AND state = ?
             ORDER BY part_number ASC, creation_timestamp DESC"
        ))
        .bind(&bucket.name)
        .bind(upload_id)
        .bind(PartState::Completed.as_str())
        .fetch_all(&*self.db)
        .await?;
        Ok(parts)
    }

    /// One page of the completed parts of an upload, after `marker`.
    pub async fn list_parts_for_upload(
        &self,
        bucket: &Bucket,
        upload_id: &str,
        marker: Option<i32>,
        max_parts: usize,
    ) -> MetadataResult<PaginatedResult<PartRecord, i32>> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let max_parts = self.clamp_page_size(max_parts);
        if max_parts == 0 {
            return Ok(PaginatedResult::default());
        }

        let mut parts: Vec<PartRecord> = sqlx::query_as(&format!(
            "SELECT {PART_COLUMNS} FROM parts
             WHERE bucket = ? AND upload_id = ? AND state = ? AND part_number > ?
             ORDER BY part_number ASC
             LIMIT ?"
        ))
        .bind(&bucket.name)
        .bind(upload_id)
        .bind(PartState::Completed.as_str())
        .bind(marker.unwrap_or(0))
        .bind(max_parts as i64 + 1)
        .fetch_all(&*self.db)
        .await?;

        let is_truncated = parts.len() > max_parts;
        parts.truncate(max_parts);
        let next_marker = if is_truncated {
            parts.last().map(|p| p.part_number)
        } else {
            None
        };
        Ok(PaginatedResult {
            entries: parts,
            common_prefixes: Vec::new(),
            is_truncated,
            next_marker,
        })
    }

    /// Queue every part of an upload for removal. Returns the number of
    /// parts newly queued.
    pub async fn remove_parts(&self, bucket: &Bucket, upload_id: &str) -> MetadataResult<u64> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let removed = mark_parts_deleting(&*self.db, &bucket.name, upload_id, Utc::now()).await?;
        debug!(bucket = %bucket.name, upload_id, removed, "queued parts for removal");
        Ok(removed)
    }

    /// Finalize an upload: confirm its record through `op`, then queue the
    /// consolidated parts for removal.
    pub async fn complete_upload(
        &self,
        bucket: &Bucket,
        object: ObjectRecord,
        op: BackendOp<ContentReceipt>,
    ) -> MetadataResult<ObjectRecord> {
        let upload_id = object.upload_id.clone().ok_or_else(|| {
            MetadataError::InvalidArgument(format!("record for `{}` has no upload id", object.key))
        })?;
        let confirmed = self.merge(bucket, object, op).await?;
        if let Err(err) = self.remove_parts(bucket, &upload_id).await {
            warn!(%upload_id, error = %err, "failed to queue consolidated parts");
        }
        Ok(confirmed)
    }

    /// Abort an upload: tombstone its record and queue its parts.
    pub async fn abort_upload(&self, bucket: &Bucket, key: &str, upload_id: &str) -> MetadataResult<u64> {
        Self::ensure_target(bucket, key)?;
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let aborted = sqlx::query(
            "UPDATE objects SET deleted_timestamp = ?
             WHERE bucket = ? AND key = ? AND upload_id = ?
               AND last_modified IS NULL AND deleted_timestamp IS NULL",
        )
        .bind(now)
        .bind(&bucket.name)
        .bind(key)
        .bind(upload_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if aborted == 0 {
            return Err(MetadataError::UploadNotFound {
                bucket: bucket.name.clone(),
                upload_id: upload_id.to_string(),
            });
        }

        let removed = mark_parts_deleting(&mut *tx, &bucket.name, upload_id, now).await?;
        tx.commit().await?;
        debug!(bucket = %bucket.name, key, upload_id, removed, "aborted upload");
        Ok(removed)
    }

    /// Parts whose stored state is not recognized.
    pub async fn find_corrupt_parts(&self, bucket: &Bucket) -> MetadataResult<Vec<PartRecord>> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let parts: Vec<PartRecord> = sqlx::query_as(&format!(
            "SELECT {PART_COLUMNS} FROM parts WHERE bucket = ? AND state NOT IN (?, ?, ?)"
        ))
        .bind(&bucket.name)
        .bind(PartState::Pending.as_str())
        .bind(PartState::Completed.as_str())
        .bind(PartState::Deleting.as_str())
        .fetch_all(&*self.db)
        .await?;
        for part in &parts {
            warn!(uuid = %part.uuid, upload_id = %part.upload_id, "part in unknown state");
        }
        Ok(parts)
    }
}

pub(crate) async fn insert_part<'e, E>(executor: E, part: &PartRecord) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(&format!(
        "INSERT INTO parts ({PART_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(part.uuid)
    .bind(&part.bucket)
    .bind(&part.key)
    .bind(&part.upload_id)
    .bind(part.part_number)
    .bind(part.size)
    .bind(&part.etag)
    .bind(part.state.as_str())
    .bind(part.creation_timestamp)
    .bind(part.last_modified)
    .bind(part.deleted_timestamp)
    .execute(executor)
    .await?;
    Ok(())
}

async fn mark_parts_deleting<'e, E>(
    executor: E,
    bucket: &str,
    upload_id: &str,
    at: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE parts SET state = ?, deleted_timestamp = ?
         WHERE bucket = ? AND upload_id = ? AND state != ?",
    )
    .bind(PartState::Deleting.as_str())
    .bind(at)
    .bind(bucket)
    .bind(upload_id)
    .bind(PartState::Deleting.as_str())
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
