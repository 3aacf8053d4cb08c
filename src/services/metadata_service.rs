//! MetadataService — the object metadata engine. Rows live in SQLite; every
//! write that depends on a backend side effect goes through the compensating
//! protocol in `protocol.rs`. Repair, multipart accounting, garbage detection
//! and listing extend this type from their own modules.

use crate::{
    config::MetadataConfig,
    models::{
        acl::AccessControlPolicy,
        bucket::{Bucket, VersioningStatus},
        object::{NULL_VERSION_ID, ObjectRecord, ObjectState},
    },
    services::{
        backend::ContentReceipt,
        error::{MetadataError, MetadataResult},
        protocol::{self, BackendOp},
    },
};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Executor, SqlitePool, Transaction, sqlite::Sqlite};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Column list matching [`ObjectRecord`]'s field order.
pub(crate) const OBJECT_COLUMNS: &str = "bucket, key, uuid, version_id, is_delete_marker, \
     is_latest, last_modified, deleted_timestamp, creation_timestamp, size, etag, \
     content_type, storage_class, upload_id, owner_id, acp";

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Result of a delete request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeleteOutcome {
    /// Delete marker written by the request, if any.
    pub delete_marker: Option<ObjectRecord>,
    /// Records moved to the tombstoned state.
    pub tombstoned: Vec<Uuid>,
}

/// The object metadata engine.
///
/// Constructed once at startup and cloned into every dependent; clones share
/// the pool and configuration.
#[derive(Clone, Debug)]
pub struct MetadataService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    pub(crate) config: Arc<MetadataConfig>,
}

impl MetadataService {
    pub fn new(db: Arc<SqlitePool>, config: MetadataConfig) -> Self {
        Self {
            db,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &MetadataConfig {
        &self.config
    }

    /// Reject keys that are empty, too long, or contain control characters.
    pub(crate) fn ensure_key_safe(key: &str) -> MetadataResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(MetadataError::InvalidObjectKey);
        }
        if key.bytes().any(|b| b.is_ascii_control()) {
            return Err(MetadataError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    pub(crate) fn ensure_bucket_name_safe(name: &str) -> MetadataResult<()> {
        let invalid = |reason: &str| MetadataError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with('.')
            || name.ends_with('.')
            || name.starts_with('-')
            || name.ends_with('-')
        {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }
        Ok(())
    }

    pub(crate) fn ensure_target(bucket: &Bucket, key: &str) -> MetadataResult<()> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        Self::ensure_key_safe(key)
    }

    /// Open a transaction that takes the write lock up front, so a
    /// read-then-write sequence cannot lose the lock to another writer.
    pub(crate) async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.db.begin_with("BEGIN IMMEDIATE").await
    }

    /// Version id assigned when a write is confirmed.
    fn next_version_id(bucket: &Bucket) -> String {
        if bucket.versioning_enabled() {
            Uuid::new_v4().simple().to_string()
        } else {
            NULL_VERSION_ID.to_string()
        }
    }

    /// Persist `object` in the pending state (C) and return it.
    ///
    /// The record must be fresh (state B); it receives its uuid here.
    pub async fn create_pending(
        &self,
        bucket: &Bucket,
        object: ObjectRecord,
    ) -> MetadataResult<ObjectRecord> {
        Self::ensure_target(bucket, &object.key)?;
        if object.state() != ObjectState::Transient {
            return Err(MetadataError::InvalidArgument(format!(
                "record for `{}` is already persisted (state {})",
                object.key,
                object.state()
            )));
        }

        let mut pending = object;
        pending.bucket = bucket.name.clone();
        pending.uuid = Some(Uuid::new_v4());
        pending.version_id = Some(NULL_VERSION_ID.to_string());
        pending.is_latest = false;
        pending.creation_timestamp = Utc::now();
        if pending.owner_id.is_none() {
            pending.owner_id = Some(bucket.owner_id.clone());
        }

        insert_object(&*self.db, &pending).await?;
        debug!(bucket = %pending.bucket, key = %pending.key, uuid = ?pending.uuid, "persisted pending record");
        Ok(pending)
    }

    /// Persist `object`, store its content through the operation built by
    /// `make_op`, and confirm it.
    ///
    /// `make_op` receives the pending record so the backend payload can be
    /// addressed by its uuid. On backend failure the compensation runs, the
    /// pending row is tombstoned for the garbage detector, and the backend
    /// error is returned.
    pub async fn create<F>(
        &self,
        bucket: &Bucket,
        object: ObjectRecord,
        make_op: F,
    ) -> MetadataResult<ObjectRecord>
    where
        F: FnOnce(&ObjectRecord) -> BackendOp<ContentReceipt>,
    {
        let pending = self.create_pending(bucket, object).await?;
        let op = make_op(&pending);
        let uuid = pending.uuid;

        let confirm_service = self.clone();
        let abort_service = self.clone();
        let confirm_bucket = bucket.clone();
        protocol::execute(
            "create",
            op,
            move |receipt| async move {
                confirm_service
                    .confirm_write(&confirm_bucket, pending, receipt)
                    .await
            },
            move || async move {
                if let Some(uuid) = uuid {
                    abort_service.retire_pending(uuid).await;
                }
            },
        )
        .await
    }

    /// Run `op` against an already pending record and confirm it on success.
    ///
    /// Used to finalize multipart uploads. On failure the record stays
    /// pending so the upload can be retried.
    pub async fn merge(
        &self,
        bucket: &Bucket,
        object: ObjectRecord,
        op: BackendOp<ContentReceipt>,
    ) -> MetadataResult<ObjectRecord> {
        Self::ensure_target(bucket, &object.key)?;
        let uuid = object.uuid.ok_or_else(|| {
            MetadataError::InvalidArgument(format!("record for `{}` was never persisted", object.key))
        })?;
        let current = self
            .fetch_by_uuid(uuid)
            .await?
            .filter(|r| r.bucket == bucket.name)
            .ok_or_else(|| MetadataError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: object.key.clone(),
                version: object.display_version_id().to_string(),
            })?;
        if current.state() != ObjectState::Pending {
            return Err(MetadataError::InvalidArgument(format!(
                "record {} for `{}` is not pending (state {})",
                uuid,
                current.key,
                current.state()
            )));
        }

        let mut pending = object;
        pending.bucket = current.bucket;
        pending.creation_timestamp = current.creation_timestamp;
        let confirm_service = self.clone();
        let confirm_bucket = bucket.clone();
        protocol::execute(
            "merge",
            op,
            move |receipt| async move {
                confirm_service
                    .confirm_write(&confirm_bucket, pending, receipt)
                    .await
            },
            move || async move {
                debug!(%uuid, "merge failed, record left pending");
            },
        )
        .await
    }

    /// Move a pending record to its confirmed state and refresh the key's
    /// history. Commit failures are logged, not returned.
    async fn confirm_write(
        &self,
        bucket: &Bucket,
        pending: ObjectRecord,
        receipt: ContentReceipt,
    ) -> ObjectRecord {
        let mut confirmed = pending;
        confirmed.last_modified = Some(receipt.last_modified);
        confirmed.size = receipt.size;
        if receipt.etag.is_some() {
            confirmed.etag = receipt.etag;
        }
        confirmed.version_id = Some(Self::next_version_id(bucket));

        match self.commit_confirmation(&confirmed).await {
            Ok(true) => {
                debug!(key = %confirmed.key, uuid = ?confirmed.uuid, state = %confirmed.state(), "confirmed record");
            }
            Ok(false) => {
                error!(key = %confirmed.key, uuid = ?confirmed.uuid, "pending record vanished before confirmation");
                return confirmed;
            }
            Err(err) => {
                error!(key = %confirmed.key, uuid = ?confirmed.uuid, error = %err, "failed to commit confirmation after backend success");
                return confirmed;
            }
        }

        match self.do_full_repair(bucket, &confirmed.key).await {
            Ok(report) => confirmed.is_latest = report.latest == confirmed.uuid,
            Err(err) => warn!(key = %confirmed.key, error = %err, "repair after write failed"),
        }
        confirmed
    }

    async fn commit_confirmation(&self, confirmed: &ObjectRecord) -> MetadataResult<bool> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            "UPDATE objects
             SET last_modified = ?, version_id = ?, size = ?, etag = ?,
                 content_type = ?, storage_class = ?, owner_id = ?
             WHERE uuid = ? AND last_modified IS NULL AND deleted_timestamp IS NULL",
        )
        .bind(confirmed.last_modified)
        .bind(&confirmed.version_id)
        .bind(confirmed.size)
        .bind(&confirmed.etag)
        .bind(&confirmed.content_type)
        .bind(&confirmed.storage_class)
        .bind(&confirmed.owner_id)
        .bind(confirmed.uuid)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    /// Tombstone a pending row whose backend write failed.
    async fn retire_pending(&self, uuid: Uuid) {
        let result = sqlx::query(
            "UPDATE objects SET deleted_timestamp = ?, is_latest = 0
             WHERE uuid = ? AND last_modified IS NULL AND deleted_timestamp IS NULL",
        )
        .bind(Utc::now())
        .bind(uuid)
        .execute(&*self.db)
        .await;
        match result {
            Ok(_) => debug!(%uuid, "tombstoned failed pending record"),
            Err(err) => error!(%uuid, error = %err, "failed to tombstone pending record"),
        }
    }

    /// Update the descriptive fields of a persisted record once `op`
    /// succeeds on the backend.
    ///
    /// Lifecycle fields (`uuid`, `version_id`, timestamps, flags) are never
    /// written here.
    pub async fn update<T>(
        &self,
        bucket: &Bucket,
        object: &ObjectRecord,
        op: BackendOp<T>,
    ) -> MetadataResult<ObjectRecord>
    where
        T: Send + 'static,
    {
        Self::ensure_target(bucket, &object.key)?;
        let not_found = || MetadataError::ObjectNotFound {
            bucket: bucket.name.clone(),
            key: object.key.clone(),
            version: object.display_version_id().to_string(),
        };
        let uuid = object.uuid.ok_or_else(not_found)?;
        let current = self
            .fetch_by_uuid(uuid)
            .await?
            .filter(|r| r.bucket == bucket.name && !r.is_tombstoned())
            .ok_or_else(not_found)?;
        ensure_not_corrupt(&current)?;

        let service = self.clone();
        let requested = object.clone();
        protocol::execute(
            "update",
            op,
            move |_| async move { service.commit_update(current, requested).await },
            || async {},
        )
        .await
    }

    async fn commit_update(&self, current: ObjectRecord, requested: ObjectRecord) -> ObjectRecord {
        let mut updated = current;
        updated.size = requested.size;
        updated.etag = requested.etag;
        updated.content_type = requested.content_type;
        updated.storage_class = requested.storage_class;
        updated.owner_id = requested.owner_id;

        let result = sqlx::query(
            "UPDATE objects
             SET size = ?, etag = ?, content_type = ?, storage_class = ?, owner_id = ?
             WHERE uuid = ? AND deleted_timestamp IS NULL",
        )
        .bind(updated.size)
        .bind(&updated.etag)
        .bind(&updated.content_type)
        .bind(&updated.storage_class)
        .bind(&updated.owner_id)
        .bind(updated.uuid)
        .execute(&*self.db)
        .await;
        match result {
            Ok(done) if done.rows_affected() == 0 => {
                warn!(uuid = ?updated.uuid, key = %updated.key, "record tombstoned before update committed");
            }
            Ok(_) => debug!(uuid = ?updated.uuid, key = %updated.key, "updated record"),
            Err(err) => {
                error!(uuid = ?updated.uuid, key = %updated.key, error = %err, "failed to commit update after backend success");
            }
        }
        updated
    }

    /// Apply `acp` to `object` after `op` succeeds on the backend.
    pub async fn set_acp<T>(
        &self,
        object: &ObjectRecord,
        acp: &AccessControlPolicy,
        op: BackendOp<T>,
    ) -> MetadataResult<T>
    where
        T: Send + 'static,
    {
        let not_found = || MetadataError::ObjectNotFound {
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            version: object.display_version_id().to_string(),
        };
        let uuid = object.uuid.ok_or_else(not_found)?;
        let current = self.fetch_by_uuid(uuid).await?.ok_or_else(not_found)?;
        if current.is_tombstoned() {
            return Err(not_found());
        }
        let encoded = serde_json::to_string(acp)?;

        let service = self.clone();
        protocol::execute(
            "set_acp",
            op,
            move |value| async move {
                let result = sqlx::query("UPDATE objects SET acp = ? WHERE uuid = ?")
                    .bind(&encoded)
                    .bind(uuid)
                    .execute(&*service.db)
                    .await;
                if let Err(err) = result {
                    error!(%uuid, error = %err, "failed to store access control policy");
                }
                value
            },
            || async {},
        )
        .await
    }

    /// Decode the stored access control policy of `object`, if any.
    pub fn acp_of(object: &ObjectRecord) -> MetadataResult<Option<AccessControlPolicy>> {
        object
            .acp
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(MetadataError::from)
    }

    /// Delete `key`, or one specific version of it.
    ///
    /// - With a version id: that version is tombstoned.
    /// - Unversioned bucket: the null version is tombstoned.
    /// - Versioned bucket: a delete marker (G) is written.
    /// - Suspended bucket: the null version is tombstoned and a null delete
    ///   marker (F) is written.
    pub async fn delete(
        &self,
        bucket: &Bucket,
        key: &str,
        version_id: Option<&str>,
        requester: &str,
    ) -> MetadataResult<DeleteOutcome> {
        Self::ensure_target(bucket, key)?;
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let mut tombstoned = Vec::new();
        let mut delete_marker = None;

        match version_id {
            Some(version) => {
                let target: Option<ObjectRecord> = sqlx::query_as(&format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects
                     WHERE bucket = ? AND key = ? AND version_id = ?
                       AND deleted_timestamp IS NULL AND last_modified IS NOT NULL
                     ORDER BY last_modified DESC LIMIT 1"
                ))
                .bind(&bucket.name)
                .bind(key)
                .bind(version)
                .fetch_optional(&mut *tx)
                .await?;

                let target = target.ok_or_else(|| MetadataError::ObjectNotFound {
                    bucket: bucket.name.clone(),
                    key: key.to_string(),
                    version: version.to_string(),
                })?;
                if let Some(uuid) = target.uuid {
                    tombstone(&mut *tx, uuid, now).await?;
                    tombstoned.push(uuid);
                }
            }
            None => {
                if bucket.versioning != VersioningStatus::Enabled {
                    let nulls: Vec<(Option<Uuid>,)> = sqlx::query_as(
                        "SELECT uuid FROM objects
                         WHERE bucket = ? AND key = ? AND version_id = ?
                           AND deleted_timestamp IS NULL AND last_modified IS NOT NULL",
                    )
                    .bind(&bucket.name)
                    .bind(key)
                    .bind(NULL_VERSION_ID)
                    .fetch_all(&mut *tx)
                    .await?;
                    for uuid in nulls.into_iter().filter_map(|(uuid,)| uuid) {
                        tombstone(&mut *tx, uuid, now).await?;
                        tombstoned.push(uuid);
                    }
                }

                if bucket.versioning != VersioningStatus::Disabled {
                    let mut marker = ObjectRecord::initialize(&bucket.name, key).with_owner(requester);
                    marker.uuid = Some(Uuid::new_v4());
                    marker.version_id = Some(Self::next_version_id(bucket));
                    marker.is_delete_marker = true;
                    marker.last_modified = Some(now);
                    marker.creation_timestamp = now;
                    insert_object(&mut *tx, &marker).await?;
                    delete_marker = Some(marker);
                }
            }
        }

        tx.commit().await?;
        debug!(bucket = %bucket.name, key, tombstoned = tombstoned.len(), marker = delete_marker.is_some(), "deleted");

        match self.do_full_repair(bucket, key).await {
            Ok(report) => {
                if let Some(marker) = delete_marker.as_mut() {
                    marker.is_latest = report.latest == marker.uuid;
                }
            }
            Err(err) => warn!(key, error = %err, "repair after delete failed"),
        }

        Ok(DeleteOutcome {
            delete_marker,
            tombstoned,
        })
    }

    /// Fetch the latest record for `key`, or a specific version.
    ///
    /// Without a version, a latest delete marker reads as not found. With a
    /// version, delete markers are returned as-is.
    pub async fn get(
        &self,
        bucket: &Bucket,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<ObjectRecord> {
        Self::ensure_target(bucket, key)?;
        let not_found = || MetadataError::ObjectNotFound {
            bucket: bucket.name.clone(),
            key: key.to_string(),
            version: version_id.unwrap_or("latest").to_string(),
        };

        let record: Option<ObjectRecord> = match version_id {
            None => {
                sqlx::query_as(&format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects
                     WHERE bucket = ? AND key = ? AND is_latest = 1
                       AND deleted_timestamp IS NULL AND last_modified IS NOT NULL
                     ORDER BY last_modified DESC LIMIT 1"
                ))
                .bind(&bucket.name)
                .bind(key)
                .fetch_optional(&*self.db)
                .await?
            }
            Some(version) => {
                sqlx::query_as(&format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects
                     WHERE bucket = ? AND key = ? AND version_id = ?
                       AND deleted_timestamp IS NULL AND last_modified IS NOT NULL
                     ORDER BY last_modified DESC LIMIT 1"
                ))
                .bind(&bucket.name)
                .bind(key)
                .bind(version)
                .fetch_optional(&*self.db)
                .await?
            }
        };

        let record = record.ok_or_else(not_found)?;
        ensure_not_corrupt(&record)?;
        if version_id.is_none() && record.is_delete_marker {
            return Err(not_found());
        }
        Ok(record)
    }

    /// Whether [`MetadataService::get`] would find the object.
    pub async fn exists(
        &self,
        bucket: &Bucket,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<bool> {
        match self.get(bucket, key, version_id).await {
            Ok(_) => Ok(true),
            Err(MetadataError::ObjectNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// The in-progress record of a multipart upload.
    pub async fn get_object(
        &self,
        bucket: &Bucket,
        key: &str,
        upload_id: &str,
    ) -> MetadataResult<ObjectRecord> {
        Self::ensure_target(bucket, key)?;
        let record: Option<ObjectRecord> = sqlx::query_as(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE bucket = ? AND key = ? AND upload_id = ?
               AND last_modified IS NULL AND deleted_timestamp IS NULL
             LIMIT 1"
        ))
        .bind(&bucket.name)
        .bind(key)
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;

        let record = record.ok_or_else(|| MetadataError::UploadNotFound {
            bucket: bucket.name.clone(),
            upload_id: upload_id.to_string(),
        })?;
        ensure_not_corrupt(&record)?;
        Ok(record)
    }

    /// Every row of the bucket, whatever its state.
    pub async fn count_raw_entities(&self, bucket: &Bucket) -> MetadataResult<i64> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM objects WHERE bucket = ?")
            .bind(&bucket.name)
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }

    /// Rows visible to clients: confirmed, not tombstoned, not pending.
    pub async fn count_valid(&self, bucket: &Bucket) -> MetadataResult<i64> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM objects
             WHERE bucket = ? AND uuid IS NOT NULL AND version_id IS NOT NULL
               AND last_modified IS NOT NULL AND deleted_timestamp IS NULL",
        )
        .bind(&bucket.name)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    /// Rows of the bucket that match no valid lifecycle state.
    pub async fn find_corrupt(&self, bucket: &Bucket) -> MetadataResult<Vec<ObjectRecord>> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let rows: Vec<ObjectRecord> = sqlx::query_as(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE bucket = ? AND (uuid IS NULL OR deleted_timestamp IS NULL)
             ORDER BY key ASC"
        ))
        .bind(&bucket.name)
        .fetch_all(&*self.db)
        .await?;

        let corrupt: Vec<ObjectRecord> = rows
            .into_iter()
            .filter(|r| !r.is_valid_at_rest())
            .collect();
        for record in &corrupt {
            warn!(bucket = %record.bucket, key = %record.key, uuid = ?record.uuid, state = %record.state(), "corrupt record");
        }
        Ok(corrupt)
    }

    pub(crate) async fn fetch_by_uuid(&self, uuid: Uuid) -> MetadataResult<Option<ObjectRecord>> {
        let record = sqlx::query_as(&format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE uuid = ?"))
            .bind(uuid)
            .fetch_optional(&*self.db)
            .await?;
        Ok(record)
    }
}

pub(crate) async fn insert_object<'e, E>(executor: E, record: &ObjectRecord) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(&format!(
        "INSERT INTO objects ({OBJECT_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&record.bucket)
    .bind(&record.key)
    .bind(record.uuid)
    .bind(&record.version_id)
    .bind(record.is_delete_marker)
    .bind(record.is_latest)
    .bind(record.last_modified)
    .bind(record.deleted_timestamp)
    .bind(record.creation_timestamp)
    .bind(record.size)
    .bind(&record.etag)
    .bind(&record.content_type)
    .bind(&record.storage_class)
    .bind(&record.upload_id)
    .bind(&record.owner_id)
    .bind(&record.acp)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn tombstone<'e, E>(
    executor: E,
    uuid: Uuid,
    at: chrono::DateTime<Utc>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE objects SET deleted_timestamp = ?, is_latest = 0
         WHERE uuid = ? AND deleted_timestamp IS NULL",
    )
    .bind(at)
    .bind(uuid)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) fn ensure_not_corrupt(record: &ObjectRecord) -> MetadataResult<()> {
    if let ObjectState::Corrupt { reason } = record.state() {
        warn!(bucket = %record.bucket, key = %record.key, uuid = ?record.uuid, reason, "corrupt record");
        return Err(MetadataError::CorruptRecord {
            uuid: record.uuid,
            key: record.key.clone(),
            reason: reason.to_string(),
        });
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{error::BackendError, test_support::*};
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn all_rows(service: &MetadataService) -> Vec<ObjectRecord> {
        sqlx::query_as(&format!("SELECT {OBJECT_COLUMNS} FROM objects ORDER BY creation_timestamp"))
            .fetch_all(&*service.db)
            .await
            .unwrap()
    }

    async fn put(service: &MetadataService, bucket: &Bucket, key: &str) -> ObjectRecord {
        service
            .create(bucket, ObjectRecord::initialize(BUCKET, key), |_| stored_now(4))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_unversioned_writes_keep_one_latest() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);
        let t0 = Utc::now();
        for i in 0..3 {
            let object = ObjectRecord::initialize(BUCKET, "photo.png");
            service
                .create(&bucket, object, |_| stored(10, t0 + Duration::seconds(i)))
                .await
                .unwrap();
        }

        let report = service.do_full_repair(&bucket, "photo.png").await.unwrap();
        assert!(report.is_noop());

        let rows = all_rows(&service).await;
        assert_eq!(rows.len(), 3);
        let live: Vec<_> = rows.iter().filter(|r| !r.is_tombstoned()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].state(), ObjectState::Unversioned);
        assert!(live[0].is_latest);
        assert_eq!(live[0].last_modified, Some(t0 + Duration::seconds(2)));
        assert_eq!(rows.iter().filter(|r| r.state() == ObjectState::Tombstoned).count(), 2);
    }

    #[tokio::test]
    async fn backend_failure_leaves_no_confirmed_record() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Enabled);
        let rolled_back = Arc::new(AtomicBool::new(false));
        let flag = rolled_back.clone();

        let op = BackendOp::new(
            async { Err::<ContentReceipt, _>(BackendError::Rejected("disk full".into())) },
            move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, BackendError>(())
            },
        );
        let err = service
            .create(&bucket, ObjectRecord::initialize(BUCKET, "a.txt"), |_| op)
            .await
            .unwrap_err();

        assert!(matches!(err, MetadataError::Backend(BackendError::Rejected(_))));
        assert!(rolled_back.load(Ordering::SeqCst));
        assert!(all_rows(&service).await.iter().all(|r| !r.is_confirmed()));
        assert!(!service.exists(&bucket, "a.txt", None).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_create_still_confirms() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);
        let op = BackendOp::without_rollback(async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok::<_, BackendError>(ContentReceipt::new("etag", 1))
        });

        let call = service.create(&bucket, ObjectRecord::initialize(BUCKET, "slow.txt"), |_| op);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(20), call).await;
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let record = service.get(&bucket, "slow.txt", None).await.unwrap();
        assert_eq!(record.state(), ObjectState::Unversioned);
    }

    #[tokio::test]
    async fn concurrent_deletes_of_one_key_all_commit() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Enabled);
        put(&service, &bucket, "busy.txt").await;

        let deletes = (0..8).map(|i| {
            let service = service.clone();
            let bucket = bucket.clone();
            tokio::spawn(async move {
                service
                    .delete(&bucket, "busy.txt", None, &format!("owner-{i}"))
                    .await
            })
        });
        for outcome in futures::future::join_all(deletes).await {
            assert!(outcome.unwrap().unwrap().delete_marker.is_some());
        }

        let rows = all_rows(&service).await;
        assert_eq!(rows.iter().filter(|r| r.is_delete_marker).count(), 8);
        assert_eq!(rows.iter().filter(|r| r.is_latest).count(), 1);
    }

    #[tokio::test]
    async fn versioned_bucket_assigns_ids_and_writes_markers() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Enabled);
        let first = put(&service, &bucket, "doc.txt").await;
        let second = put(&service, &bucket, "doc.txt").await;
        assert_eq!(first.state(), ObjectState::Versioned);
        assert_ne!(first.version_id, second.version_id);
        assert!(second.is_latest);

        let outcome = service.delete(&bucket, "doc.txt", None, "owner-1").await.unwrap();
        let marker = outcome.delete_marker.unwrap();
        assert_eq!(marker.state(), ObjectState::VersionedDeleteMarker);
        assert!(outcome.tombstoned.is_empty());

        assert!(matches!(
            service.get(&bucket, "doc.txt", None).await,
            Err(MetadataError::ObjectNotFound { .. })
        ));
        let by_version = service
            .get(&bucket, "doc.txt", marker.version_id.as_deref())
            .await
            .unwrap();
        assert!(by_version.is_delete_marker);
        let old = service
            .get(&bucket, "doc.txt", first.version_id.as_deref())
            .await
            .unwrap();
        assert_eq!(old.uuid, first.uuid);
        assert_eq!(service.count_valid(&bucket).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn deleting_a_version_moves_latest_back() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Enabled);
        let first = put(&service, &bucket, "doc.txt").await;
        let second = put(&service, &bucket, "doc.txt").await;

        let outcome = service
            .delete(&bucket, "doc.txt", second.version_id.as_deref(), "owner-1")
            .await
            .unwrap();
        assert_eq!(outcome.tombstoned, vec![second.uuid.unwrap()]);
        assert!(outcome.delete_marker.is_none());

        let latest = service.get(&bucket, "doc.txt", None).await.unwrap();
        assert_eq!(latest.uuid, first.uuid);
        assert!(latest.is_latest);

        assert!(matches!(
            service.delete(&bucket, "doc.txt", Some("nope"), "owner-1").await,
            Err(MetadataError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn suspended_delete_replaces_null_version_with_marker() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Suspended);
        let object = put(&service, &bucket, "log.txt").await;

        let outcome = service.delete(&bucket, "log.txt", None, "owner-1").await.unwrap();
        assert_eq!(outcome.tombstoned, vec![object.uuid.unwrap()]);
        let marker = outcome.delete_marker.unwrap();
        assert_eq!(marker.state(), ObjectState::SuspendedDeleteMarker);
        assert!(marker.is_latest);
        assert!(!service.exists(&bucket, "log.txt", None).await.unwrap());
    }

    #[tokio::test]
    async fn unversioned_delete_is_idempotent() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);
        put(&service, &bucket, "tmp.txt").await;

        let first = service.delete(&bucket, "tmp.txt", None, "owner-1").await.unwrap();
        assert_eq!(first.tombstoned.len(), 1);
        let again = service.delete(&bucket, "tmp.txt", None, "owner-1").await.unwrap();
        assert!(again.tombstoned.is_empty());
        assert!(again.delete_marker.is_none());
        assert_eq!(service.count_valid(&bucket).await.unwrap(), 0);
        assert_eq!(service.count_raw_entities(&bucket).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn validation_happens_before_any_write() {
        let service = service().await;
        let bad_bucket = Bucket::new("192.168.0.1", "owner-1", VersioningStatus::Disabled);
        assert!(matches!(
            service
                .create(&bad_bucket, ObjectRecord::initialize("192.168.0.1", "a"), |_| stored_now(1))
                .await,
            Err(MetadataError::InvalidBucketName { .. })
        ));

        let bucket = bucket(VersioningStatus::Disabled);
        for key in ["", "bad\nkey"] {
            assert!(matches!(
                service
                    .create(&bucket, ObjectRecord::initialize(BUCKET, key), |_| stored_now(1))
                    .await,
                Err(MetadataError::InvalidObjectKey)
            ));
        }
        let long_key = "k".repeat(1025);
        assert!(service.create_pending(&bucket, ObjectRecord::initialize(BUCKET, long_key)).await.is_err());

        let pending = service
            .create_pending(&bucket, ObjectRecord::initialize(BUCKET, "ok"))
            .await
            .unwrap();
        assert!(matches!(
            service.create_pending(&bucket, pending).await,
            Err(MetadataError::InvalidArgument(_))
        ));
        assert_eq!(service.count_raw_entities(&bucket).await.unwrap(), 1);
    }

    #[test]
    fn bucket_names_follow_s3_rules() {
        for name in ["photos", "my.bucket-01", "abc"] {
            assert!(MetadataService::ensure_bucket_name_safe(name).is_ok(), "{name}");
        }
        for name in ["ab", "Photos", "-photos", "photos.", "a..b", "a.-b", "10.0.0.1", "under_score"] {
            assert!(MetadataService::ensure_bucket_name_safe(name).is_err(), "{name}");
        }
    }

    #[tokio::test]
    async fn update_changes_descriptive_fields_only() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);
        let object = put(&service, &bucket, "a.txt").await;

        let mut changed = object.clone().with_content_type("text/plain");
        changed.version_id = Some("forged".into());
        changed.is_latest = false;
        let noop = || BackendOp::without_rollback(async { Ok::<_, BackendError>(()) });
        let updated = service.update(&bucket, &changed, noop()).await.unwrap();
        assert_eq!(updated.content_type.as_deref(), Some("text/plain"));
        assert_eq!(updated.version_id.as_deref(), Some(NULL_VERSION_ID));
        assert!(updated.is_latest);

        let refused = BackendOp::without_rollback(async {
            Err::<(), _>(BackendError::Rejected("copy failed".into()))
        });
        let retyped = updated.clone().with_content_type("image/png");
        assert!(service.update(&bucket, &retyped, refused).await.is_err());
        let stored = service.get(&bucket, "a.txt", None).await.unwrap();
        assert_eq!(stored.content_type.as_deref(), Some("text/plain"));

        let mut unknown = object.clone();
        unknown.uuid = Some(Uuid::new_v4());
        assert!(matches!(
            service.update(&bucket, &unknown, noop()).await,
            Err(MetadataError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn set_acp_applies_only_after_backend_success() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);
        let object = put(&service, &bucket, "a.txt").await;
        let policy = AccessControlPolicy::private("owner-1");

        let failing = BackendOp::without_rollback(async {
            Err::<(), _>(BackendError::Rejected("no".into()))
        });
        assert!(service.set_acp(&object, &policy, failing).await.is_err());
        let unchanged = service.get(&bucket, "a.txt", None).await.unwrap();
        assert_eq!(MetadataService::acp_of(&unchanged).unwrap(), None);

        let ok = BackendOp::without_rollback(async { Ok::<_, BackendError>("applied") });
        assert_eq!(service.set_acp(&object, &policy, ok).await.unwrap(), "applied");
        let stored = service.get(&bucket, "a.txt", None).await.unwrap();
        assert_eq!(MetadataService::acp_of(&stored).unwrap(), Some(policy));
    }

    #[tokio::test]
    async fn get_object_finds_pending_upload() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);
        let upload = service
            .create_pending(&bucket, ObjectRecord::initialize(BUCKET, "big.iso").with_upload_id("u-1"))
            .await
            .unwrap();

        let found = service.get_object(&bucket, "big.iso", "u-1").await.unwrap();
        assert_eq!(found.uuid, upload.uuid);
        assert_eq!(found.state(), ObjectState::Pending);
        assert!(matches!(
            service.get_object(&bucket, "big.iso", "u-2").await,
            Err(MetadataError::UploadNotFound { .. })
        ));
        // pending uploads are not visible objects
        assert!(!service.exists(&bucket, "big.iso", None).await.unwrap());
        assert_eq!(service.count_valid(&bucket).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_rows_are_surfaced() {
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);
        let mut corrupt = ObjectRecord::initialize(BUCKET, "broken.txt");
        corrupt.uuid = Some(Uuid::new_v4());
        corrupt.last_modified = Some(Utc::now());
        corrupt.is_latest = true;
        insert_object(&*service.db, &corrupt).await.unwrap();
        let mut unpersisted = ObjectRecord::initialize(BUCKET, "ghost.txt");
        unpersisted.creation_timestamp = Utc::now();
        insert_object(&*service.db, &unpersisted).await.unwrap();

        let found = service.find_corrupt(&bucket).await.unwrap();
        let keys: Vec<_> = found.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["broken.txt", "ghost.txt"]);

        assert!(matches!(
            service.get(&bucket, "broken.txt", None).await,
            Err(MetadataError::CorruptRecord { .. })
        ));
        let listed = service.list_paginated(&bucket, "", None, None, 10).await.unwrap();
        assert!(listed.entries.is_empty());
    }
}
