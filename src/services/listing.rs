//! Paginated listing of objects, versions and in-progress uploads.
//!
//! Pages are cut by tuple position, never by offset: a continuation marker
//! names the last key (and version or upload) returned, and the next page
//! starts strictly after it. Writes to other keys between pages cannot shift
//! a page boundary.

use crate::{
    models::{bucket::Bucket, object::ObjectRecord},
    services::{
        error::{MetadataError, MetadataResult},
        metadata_service::{MetadataService, OBJECT_COLUMNS},
    },
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sqlx::{QueryBuilder, sqlite::Sqlite};
use tracing::warn;
use uuid::Uuid;

/// Sorts after every continuation of a prefix in UTF-8 byte order.
const PREFIX_CEILING: char = '\u{10FFFF}';

/// One page of a listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PaginatedResult<T, M> {
    pub entries: Vec<T>,
    /// Delimiter groups, each reported once across all pages.
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Position to resume from; set only when the page is truncated.
    pub next_marker: Option<M>,
}

impl<T, M> Default for PaginatedResult<T, M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            common_prefixes: Vec::new(),
            is_truncated: false,
            next_marker: None,
        }
    }
}

/// Resume position of a version listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionMarker {
    pub key: String,
    /// `None` resumes after every version of `key`.
    pub version_id: Option<String>,
    /// Exact record, set on markers issued by this engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
}

/// Resume position of an upload listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadMarker {
    pub key: String,
    /// `None` resumes after every upload of `key`.
    pub upload_id: Option<String>,
}

/// Markers that can resume right after a whole key or common prefix.
pub trait KeyMarker {
    fn after_key(key: String) -> Self;
}

impl KeyMarker for String {
    fn after_key(key: String) -> Self {
        key
    }
}

impl KeyMarker for VersionMarker {
    fn after_key(key: String) -> Self {
        Self {
            key,
            version_id: None,
            uuid: None,
        }
    }
}

impl KeyMarker for UploadMarker {
    fn after_key(key: String) -> Self {
        Self {
            key,
            upload_id: None,
        }
    }
}

/// Render a marker as an opaque continuation token.
pub fn encode_token<M: Serialize>(marker: &M) -> MetadataResult<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(marker)?))
}

/// Parse a token produced by [`encode_token`].
pub fn decode_token<M: DeserializeOwned>(token: &str) -> MetadataResult<M> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|err| MetadataError::InvalidArgument(format!("malformed continuation token: {err}")))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Compute a synthetic "common prefix" for S3 list semantics.
///
/// Returns the requested prefix plus everything up to and including the
/// first delimiter after it, or `None` when the key has no delimiter there.
pub(crate) fn compute_common_prefix(key: &str, prefix: &str, delimiter: &str) -> Option<String> {
    if delimiter.is_empty() {
        return None;
    }
    let after_prefix = key.strip_prefix(prefix)?;
    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::with_capacity(prefix.len() + pos + delimiter.len());
    combined.push_str(prefix);
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}

enum Offer {
    Accepted,
    /// Folded into a common prefix already on this or an earlier page.
    Skipped,
    Full,
}

/// Accumulates one page and folds keys into common prefixes.
struct Pager<'a, T, M> {
    prefix: &'a str,
    delimiter: Option<&'a str>,
    max: usize,
    last_prefix: Option<String>,
    last_marker: Option<M>,
    page: PaginatedResult<T, M>,
}

impl<'a, T, M: KeyMarker> Pager<'a, T, M> {
    /// `start_key` is the key of the incoming marker: when it is a common
    /// prefix issued by the previous page, that group is not repeated.
    fn new(prefix: &'a str, delimiter: Option<&'a str>, max: usize, start_key: Option<&str>) -> Self {
        Self {
            prefix,
            delimiter: delimiter.filter(|d| !d.is_empty()),
            max,
            last_prefix: start_key.map(str::to_string),
            last_marker: None,
            page: PaginatedResult::default(),
        }
    }

    fn len(&self) -> usize {
        self.page.entries.len() + self.page.common_prefixes.len()
    }

    fn is_done(&self) -> bool {
        self.page.is_truncated
    }

    fn offer(&mut self, key: &str, entry: T, marker: impl FnOnce(&T) -> M) -> Offer {
        let group = self
            .delimiter
            .and_then(|delimiter| compute_common_prefix(key, self.prefix, delimiter));
        if group.is_some() && group == self.last_prefix {
            return Offer::Skipped;
        }
        if self.len() >= self.max {
            self.page.is_truncated = true;
            return Offer::Full;
        }
        match group {
            Some(group) => {
                self.page.common_prefixes.push(group.clone());
                self.last_marker = Some(M::after_key(group.clone()));
                self.last_prefix = Some(group);
            }
            None => {
                self.last_marker = Some(marker(&entry));
                self.page.entries.push(entry);
            }
        }
        Offer::Accepted
    }

    /// Key every later row can jump to when the last group covers `key`.
    fn skip_target(&self, key: &str) -> Option<String> {
        self.last_prefix
            .as_ref()
            .filter(|group| key.starts_with(group.as_str()))
            .map(|group| format!("{group}{PREFIX_CEILING}"))
    }

    fn finish(mut self) -> PaginatedResult<T, M> {
        if self.page.is_truncated {
            self.page.next_marker = self.last_marker.take();
        }
        self.page
    }
}

/// Position of a row in version order: key ascending, then the same
/// newest-first order repair uses to pick the latest record.
#[derive(Debug, Clone, Default)]
struct VersionCursor {
    key: String,
    last_modified: Option<DateTime<Utc>>,
    creation_timestamp: Option<DateTime<Utc>>,
    uuid: Option<Uuid>,
}

impl VersionCursor {
    fn of(record: &ObjectRecord) -> Self {
        Self {
            key: record.key.clone(),
            last_modified: record.last_modified,
            creation_timestamp: Some(record.creation_timestamp),
            uuid: record.uuid,
        }
    }

    fn after_key(key: String) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }
}

fn is_listable(record: &ObjectRecord) -> bool {
    if record.is_valid_at_rest() {
        return true;
    }
    warn!(bucket = %record.bucket, key = %record.key, uuid = ?record.uuid, state = %record.state(), "skipping corrupt record in listing");
    false
}

impl MetadataService {
    pub(crate) fn clamp_page_size(&self, requested: usize) -> usize {
        requested.min(self.config.max_listing_keys)
    }

    /// Latest visible object of every key, in key order.
    pub async fn list_paginated(
        &self,
        bucket: &Bucket,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_keys: usize,
    ) -> MetadataResult<PaginatedResult<ObjectRecord, String>> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let max_keys = self.clamp_page_size(max_keys);
        let mut pager = Pager::new(prefix, delimiter, max_keys, marker);
        if max_keys == 0 {
            return Ok(pager.finish());
        }
        let batch = max_keys as i64 + 1;
        let mut cursor = marker.unwrap_or_default().to_string();

        loop {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket = "
            ));
            builder.push_bind(&bucket.name);
            builder.push(" AND instr(key, ");
            builder.push_bind(prefix);
            builder.push(
                ") = 1 AND is_latest = 1 AND is_delete_marker = 0 \
                 AND uuid IS NOT NULL AND last_modified IS NOT NULL \
                 AND deleted_timestamp IS NULL AND key > ",
            );
            builder.push_bind(cursor.clone());
            builder.push(" ORDER BY key ASC, last_modified DESC LIMIT ");
            builder.push_bind(batch);

            let rows: Vec<ObjectRecord> = builder.build_query_as().fetch_all(&*self.db).await?;
            let exhausted = (rows.len() as i64) < batch;
            let mut previous: Option<String> = None;
            for record in rows {
                cursor.clone_from(&record.key);
                if previous.as_deref() == Some(record.key.as_str()) {
                    warn!(bucket = %bucket.name, key = %record.key, "several records flagged latest");
                    continue;
                }
                previous = Some(record.key.clone());
                if !is_listable(&record) {
                    continue;
                }
                let key = record.key.clone();
                if let Offer::Full = pager.offer(&key, record, |r| r.key.clone()) {
                    break;
                }
            }
            if pager.is_done() || exhausted {
                break;
            }
            if let Some(target) = pager.skip_target(&cursor) {
                cursor = target;
            }
        }
        Ok(pager.finish())
    }

    /// Every confirmed version in key order, newest first within a key.
    pub async fn list_versions_paginated(
        &self,
        bucket: &Bucket,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&VersionMarker>,
        max_keys: usize,
        include_delete_markers: bool,
    ) -> MetadataResult<PaginatedResult<ObjectRecord, VersionMarker>> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let max_keys = self.clamp_page_size(max_keys);
        let start_key = marker.filter(|m| m.version_id.is_none()).map(|m| m.key.as_str());
        let mut pager = Pager::new(prefix, delimiter, max_keys, start_key);
        if max_keys == 0 {
            return Ok(pager.finish());
        }
        let batch = max_keys as i64 + 1;
        let mut cursor = match marker {
            Some(marker) => self.resolve_version_marker(bucket, marker).await?,
            None => VersionCursor::default(),
        };

        loop {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket = "
            ));
            builder.push_bind(&bucket.name);
            builder.push(" AND instr(key, ");
            builder.push_bind(prefix);
            builder.push(
                ") = 1 AND uuid IS NOT NULL AND last_modified IS NOT NULL \
                 AND deleted_timestamp IS NULL",
            );
            if !include_delete_markers {
                builder.push(" AND is_delete_marker = 0");
            }
            builder.push(" AND (key > ");
            builder.push_bind(cursor.key.clone());
            builder.push(" OR (key = ");
            builder.push_bind(cursor.key.clone());
            builder.push(" AND (last_modified < ");
            builder.push_bind(cursor.last_modified);
            builder.push(" OR (last_modified = ");
            builder.push_bind(cursor.last_modified);
            builder.push(" AND (creation_timestamp < ");
            builder.push_bind(cursor.creation_timestamp);
            builder.push(" OR (creation_timestamp = ");
            builder.push_bind(cursor.creation_timestamp);
            builder.push(" AND uuid < ");
            builder.push_bind(cursor.uuid);
            builder.push(
                ")))))) ORDER BY key ASC, last_modified DESC, creation_timestamp DESC, uuid DESC LIMIT ",
            );
            builder.push_bind(batch);

            let rows: Vec<ObjectRecord> = builder.build_query_as().fetch_all(&*self.db).await?;
            let exhausted = (rows.len() as i64) < batch;
            for record in rows {
                cursor = VersionCursor::of(&record);
                if !is_listable(&record) {
                    continue;
                }
                let key = record.key.clone();
                let offer = pager.offer(&key, record, |r| VersionMarker {
                    key: r.key.clone(),
                    version_id: r.version_id.clone(),
                    uuid: r.uuid,
                });
                if let Offer::Full = offer {
                    break;
                }
            }
            if pager.is_done() || exhausted {
                break;
            }
            if let Some(target) = pager.skip_target(&cursor.key) {
                cursor = VersionCursor::after_key(target);
            }
        }
        Ok(pager.finish())
    }

    async fn resolve_version_marker(
        &self,
        bucket: &Bucket,
        marker: &VersionMarker,
    ) -> MetadataResult<VersionCursor> {
        let Some(version_id) = marker.version_id.as_deref() else {
            return Ok(VersionCursor::after_key(marker.key.clone()));
        };

        if let Some(uuid) = marker.uuid {
            let row: Option<(Option<DateTime<Utc>>, DateTime<Utc>)> = sqlx::query_as(
                "SELECT last_modified, creation_timestamp FROM objects
                 WHERE bucket = ? AND key = ? AND version_id = ? AND uuid = ?",
            )
            .bind(&bucket.name)
            .bind(&marker.key)
            .bind(version_id)
            .bind(uuid)
            .fetch_optional(&*self.db)
            .await?;
            if let Some((Some(last_modified), created)) = row {
                return Ok(VersionCursor {
                    key: marker.key.clone(),
                    last_modified: Some(last_modified),
                    creation_timestamp: Some(created),
                    uuid: Some(uuid),
                });
            }
        }

        let row: Option<(Option<DateTime<Utc>>, DateTime<Utc>, Option<Uuid>)> = sqlx::query_as(
            "SELECT last_modified, creation_timestamp, uuid FROM objects
             WHERE bucket = ? AND key = ? AND version_id = ?
               AND last_modified IS NOT NULL AND uuid IS NOT NULL
             ORDER BY last_modified DESC, creation_timestamp DESC, uuid DESC LIMIT 1",
        )
        .bind(&bucket.name)
        .bind(&marker.key)
        .bind(version_id)
        .fetch_optional(&*self.db)
        .await?;
        match row {
            Some((last_modified, created, uuid)) => Ok(VersionCursor {
                key: marker.key.clone(),
                last_modified,
                creation_timestamp: Some(created),
                uuid,
            }),
            None => Err(MetadataError::InvalidArgument(format!(
                "version marker {}@{} does not exist",
                marker.key, version_id
            ))),
        }
    }

    /// In-progress multipart uploads in key order, then upload id.
    pub async fn list_parts(
        &self,
        bucket: &Bucket,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&UploadMarker>,
        max_uploads: usize,
    ) -> MetadataResult<PaginatedResult<ObjectRecord, UploadMarker>> {
        Self::ensure_bucket_name_safe(&bucket.name)?;
        let max_uploads = self.clamp_page_size(max_uploads);
        let start_key = marker.filter(|m| m.upload_id.is_none()).map(|m| m.key.as_str());
        let mut pager = Pager::new(prefix, delimiter, max_uploads, start_key);
        if max_uploads == 0 {
            return Ok(pager.finish());
        }
        let batch = max_uploads as i64 + 1;
        let (mut cursor_key, mut cursor_upload) = match marker {
            Some(marker) => (marker.key.clone(), marker.upload_id.clone()),
            None => (String::new(), None),
        };

        loop {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket = "
            ));
            builder.push_bind(&bucket.name);
            builder.push(" AND instr(key, ");
            builder.push_bind(prefix);
            builder.push(
                ") = 1 AND upload_id IS NOT NULL AND uuid IS NOT NULL \
                 AND last_modified IS NULL AND deleted_timestamp IS NULL AND (key > ",
            );
            builder.push_bind(cursor_key.clone());
            builder.push(" OR (key = ");
            builder.push_bind(cursor_key.clone());
            builder.push(" AND upload_id > ");
            builder.push_bind(cursor_upload.clone());
            builder.push(")) ORDER BY key ASC, upload_id ASC LIMIT ");
            builder.push_bind(batch);

            let rows: Vec<ObjectRecord> = builder.build_query_as().fetch_all(&*self.db).await?;
            let exhausted = (rows.len() as i64) < batch;
            for record in rows {
                cursor_key.clone_from(&record.key);
                cursor_upload.clone_from(&record.upload_id);
                if !is_listable(&record) {
                    continue;
                }
                let key = record.key.clone();
                let offer = pager.offer(&key, record, |r| UploadMarker {
                    key: r.key.clone(),
                    upload_id: r.upload_id.clone(),
                });
                if let Offer::Full = offer {
                    break;
                }
            }
            if pager.is_done() || exhausted {
                break;
            }
            if let Some(target) = pager.skip_target(&cursor_key) {
                cursor_key = target;
                cursor_upload = None;
            }
        }
        Ok(pager.finish())
    }
}
