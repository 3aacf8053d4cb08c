//! Version history repair.
//!
//! Restores two properties of a key's history: exactly one confirmed,
//! non-tombstoned record carries the latest flag, and every run of adjacent
//! `"null"` versions keeps only its newest member. Older run members are
//! tombstoned, never removed.

use crate::{
    models::{bucket::Bucket, object::ObjectRecord},
    services::{
        error::MetadataResult,
        metadata_service::{MetadataService, OBJECT_COLUMNS, tombstone},
    },
};
use chrono::Utc;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a repair pass did to one key.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RepairReport {
    pub key: String,
    /// Record now flagged latest, `None` when the key has no live history.
    pub latest: Option<Uuid>,
    /// Superseded null versions moved to the tombstoned state.
    pub tombstoned: Vec<Uuid>,
    /// Stale latest flags removed from other records.
    pub latest_flags_cleared: u64,
    /// Whether `latest` had to be flagged by this pass.
    pub latest_flag_set: bool,
    /// Rows skipped because they match no valid state.
    pub corrupt: usize,
}

impl RepairReport {
    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.tombstoned.is_empty() && self.latest_flags_cleared == 0 && !self.latest_flag_set
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct RepairPlan {
    pub latest: Option<Uuid>,
    pub tombstone: Vec<Uuid>,
    pub corrupt: usize,
}

/// Newest first: `last_modified`, then creation time, then uuid.
fn newest_first(a: &ObjectRecord, b: &ObjectRecord) -> Ordering {
    b.last_modified
        .cmp(&a.last_modified)
        .then_with(|| b.creation_timestamp.cmp(&a.creation_timestamp))
        .then_with(|| b.uuid.cmp(&a.uuid))
}

/// Decide the repair of one key from its non-tombstoned rows.
///
/// Pending rows have no place in the history and are ignored. Any record
/// without the `"null"` version id ends a null run.
pub(crate) fn plan_repair(records: Vec<ObjectRecord>) -> RepairPlan {
    let mut plan = RepairPlan::default();
    let mut history = Vec::with_capacity(records.len());
    for record in records {
        if !record.is_valid_at_rest() {
            plan.corrupt += 1;
        } else if record.is_confirmed() {
            history.push(record);
        }
    }
    history.sort_by(newest_first);

    plan.latest = history.first().and_then(|r| r.uuid);
    let mut in_null_run = false;
    for record in &history {
        if !record.is_null_version() {
            in_null_run = false;
            continue;
        }
        if in_null_run {
            plan.tombstone.extend(record.uuid);
        }
        in_null_run = true;
    }
    plan
}

impl MetadataService {
    /// Repair the history of `key`. Idempotent.
    pub async fn do_full_repair(&self, bucket: &Bucket, key: &str) -> MetadataResult<RepairReport> {
        Self::ensure_target(bucket, key)?;
        let mut tx = self.begin_write().await?;

        let records: Vec<ObjectRecord> = sqlx::query_as(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE bucket = ? AND key = ? AND deleted_timestamp IS NULL"
        ))
        .bind(&bucket.name)
        .bind(key)
        .fetch_all(&mut *tx)
        .await?;

        let plan = plan_repair(records);
        if plan.corrupt > 0 {
            warn!(bucket = %bucket.name, key, corrupt = plan.corrupt, "corrupt rows left untouched by repair");
        }

        let now = Utc::now();
        let mut tombstoned = Vec::with_capacity(plan.tombstone.len());
        for uuid in plan.tombstone {
            if tombstone(&mut *tx, uuid, now).await? {
                tombstoned.push(uuid);
            }
        }

        let cleared = match plan.latest {
            Some(latest) => {
                sqlx::query(
                    "UPDATE objects SET is_latest = 0
                     WHERE bucket = ? AND key = ? AND is_latest = 1
                       AND (uuid IS NULL OR uuid != ?)",
                )
                .bind(&bucket.name)
                .bind(key)
                .bind(latest)
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
            None => {
                sqlx::query("UPDATE objects SET is_latest = 0 WHERE bucket = ? AND key = ? AND is_latest = 1")
                    .bind(&bucket.name)
                    .bind(key)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
        };
        let flagged = match plan.latest {
            Some(latest) => {
                sqlx::query("UPDATE objects SET is_latest = 1 WHERE uuid = ? AND is_latest = 0")
                    .bind(latest)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
            None => 0,
        };
        tx.commit().await?;

        let report = RepairReport {
            key: key.to_string(),
            latest: plan.latest,
            tombstoned,
            latest_flags_cleared: cleared,
            latest_flag_set: flagged > 0,
            corrupt: plan.corrupt,
        };
        if report.is_noop() {
            debug!(bucket = %bucket.name, key, latest = ?report.latest, "history already consistent");
        } else {
            info!(
                bucket = %bucket.name,
                key,
                latest = ?report.latest,
                tombstoned = report.tombstoned.len(),
                cleared = report.latest_flags_cleared,
                "repaired history"
            );
        }
        Ok(report)
    }

    /// Keys that a repair pass would change, as `(bucket, key)` pairs.
    ///
    /// Mirrors `plan_repair`: the newest confirmed record must carry the
    /// latest flag, no other row may carry it, and no two adjacent confirmed
    /// records may both be `"null"` versions. Keys whose null versions are
    /// separated by real versions, or whose rows are all corrupt, are not
    /// reported.
    pub async fn keys_needing_repair(&self, limit: i64) -> MetadataResult<Vec<(String, String)>> {
        let keys = sqlx::query_as::<_, (String, String)>(
            "WITH history AS (
                 SELECT bucket, key, uuid, version_id, is_latest,
                        ROW_NUMBER() OVER newest AS position,
                        LAG(version_id) OVER newest AS newer_version
                 FROM objects
                 WHERE deleted_timestamp IS NULL AND key != ''
                   AND uuid IS NOT NULL AND version_id IS NOT NULL
                   AND last_modified IS NOT NULL
                 WINDOW newest AS (
                     PARTITION BY bucket, key
                     ORDER BY last_modified DESC, creation_timestamp DESC, uuid DESC
                 )
             )
             SELECT bucket, key FROM history
              WHERE (position = 1 AND is_latest = 0)
                 OR (version_id = 'null' AND newer_version = 'null')
             UNION
             SELECT o.bucket, o.key FROM objects o
              WHERE o.is_latest = 1
                AND NOT EXISTS (
                    SELECT 1 FROM history h
                     WHERE h.position = 1 AND h.bucket = o.bucket
                       AND h.key = o.key AND h.uuid = o.uuid
                )
             ORDER BY bucket, key
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(keys)
    }
}
