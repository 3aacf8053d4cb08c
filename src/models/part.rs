//! Represents a single part uploaded as part of a multipart upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Smallest part number accepted by S3.
pub const MIN_PART_NUMBER: i32 = 1;

/// Largest part number accepted by S3.
pub const MAX_PART_NUMBER: i32 = 10_000;

/// Progress of a part through upload and cleanup.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartState {
    /// Row written, backend upload not yet confirmed.
    Pending,
    /// Backend confirmed the part.
    Completed,
    /// Queued for backend removal and physical deletion.
    Deleting,
    /// Stored value not recognized by this build.
    Unknown,
}

impl PartState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Deleting => "deleting",
            Self::Unknown => "unknown",
        }
    }

    /// Total parse: unrecognized values become [`PartState::Unknown`].
    pub fn parse(input: &str) -> Self {
        match input {
            "pending" => Self::Pending,
            "completed" => Self::Completed,
            "deleting" => Self::Deleting,
            _ => Self::Unknown,
        }
    }
}

impl From<String> for PartState {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl fmt::Display for PartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row of the `parts` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct PartRecord {
    /// Internal identifier, also the backend name of the part payload.
    pub uuid: Uuid,

    /// Name of the owning bucket.
    pub bucket: String,

    /// Key of the object being assembled.
    pub key: String,

    /// Upload this part belongs to.
    pub upload_id: String,

    /// Part number (1-based).
    pub part_number: i32,

    /// Size in bytes.
    pub size: i64,

    /// ETag reported by the backend.
    pub etag: Option<String>,

    #[sqlx(try_from = "String")]
    pub state: PartState,

    /// When the part row was first written.
    pub creation_timestamp: DateTime<Utc>,

    /// When the backend confirmed the part.
    pub last_modified: Option<DateTime<Utc>>,

    /// When the part was queued for removal.
    pub deleted_timestamp: Option<DateTime<Utc>>,
}

impl PartRecord {
    /// A new pending part for `upload_id`.
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        upload_id: impl Into<String>,
        part_number: i32,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            bucket: bucket.into(),
            key: key.into(),
            upload_id: upload_id.into(),
            part_number,
            size: 0,
            etag: None,
            state: PartState::Pending,
            creation_timestamp: Utc::now(),
            last_modified: None,
            deleted_timestamp: None,
        }
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.state == PartState::Completed
    }

    pub fn is_deletion_pending(&self) -> bool {
        self.state == PartState::Deleting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_state_parse_is_total() {
        assert_eq!(PartState::parse("pending"), PartState::Pending);
        assert_eq!(PartState::parse("completed"), PartState::Completed);
        assert_eq!(PartState::parse("deleting"), PartState::Deleting);
        assert_eq!(PartState::parse("COMPLETED"), PartState::Unknown);
        assert_eq!(PartState::from(String::from("archived")), PartState::Unknown);
    }

    #[test]
    fn new_part_starts_pending() {
        let part = PartRecord::new("photos", "big.iso", "upload-1", 3).with_size(42);
        assert_eq!(part.state, PartState::Pending);
        assert_eq!(part.size, 42);
        assert!(!part.is_completed());
        assert!(!part.is_deletion_pending());
    }
}
