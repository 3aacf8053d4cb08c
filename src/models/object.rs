//! Represents one observation of an object key in a bucket: a version, a
//! delete marker, an in-progress upload, or a tombstoned row awaiting removal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Version id sentinel for writes made while versioning was not enabled.
pub const NULL_VERSION_ID: &str = "null";

/// Default storage class for new records.
pub const STANDARD_STORAGE_CLASS: &str = "STANDARD";

/// A single row of the `objects` table.
///
/// The combination of `uuid`, `last_modified`, `version_id`,
/// `is_delete_marker` and `deleted_timestamp` determines the lifecycle state;
/// see [`ObjectRecord::state`].
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ObjectRecord {
    /// Name of the owning bucket.
    pub bucket: String,

    /// Object key (path-like identifier within the bucket). Never empty.
    pub key: String,

    /// Internal identifier, assigned when the row is first persisted.
    pub uuid: Option<Uuid>,

    /// `Some("null")` for unversioned writes, a real id under versioning,
    /// `None` only before the row is persisted.
    pub version_id: Option<String>,

    /// Marks a delete-marker entry. No backend payload is guaranteed.
    pub is_delete_marker: bool,

    /// Latest designation, maintained exclusively by repair.
    pub is_latest: bool,

    /// Set once the backend confirmed the content.
    pub last_modified: Option<DateTime<Utc>>,

    /// Set when the row is queued for physical removal.
    pub deleted_timestamp: Option<DateTime<Utc>>,

    /// When the row was first written; drives pending-upload timeouts.
    pub creation_timestamp: DateTime<Utc>,

    /// Size in bytes of the stored content.
    pub size: i64,

    /// Content digest reported by the backend.
    pub etag: Option<String>,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Storage class (e.g., STANDARD).
    pub storage_class: String,

    /// Multipart upload this record is assembled from, if any.
    pub upload_id: Option<String>,

    /// Canonical id of the account that wrote the record.
    pub owner_id: Option<String>,

    /// Access control policy serialized as JSON.
    pub acp: Option<String>,
}

impl ObjectRecord {
    /// A fresh, not yet persisted record (state B).
    pub fn initialize(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            uuid: None,
            version_id: None,
            is_delete_marker: false,
            is_latest: false,
            last_modified: None,
            deleted_timestamp: None,
            creation_timestamp: Utc::now(),
            size: 0,
            etag: None,
            content_type: None,
            storage_class: STANDARD_STORAGE_CLASS.to_string(),
            upload_id: None,
            owner_id: None,
            acp: None,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    /// Links the record to a multipart upload.
    pub fn with_upload_id(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    /// Classify the record against the lifecycle table.
    pub fn state(&self) -> ObjectState {
        if self.key.is_empty() {
            return ObjectState::Corrupt {
                reason: "record has no key",
            };
        }
        if self.deleted_timestamp.is_some() {
            return ObjectState::Tombstoned;
        }

        match (
            self.uuid,
            self.last_modified,
            self.version_id.as_deref(),
            self.is_delete_marker,
        ) {
            (None, None, None, false) => ObjectState::Transient,
            (None, _, _, _) => ObjectState::Corrupt {
                reason: "persisted fields set on a record without uuid",
            },
            (Some(_), None, Some(NULL_VERSION_ID), false) => ObjectState::Pending,
            (Some(_), None, _, _) => ObjectState::Corrupt {
                reason: "unconfirmed record must be a non-marker null version",
            },
            (Some(_), Some(_), None, _) => ObjectState::Corrupt {
                reason: "confirmed record has no version id",
            },
            (Some(_), Some(_), Some(NULL_VERSION_ID), false) => ObjectState::Unversioned,
            (Some(_), Some(_), Some(_), false) => ObjectState::Versioned,
            (Some(_), Some(_), Some(NULL_VERSION_ID), true) => ObjectState::SuspendedDeleteMarker,
            (Some(_), Some(_), Some(_), true) => ObjectState::VersionedDeleteMarker,
        }
    }

    /// True for every state that may legitimately be found in the table.
    pub fn is_valid_at_rest(&self) -> bool {
        !matches!(
            self.state(),
            ObjectState::Transient | ObjectState::Corrupt { .. }
        )
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_timestamp.is_some()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state().is_confirmed()
    }

    pub fn is_null_version(&self) -> bool {
        self.version_id.as_deref() == Some(NULL_VERSION_ID)
    }

    /// Version id as shown to clients; pending and transient rows show `"null"`.
    pub fn display_version_id(&self) -> &str {
        self.version_id.as_deref().unwrap_or(NULL_VERSION_ID)
    }
}

/// Lifecycle state of an [`ObjectRecord`].
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ObjectState {
    /// B: initialized, never persisted. Invalid at rest.
    Transient,
    /// C: persisted, waiting for backend confirmation.
    Pending,
    /// D: confirmed, unversioned.
    Unversioned,
    /// E: confirmed, versioned.
    Versioned,
    /// F: delete marker written while versioning was suspended.
    SuspendedDeleteMarker,
    /// G: delete marker with a real version id.
    VersionedDeleteMarker,
    /// H: queued for physical removal.
    Tombstoned,
    /// Any combination not covered above.
    Corrupt { reason: &'static str },
}

impl ObjectState {
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self,
            Self::Unversioned
                | Self::Versioned
                | Self::SuspendedDeleteMarker
                | Self::VersionedDeleteMarker
        )
    }

    pub fn is_delete_marker(&self) -> bool {
        matches!(
            self,
            Self::SuspendedDeleteMarker | Self::VersionedDeleteMarker
        )
    }

    /// Single-letter code used in logs.
    pub fn code(&self) -> char {
        match self {
            Self::Transient => 'B',
            Self::Pending => 'C',
            Self::Unversioned => 'D',
            Self::Versioned => 'E',
            Self::SuspendedDeleteMarker => 'F',
            Self::VersionedDeleteMarker => 'G',
            Self::Tombstoned => 'H',
            Self::Corrupt { .. } => 'A',
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { reason } => write!(f, "corrupt ({reason})"),
            other => write!(f, "{}", other.code()),
        }
    }
}
