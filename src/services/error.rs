use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by the backend content store.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend object `{0}` not found")]
    NotFound(String),
    #[error("backend rejected the operation: {0}")]
    Rejected(String),
    #[error("backend operation panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("invalid part number {0}")]
    InvalidPartNumber(i32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("object `{key}` (version {version}) not found in bucket `{bucket}`")]
    ObjectNotFound {
        bucket: String,
        key: String,
        version: String,
    },
    #[error("upload `{upload_id}` not found in bucket `{bucket}`")]
    UploadNotFound { bucket: String, upload_id: String },
    #[error("corrupt record {uuid:?} for key `{key}`: {reason}")]
    CorruptRecord {
        uuid: Option<Uuid>,
        key: String,
        reason: String,
    },
    #[error("content store error: {0}")]
    Backend(#[from] BackendError),
    #[error("mutation task interrupted: {0}")]
    Interrupted(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;
