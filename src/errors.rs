use crate::services::error::MetadataError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<MetadataError> for AppError {
    fn from(err: MetadataError) -> Self {
        let status = match &err {
            MetadataError::InvalidBucketName { .. }
            | MetadataError::InvalidObjectKey
            | MetadataError::InvalidPartNumber(_)
            | MetadataError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            MetadataError::ObjectNotFound { .. } | MetadataError::UploadNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            MetadataError::CorruptRecord { .. } => StatusCode::CONFLICT,
            MetadataError::Backend(_) => StatusCode::BAD_GATEWAY,
            MetadataError::Interrupted(_) | MetadataError::Sqlx(_) | MetadataError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::error::BackendError;

    #[test]
    fn maps_metadata_errors_to_statuses() {
        let cases = [
            (MetadataError::InvalidObjectKey, StatusCode::BAD_REQUEST),
            (
                MetadataError::UploadNotFound {
                    bucket: "photos".into(),
                    upload_id: "u".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                MetadataError::Backend(BackendError::Rejected("full".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                MetadataError::CorruptRecord {
                    uuid: None,
                    key: "k".into(),
                    reason: "no uuid".into(),
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
