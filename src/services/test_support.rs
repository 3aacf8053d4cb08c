//! Fixtures shared by the service tests.

use crate::{
    config::MetadataConfig,
    models::bucket::{Bucket, VersioningStatus},
    services::{
        backend::ContentReceipt,
        error::BackendError,
        metadata_service::MetadataService,
        protocol::BackendOp,
        schema,
    },
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub const BUCKET: &str = "photos";

pub async fn service() -> MetadataService {
    service_with(MetadataConfig::default()).await
}

pub async fn service_with(config: MetadataConfig) -> MetadataService {
    let pool = schema::memory_pool().await.unwrap();
    MetadataService::new(Arc::new(pool), config)
}

pub fn bucket(versioning: VersioningStatus) -> Bucket {
    Bucket::new(BUCKET, "owner-1", versioning)
}

/// Backend write that succeeds with `size` bytes at `at`.
pub fn stored(size: i64, at: DateTime<Utc>) -> BackendOp<ContentReceipt> {
    BackendOp::without_rollback(async move {
        Ok::<_, BackendError>(ContentReceipt::new(format!("etag-{size}"), size).at(at))
    })
}

/// Backend write that succeeds now.
pub fn stored_now(size: i64) -> BackendOp<ContentReceipt> {
    stored(size, Utc::now())
}

/// Backend write that fails.
pub fn rejected() -> BackendOp<ContentReceipt> {
    BackendOp::without_rollback(async {
        Err::<ContentReceipt, _>(BackendError::Rejected("backend unavailable".into()))
    })
}
