//! Operator endpoints over the metadata engine.
//! Not a client protocol: these expose counts, corrupt rows, repair and
//! garbage sweeping for maintenance.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{bucket::Bucket, object::ObjectRecord, part::PartRecord},
    services::{maintenance::SweepReport, repair::RepairReport},
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct BucketStats {
    pub bucket: String,
    pub raw_entities: i64,
    pub valid: i64,
}

#[derive(Debug, Serialize)]
pub struct CorruptReport {
    pub objects: Vec<ObjectRecord>,
    pub parts: Vec<PartRecord>,
}

#[derive(Debug, Serialize)]
pub struct GarbageReport {
    pub objects: Vec<ObjectRecord>,
    pub parts: Vec<PartRecord>,
}

/// GET `/admin/buckets/{bucket}/stats`
pub async fn bucket_stats(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Json<BucketStats>, AppError> {
    let handle = Bucket::named(&bucket);
    let raw_entities = state.metadata.count_raw_entities(&handle).await?;
    let valid = state.metadata.count_valid(&handle).await?;
    Ok(Json(BucketStats {
        bucket,
        raw_entities,
        valid,
    }))
}

/// GET `/admin/buckets/{bucket}/corrupt`
pub async fn corrupt_records(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Json<CorruptReport>, AppError> {
    let handle = Bucket::named(bucket);
    let objects = state.metadata.find_corrupt(&handle).await?;
    let parts = state.metadata.find_corrupt_parts(&handle).await?;
    Ok(Json(CorruptReport { objects, parts }))
}

/// POST `/admin/buckets/{bucket}/repair/{*key}`
pub async fn repair_key(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<RepairReport>, AppError> {
    let report = state
        .metadata
        .do_full_repair(&Bucket::named(bucket), &key)
        .await?;
    Ok(Json(report))
}

/// GET `/admin/garbage`
pub async fn garbage(State(state): State<AppState>) -> Result<Json<GarbageReport>, AppError> {
    let objects = state.metadata.get_failed_or_deleted().await?;
    let parts = state.metadata.get_deleted_parts().await?;
    Ok(Json(GarbageReport { objects, parts }))
}

/// POST `/admin/sweep` — run one maintenance pass now.
pub async fn sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    let report = state.worker.run_once().await?;
    tracing::info!(?report, "manual sweep completed");
    Ok(Json(report))
}
