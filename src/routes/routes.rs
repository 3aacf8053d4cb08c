//! Defines routes of the operator surface.
//!
//! ## Structure
//! - **Probes**
//!   - `GET  /healthz` — liveness
//!   - `GET  /readyz` — SQLite and backend readiness
//!
//! - **Maintenance endpoints**
//!   - `GET  /admin/buckets/{bucket}/stats` — raw and valid record counts
//!   - `GET  /admin/buckets/{bucket}/corrupt` — rows matching no valid state
//!   - `POST /admin/buckets/{bucket}/repair/{*key}` — repair one key's history
//!   - `GET  /admin/garbage` — failed or deleted objects and parts
//!   - `POST /admin/sweep` — run one maintenance pass
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::handlers::{
    AppState,
    admin_handlers::{bucket_stats, corrupt_records, garbage, repair_key, sweep},
    health_handlers::{healthz, readyz},
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router; handlers share [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // bucket-scoped maintenance
        .route("/admin/buckets/{bucket}/stats", get(bucket_stats))
        .route("/admin/buckets/{bucket}/corrupt", get(corrupt_records))
        .route("/admin/buckets/{bucket}/repair/{*key}", post(repair_key))
        // global maintenance
        .route("/admin/garbage", get(garbage))
        .route("/admin/sweep", post(sweep))
}
