//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and the backend store

use crate::{
    handlers::AppState,
    services::backend::{BackendKey, BackendStore},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

const PROBE_BUCKET: &str = "readyz-probe";
const PROBE_BODY: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Stores, reads back and deletes a probe payload through the backend.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.metadata.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    let backend_check = probe_backend(state.backend.as_ref()).await;

    let overall_ok = sqlite_check.ok && backend_check.ok;
    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite_check);
    checks.insert("backend", backend_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn probe_backend(backend: &dyn BackendStore) -> CheckStatus {
    let key = BackendKey::new(PROBE_BUCKET, Uuid::new_v4().to_string(), "probe");
    let body = stream::iter(vec![Ok(Bytes::from_static(PROBE_BODY))]).boxed();

    if let Err(e) = backend.put(&key, body).await {
        return CheckStatus::failed(format!("could not write probe: {}", e));
    }
    let read = match backend.get(&key).await {
        Ok(stream) => stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    let removed = backend.delete(&key).await;

    match (read, removed) {
        (Ok(bytes), Ok(())) if bytes == PROBE_BODY => CheckStatus::ok(),
        (Ok(bytes), Err(e)) if bytes == PROBE_BODY => CheckStatus {
            ok: true,
            error: Some(format!("could not remove probe: {}", e)),
        },
        (Ok(_), _) => CheckStatus::failed("probe content mismatch".to_string()),
        (Err(e), _) => CheckStatus::failed(format!("could not read probe: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::FsBackend;

    #[tokio::test]
    async fn backend_probe_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let check = probe_backend(&backend).await;
        assert!(check.ok, "{:?}", check.error);
        assert!(check.error.is_none());
        assert!(!dir.path().join(PROBE_BUCKET).read_dir().unwrap().any(|_| true));
    }
}
