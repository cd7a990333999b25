//! `GET /healthz` and `GET /readyz`.

use crate::{services::blob_store::LocalBlobStore, state::AppState};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

const PROBE_BYTES: &[u8] = b"readyz";

/// Liveness. Never touches the database or the disk.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Readiness: the local blob database answers and the storage root is
/// writable. 503 when either check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("blob_store", blob_store_check(&state.blob_store).await);
    checks.insert("disk", disk_check(state.storage.base_path()).await);

    let ready = checks.values().all(|check| check.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        checks,
    };
    (status, Json(body))
}

async fn blob_store_check(store: &LocalBlobStore) -> CheckStatus {
    let Some(pool) = store.pool() else {
        return CheckStatus::failed(format!(
            "blob store unavailable: {}",
            store.unavailable_reason().unwrap_or("unknown")
        ));
    };
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(1) => CheckStatus::passed(),
        Ok(other) => CheckStatus::failed(format!("unexpected result: {other}")),
        Err(err) => CheckStatus::failed(err.to_string()),
    }
}

/// Round-trips a scratch file under the storage root.
async fn disk_check(root: &Path) -> CheckStatus {
    let scratch = root.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(err) = fs::write(&scratch, PROBE_BYTES).await {
        return CheckStatus::failed(format!("write failed: {err}"));
    }

    let read_back = fs::read(&scratch).await;
    let removed = fs::remove_file(&scratch).await;
    match (read_back, removed) {
        (Ok(bytes), _) if bytes != PROBE_BYTES => CheckStatus::failed("read back different bytes"),
        (Ok(_), Ok(())) => CheckStatus::passed(),
        (Ok(_), Err(err)) => CheckStatus {
            ok: true,
            error: Some(format!("scratch file left behind: {err}")),
        },
        (Err(err), _) => CheckStatus::failed(format!("read failed: {err}")),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Debug, Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn passed() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(reason.into()),
        }
    }
}
