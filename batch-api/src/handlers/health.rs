use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::error::ApiError;

use super::AppState;

/// `GET /health`: worker, GPU and queue state in one view. 503 while no
/// worker heartbeat is fresh, since submissions would be rejected anyway.
pub async fn health(State(state): State<AppState>) -> Result<Response, ApiError> {
    let heartbeat = state.catalog.latest_heartbeat().await?;
    let active_jobs = state.catalog.count_active_jobs().await?;
    let queued_requests = state.catalog.total_queued_requests().await?;

    let worker_available = heartbeat
        .as_ref()
        .is_some_and(|hb| hb.is_fresh(Utc::now(), state.worker_liveness_deadline));

    let body = json!({
        "worker": heartbeat.as_ref().map(|hb| json!({
            "host": hb.host,
            "status": hb.status,
            "current_job_id": hb.current_job_id,
            "loaded_model": hb.loaded_model,
            "last_seen": hb.last_seen,
            "available": worker_available,
        })),
        "gpu": heartbeat.as_ref().map(|hb| json!({
            "memory_percent": hb.gpu_memory_percent,
            "temperature_c": hb.gpu_temperature_c,
        })),
        "queue": {
            "active_jobs": active_jobs,
            "queued_requests": queued_requests,
        },
    });

    let status = if worker_available {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(body)).into_response())
}
