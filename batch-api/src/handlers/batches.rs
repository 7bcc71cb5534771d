use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use batch_common::error::ErrorKind;
use batch_common::job::{BatchJob, FailedRequest, JobStatus};

use crate::admission::BatchSubmission;
use crate::error::ApiError;

use super::AppState;

#[derive(Serialize)]
pub struct CreateBatchResponse {
    pub batch_id: String,
    pub status: JobStatus,
    pub total_requests: i64,
    pub queue_position: i64,
}

/// `POST /v1/batches`: submit a job against an uploaded input file.
pub async fn create(
    State(state): State<AppState>,
    Json(submission): Json<BatchSubmission>,
) -> Result<Json<CreateBatchResponse>, ApiError> {
    let (job, queue_position) = state.admission.admit(&submission).await?;
    Ok(Json(CreateBatchResponse {
        batch_id: job.id,
        status: job.status,
        total_requests: job.total_requests,
        queue_position,
    }))
}

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct ListBatchesResponse {
    pub batches: Vec<BatchJob>,
    pub count: usize,
}

/// `GET /v1/batches`: newest first, optional status filter.
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListBatchesResponse>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(JobStatus::from_str)
        .transpose()
        .map_err(ApiError::invalid_input)?;

    let batches = state.catalog.list_jobs(status).await?;
    let count = batches.len();
    Ok(Json(ListBatchesResponse { batches, count }))
}

/// `GET /v1/batches/{id}`: the full job row, counters included.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatchJob>, ApiError> {
    let job = state
        .catalog
        .get_job(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("batch {} not found", id)))?;
    Ok(Json(job))
}

/// `GET /v1/batches/{id}/results`: the output JSONL of a terminal job.
pub async fn results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .catalog
        .get_job(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("batch {} not found", id)))?;

    if !job.status.is_terminal() {
        return Err(ApiError::conflict(format!(
            "batch {} is {}, results are available once it is terminal",
            id, job.status
        )));
    }
    let output_file_id = job
        .output_file_id
        .ok_or_else(|| ApiError::not_found(format!("batch {} produced no output", id)))?;

    let contents = state.store.get(&output_file_id)?;
    Ok((
        [(header::CONTENT_TYPE, "application/jsonl")],
        contents,
    )
        .into_response())
}

/// `DELETE /v1/batches/{id}`: cancel a queued job. A running job is never
/// preempted and terminal jobs stay as they are; both are conflicts.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let job = state
        .catalog
        .get_job(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("batch {} not found", id)))?;

    match job.status {
        JobStatus::Validating | JobStatus::Pending => {
            if state
                .catalog
                .cas_status(&id, job.status, JobStatus::Cancelled)
                .await?
            {
                metrics::counter!("batches_cancelled_total").increment(1);
                Ok(StatusCode::NO_CONTENT)
            } else {
                // Claimed by the worker between our read and the CAS.
                Err(ApiError::conflict("already_running"))
            }
        }
        JobStatus::InProgress => Err(ApiError::conflict("already_running")),
        _ => Err(ApiError::conflict("terminal")),
    }
}

#[derive(Serialize)]
pub struct FailedRequestResponse {
    pub custom_id: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub retry_count: i64,
}

impl From<FailedRequest> for FailedRequestResponse {
    fn from(row: FailedRequest) -> Self {
        Self {
            custom_id: row.custom_id,
            error_kind: row.error_kind,
            error_message: row.error_message,
            retry_count: row.retry_count,
        }
    }
}

/// `GET /v1/batches/{id}/failed`: the per-request failures of a job.
pub async fn failed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<FailedRequestResponse>>, ApiError> {
    if state.catalog.get_job(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("batch {} not found", id)));
    }

    let failures = state.catalog.list_failed_requests(&id).await?;
    Ok(Json(failures.into_iter().map(Into::into).collect()))
}
