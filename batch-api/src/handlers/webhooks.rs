use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use batch_common::job::WebhookDeadLetter;
use batch_common::webhook::{deliver, WebhookConfig};

use crate::error::ApiError;

use super::AppState;

#[derive(Serialize)]
pub struct DeadLetterListResponse {
    pub dead_letters: Vec<WebhookDeadLetter>,
    pub count: usize,
}

/// `GET /v1/webhooks/dead-letter`: deliveries that exhausted their retries.
pub async fn list_dead_letters(
    State(state): State<AppState>,
) -> Result<Json<DeadLetterListResponse>, ApiError> {
    let dead_letters = state.catalog.list_dead_letters().await?;
    let count = dead_letters.len();
    Ok(Json(DeadLetterListResponse { dead_letters, count }))
}

#[derive(Deserialize)]
pub struct RetryParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize)]
pub struct RetryResponse {
    pub retry_success: bool,
    pub forced: bool,
}

/// `POST /v1/webhooks/dead-letter/{id}/retry[?force=true]`: re-drive a dead
/// letter with the stored payload, through the normal signing and retry
/// logic. Event filtering is bypassed; the letter exists because the job
/// asked for this event in the first place.
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RetryParams>,
) -> Result<Json<RetryResponse>, ApiError> {
    let dead_letter = state
        .catalog
        .get_dead_letter(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("dead letter {} not found", id)))?;

    if dead_letter.retry_success && !params.force {
        return Err(ApiError::already_retried());
    }

    // Delivery settings (secret, retries, timeout) live on the job row; a
    // deleted job falls back to unsigned delivery with defaults.
    let job = state.catalog.get_job(&dead_letter.job_id).await?;
    let config = WebhookConfig::new(
        dead_letter.url.clone(),
        job.as_ref().and_then(|j| j.webhook_secret.clone()),
        None,
        job.as_ref().and_then(|j| j.webhook_retries),
        job.as_ref().and_then(|j| j.webhook_timeout_s),
    );

    let retry_success = deliver(
        &state.webhook_client,
        &config,
        dead_letter.payload.as_bytes(),
        &state.webhook_retry_policy,
    )
    .await
    .is_ok();

    state
        .catalog
        .mark_dead_letter_retried(&id, retry_success, params.force)
        .await?;
    info!(
        dead_letter_id = %id,
        retry_success,
        forced = params.force,
        "re-drove webhook dead letter"
    );

    Ok(Json(RetryResponse {
        retry_success,
        forced: params.force,
    }))
}
