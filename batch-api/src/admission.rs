//! Synchronous gating of job submissions.
//!
//! Checks run in a fixed order: input validity, queue depth, total queued
//! request capacity, GPU health, worker liveness. The first failure wins and
//! nothing is inserted; a submission that passes every gate lands as one
//! `pending` row.

use std::str::FromStr;

use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::info;

use batch_common::catalog::Catalog;
use batch_common::dns::is_safe_webhook_host;
use batch_common::error::ErrorKind;
use batch_common::job::{BatchJob, NewBatchJob};
use batch_common::request::{parse_input, CHAT_COMPLETIONS_URL};
use batch_common::store::FileStore;
use batch_common::webhook::WebhookEvent;

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct AdmissionLimits {
    pub max_requests_per_job: usize,
    pub max_queue_depth: i64,
    pub max_total_queued_requests: i64,
    pub gpu_memory_reject_threshold: f64,
    pub gpu_temp_reject_threshold: f64,
    pub worker_liveness_deadline: Duration,
    pub default_completion_window: Duration,
    pub webhook_default_retries: i64,
    pub webhook_default_timeout_s: i64,
    /// Accept webhook URLs on private and loopback hosts. Development only;
    /// delivery enforces the same restriction at DNS resolution time.
    pub allow_internal_webhook_urls: bool,
}

/// A `POST /v1/batches` body.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSubmission {
    pub input_file_id: String,
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub completion_window: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub webhook: Option<WebhookSubmission>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSubmission {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub retries: Option<i64>,
    #[serde(default)]
    pub timeout_s: Option<i64>,
}

pub struct AdmissionController {
    catalog: Catalog,
    store: FileStore,
    limits: AdmissionLimits,
}

impl AdmissionController {
    pub fn new(catalog: Catalog, store: FileStore, limits: AdmissionLimits) -> Self {
        Self {
            catalog,
            store,
            limits,
        }
    }

    /// Admit or reject a submission. On success returns the new pending job
    /// and its queue position (1 = next to run).
    pub async fn admit(&self, submission: &BatchSubmission) -> Result<(BatchJob, i64), ApiError> {
        // 1. The input file must exist, parse, and fit the per-job cap.
        if let Some(endpoint) = &submission.endpoint {
            if endpoint != CHAT_COMPLETIONS_URL {
                return Err(ApiError::invalid_input(format!(
                    "unsupported endpoint {}",
                    endpoint
                )));
            }
        }
        if submission.model.trim().is_empty() {
            return Err(ApiError::invalid_input("model must not be empty"));
        }

        let expires_in = match &submission.completion_window {
            Some(window) => parse_completion_window(window)
                .ok_or_else(|| {
                    ApiError::invalid_input(format!("invalid completion_window {}", window))
                })?,
            None => self.limits.default_completion_window,
        };

        let webhook = submission
            .webhook
            .as_ref()
            .map(|webhook| validate_webhook(webhook, self.limits.allow_internal_webhook_urls))
            .transpose()?;

        let raw = self
            .store
            .get(&submission.input_file_id)
            .map_err(|_| ApiError::invalid_input(format!(
                "input file {} not found",
                submission.input_file_id
            )))?;
        let requests = parse_input(&raw, self.limits.max_requests_per_job)
            .map_err(|err| ApiError::invalid_input(err.to_string()))?;
        let total_requests = requests.len() as i64;

        // 2. Queue depth.
        let active = self.catalog.count_active_jobs().await?;
        if active >= self.limits.max_queue_depth {
            return Err(ApiError::unavailable(
                ErrorKind::QueueFull,
                format!("{} jobs already queued or running", active),
            ));
        }

        // 3. Total queued request capacity.
        let queued = self.catalog.total_queued_requests().await?;
        if queued + total_requests > self.limits.max_total_queued_requests {
            return Err(ApiError::unavailable(
                ErrorKind::CapacityExhausted,
                format!(
                    "{} requests queued, {} more would exceed the cap of {}",
                    queued, total_requests, self.limits.max_total_queued_requests
                ),
            ));
        }

        // 4 & 5. GPU health and worker liveness, as seen via the heartbeat.
        let heartbeat = self.catalog.latest_heartbeat().await?;
        if let Some(heartbeat) = &heartbeat {
            let memory_hot = heartbeat
                .gpu_memory_percent
                .is_some_and(|m| m > self.limits.gpu_memory_reject_threshold);
            let temperature_hot = heartbeat
                .gpu_temperature_c
                .is_some_and(|t| t > self.limits.gpu_temp_reject_threshold);
            if memory_hot || temperature_hot {
                return Err(ApiError::unavailable(
                    ErrorKind::GpuUnhealthy,
                    "gpu is over its memory or temperature threshold",
                ));
            }
        }
        let worker_alive = heartbeat
            .as_ref()
            .is_some_and(|hb| hb.is_fresh(Utc::now(), self.limits.worker_liveness_deadline));
        if !worker_alive {
            return Err(ApiError::unavailable(
                ErrorKind::WorkerUnavailable,
                "no worker heartbeat within the liveness deadline",
            ));
        }

        // Admission holds: the row lands as pending in one statement.
        let queue_position = active + 1;
        let job = self
            .catalog
            .insert_job(&NewBatchJob {
                model: submission.model.clone(),
                input_file_id: submission.input_file_id.clone(),
                total_requests,
                expires_at: Utc::now() + expires_in,
                webhook_url: webhook.as_ref().map(|w| w.url.clone()),
                webhook_secret: webhook.as_ref().and_then(|w| w.secret.clone()),
                webhook_events: webhook.as_ref().and_then(|w| w.events.clone()),
                webhook_retries: webhook
                    .as_ref()
                    .map(|w| w.retries.unwrap_or(self.limits.webhook_default_retries)),
                webhook_timeout_s: webhook
                    .as_ref()
                    .map(|w| w.timeout_s.unwrap_or(self.limits.webhook_default_timeout_s)),
                metadata: submission
                    .metadata
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
            })
            .await?;

        info!(
            job_id = %job.id,
            model = %job.model,
            total_requests,
            queue_position,
            "admitted batch job"
        );
        metrics::counter!("admission_accepted_total").increment(1);

        Ok((job, queue_position))
    }
}

/// A validated webhook submission, events parsed against the closed set.
struct ValidatedWebhook {
    url: String,
    secret: Option<String>,
    events: Option<Vec<WebhookEvent>>,
    retries: Option<i64>,
    timeout_s: Option<i64>,
}

fn validate_webhook(
    webhook: &WebhookSubmission,
    allow_internal_urls: bool,
) -> Result<ValidatedWebhook, ApiError> {
    let parsed = url::Url::parse(&webhook.url)
        .map_err(|_| ApiError::invalid_input(format!("invalid webhook url {}", webhook.url)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::invalid_input(format!(
            "unsupported webhook url scheme {}",
            parsed.scheme()
        )));
    }
    // Raw internal IPs and localhost never make it into the catalog; hostnames
    // that resolve to internal addresses are refused by the delivery client.
    if !allow_internal_urls && !is_safe_webhook_host(&parsed) {
        return Err(ApiError::invalid_input(format!(
            "webhook url {} does not point at a public host",
            webhook.url
        )));
    }

    let events = webhook
        .events
        .as_ref()
        .map(|events| {
            events
                .iter()
                .map(|event| WebhookEvent::from_str(event))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()
        .map_err(ApiError::invalid_input)?;

    Ok(ValidatedWebhook {
        url: webhook.url.clone(),
        secret: webhook.secret.clone(),
        events,
        retries: webhook.retries,
        timeout_s: webhook.timeout_s,
    })
}

/// Parse a completion window like `24h` or `7d`.
fn parse_completion_window(window: &str) -> Option<Duration> {
    let (value, to_duration): (&str, fn(i64) -> Duration) =
        if let Some(hours) = window.strip_suffix('h') {
            (hours, Duration::hours)
        } else if let Some(days) = window.strip_suffix('d') {
            (days, Duration::days)
        } else {
            return None;
        };

    let value: i64 = value.parse().ok()?;
    if value <= 0 {
        return None;
    }
    Some(to_duration(value))
}
