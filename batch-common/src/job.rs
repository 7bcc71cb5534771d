use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::webhook::{WebhookConfig, WebhookEvent};

/// Lifecycle of a batch job.
///
/// The allowed transitions form a DAG:
/// `validating -> pending -> in_progress -> {completed, failed}`, plus
/// `{validating, pending} -> cancelled` and `{validating, pending} -> expired`.
/// Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    Validating,
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Expired
        )
    }

    /// Whether `from -> to` is a legal edge of the status DAG.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::{Cancelled, Completed, Expired, Failed, InProgress, Pending, Validating};
        matches!(
            (from, to),
            (Validating, Pending)
                | (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Validating, Cancelled)
                | (Pending, Cancelled)
                | (Validating, Expired)
                | (Pending, Expired)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Validating => "validating",
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validating" => Ok(JobStatus::Validating),
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "expired" => Ok(JobStatus::Expired),
            invalid => Err(format!("{} is not a valid JobStatus", invalid)),
        }
    }
}

/// A client-submitted batch of inference requests sharing one model.
///
/// The catalog owns every field here; the only writers are admission
/// (insert), the API (cancel) and the worker (everything else).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BatchJob {
    pub id: String,
    pub model: String,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub status: JobStatus,
    pub total_requests: i64,
    pub completed_requests: i64,
    pub failed_requests: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub webhook_url: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub webhook_events: Option<sqlx::types::Json<Vec<WebhookEvent>>>,
    pub webhook_retries: Option<i64>,
    pub webhook_timeout_s: Option<i64>,
    pub metadata: sqlx::types::Json<serde_json::Value>,
}

impl BatchJob {
    /// Mint the id of the job's output file. Derivable from the job id so a
    /// restarted worker can find a half-written output without a catalog read.
    pub fn output_file_id(&self) -> String {
        match self.id.strip_prefix("batch-") {
            Some(suffix) => format!("file-output-{}", suffix),
            None => format!("file-output-{}", self.id),
        }
    }

    /// The delivery configuration for this job's webhook, if one was set.
    pub fn webhook_config(&self) -> Option<WebhookConfig> {
        let url = self.webhook_url.clone()?;
        Some(WebhookConfig::new(
            url,
            self.webhook_secret.clone(),
            self.webhook_events.as_ref().map(|events| events.0.clone()),
            self.webhook_retries,
            self.webhook_timeout_s,
        ))
    }

    /// Whether `event` passes this job's webhook event filter.
    /// A null filter subscribes to every event.
    pub fn wants_webhook_event(&self, event: WebhookEvent) -> bool {
        if self.webhook_url.is_none() {
            return false;
        }
        match &self.webhook_events {
            Some(events) => events.0.contains(&event),
            None => true,
        }
    }
}

/// Everything admission needs to insert a new job row.
#[derive(Debug, Clone)]
pub struct NewBatchJob {
    pub model: String,
    pub input_file_id: String,
    pub total_requests: i64,
    pub expires_at: DateTime<Utc>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_events: Option<Vec<WebhookEvent>>,
    pub webhook_retries: Option<i64>,
    pub webhook_timeout_s: Option<i64>,
    pub metadata: serde_json::Value,
}

pub fn new_batch_id() -> String {
    format!("batch-{}", Uuid::now_v7())
}

pub fn new_file_id() -> String {
    format!("file-{}", Uuid::now_v7())
}

/// A per-request failure recorded while a job keeps running.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FailedRequest {
    pub job_id: String,
    pub custom_id: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
}

/// What the worker is currently doing, as visible to admission and /health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Loading,
    Running,
    Unloading,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Loading => "loading",
            WorkerStatus::Running => "running",
            WorkerStatus::Unloading => "unloading",
        };
        write!(f, "{}", s)
    }
}

/// Single row per host, refreshed on every poll cycle and chunk boundary.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkerHeartbeat {
    pub host: String,
    pub status: WorkerStatus,
    pub current_job_id: Option<String>,
    pub loaded_model: Option<String>,
    pub gpu_memory_percent: Option<f64>,
    pub gpu_temperature_c: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

impl WorkerHeartbeat {
    pub fn is_fresh(&self, now: DateTime<Utc>, deadline: chrono::Duration) -> bool {
        now - self.last_seen < deadline
    }
}

/// A webhook delivery that exhausted its retries, kept for manual re-drive.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookDeadLetter {
    pub id: String,
    pub job_id: String,
    pub url: String,
    pub event: WebhookEvent,
    pub payload: String,
    pub error_message: String,
    pub attempt_count: i64,
    pub retry_success: bool,
    pub forced: bool,
    pub created_at: DateTime<Utc>,
    pub last_retried_at: Option<DateTime<Utc>>,
}
