use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of error kinds surfaced in API responses, failed-request
/// rows and webhook dead letters. Serialized as snake_case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    QueueFull,
    CapacityExhausted,
    GpuUnhealthy,
    WorkerUnavailable,
    ModelLoadFailed,
    EngineFailure,
    RequestFailed,
    Cancelled,
    WebhookDeliveryFailed,
    AlreadyRetried,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::CapacityExhausted => "capacity_exhausted",
            ErrorKind::GpuUnhealthy => "gpu_unhealthy",
            ErrorKind::WorkerUnavailable => "worker_unavailable",
            ErrorKind::ModelLoadFailed => "model_load_failed",
            ErrorKind::EngineFailure => "engine_failure",
            ErrorKind::RequestFailed => "request_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::WebhookDeliveryFailed => "webhook_delivery_failed",
            ErrorKind::AlreadyRetried => "already_retried",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_input" => Ok(ErrorKind::InvalidInput),
            "queue_full" => Ok(ErrorKind::QueueFull),
            "capacity_exhausted" => Ok(ErrorKind::CapacityExhausted),
            "gpu_unhealthy" => Ok(ErrorKind::GpuUnhealthy),
            "worker_unavailable" => Ok(ErrorKind::WorkerUnavailable),
            "model_load_failed" => Ok(ErrorKind::ModelLoadFailed),
            "engine_failure" => Ok(ErrorKind::EngineFailure),
            "request_failed" => Ok(ErrorKind::RequestFailed),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "webhook_delivery_failed" => Ok(ErrorKind::WebhookDeliveryFailed),
            "already_retried" => Ok(ErrorKind::AlreadyRetried),
            invalid => Err(format!("{} is not a valid ErrorKind", invalid)),
        }
    }
}

/// Errors raised by the catalog.
/// Wraps sqlx errors to carry the command that failed, as context.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("migration failed with: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("could not serialize json column: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("job {id} cannot transition {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
}

/// Errors raised by the file store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("file {0} not found")]
    NotFound(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while validating an input JSONL file. All of these reject
/// the whole file at admission with `invalid_input`.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("input file is empty")]
    Empty,
    #[error("line {line}: {message}")]
    MalformedLine { line: usize, message: String },
    #[error("line {line}: unsupported method {method}, only POST is accepted")]
    InvalidMethod { line: usize, method: String },
    #[error("line {line}: unsupported url {url}")]
    InvalidUrl { line: usize, url: String },
    #[error("duplicate custom_id {0}")]
    DuplicateCustomId(String),
    #[error("{count} requests exceed the per-job maximum of {max}")]
    TooManyRequests { count: usize, max: usize },
}
