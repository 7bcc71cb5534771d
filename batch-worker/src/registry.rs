//! Explicit registry of side-effect handlers that run once per terminal job.
//!
//! Handlers are registered at process start; there is no runtime discovery.
//! They see an immutable snapshot of the job and may touch external systems,
//! but never the catalog directly.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use batch_common::job::{BatchJob, JobStatus};

/// What a handler is allowed to see: the job at terminal time, frozen.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalJobSnapshot {
    pub job_id: String,
    pub model: String,
    pub status: JobStatus,
    pub total_requests: i64,
    pub completed_requests: i64,
    pub failed_requests: i64,
    pub output_file_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl TerminalJobSnapshot {
    pub fn from_job(job: &BatchJob) -> Self {
        Self {
            job_id: job.id.clone(),
            model: job.model.clone(),
            status: job.status,
            total_requests: job.total_requests,
            completed_requests: job.completed_requests,
            failed_requests: job.failed_requests,
            output_file_id: job.output_file_id.clone(),
            metadata: job.metadata.0.clone(),
        }
    }
}

#[derive(Error, Debug)]
#[error("handler {handler} failed: {message}")]
pub struct HandlerError {
    pub handler: String,
    pub message: String,
}

/// A terminal-completion side effect.
///
/// `priority` orders handlers (lower runs first, ties broken by registration
/// order). A failing handler gets its own `on_error` callback and is logged,
/// but never blocks or aborts the handlers after it.
#[async_trait]
pub trait ResultHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> i32 {
        100
    }

    fn enabled(&self, _snapshot: &TerminalJobSnapshot) -> bool {
        true
    }

    async fn handle(&self, snapshot: &TerminalJobSnapshot) -> Result<(), HandlerError>;

    fn on_error(&self, _error: &HandlerError) {}
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn ResultHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Register a handler. Sorting is stable, so handlers with equal
    /// priority keep their registration order.
    pub fn register(&mut self, handler: Box<dyn ResultHandler>) {
        self.handlers.push(handler);
        self.handlers.sort_by_key(|h| h.priority());
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every enabled handler against the snapshot, in priority order.
    pub async fn run(&self, snapshot: &TerminalJobSnapshot) {
        for handler in &self.handlers {
            if !handler.enabled(snapshot) {
                continue;
            }
            info!(
                job_id = %snapshot.job_id,
                handler = handler.name(),
                "running result handler"
            );
            if let Err(err) = handler.handle(snapshot).await {
                error!(
                    job_id = %snapshot.job_id,
                    handler = handler.name(),
                    error = %err,
                    "result handler failed"
                );
                handler.on_error(&err);
            }
        }
    }
}
