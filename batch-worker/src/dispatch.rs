//! Webhook dispatch for the worker.
//!
//! Terminal notifications are delivered on their own spawned task so that
//! long retry backoffs never block the scheduler loop or heartbeat updates.
//! Exhausted terminal deliveries are persisted as dead letters; progress
//! notifications are fire-and-forget.

use tracing::{error, info, warn};

use batch_common::catalog::Catalog;
use batch_common::job::{BatchJob, JobStatus};
use batch_common::webhook::{self, RetryPolicy, WebhookEvent, WebhookPayload};

pub use batch_common::webhook::build_http_client;

use crate::registry::{HandlerError, ResultHandler, TerminalJobSnapshot};

fn terminal_event(status: JobStatus) -> Option<WebhookEvent> {
    match status {
        JobStatus::Completed => Some(WebhookEvent::Completed),
        JobStatus::Failed => Some(WebhookEvent::Failed),
        _ => None,
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    catalog: Catalog,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl WebhookDispatcher {
    pub fn new(catalog: Catalog, client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self {
            catalog,
            client,
            policy,
        }
    }

    /// Fire the terminal notification for `job` in the background.
    pub fn dispatch_terminal(&self, job: &BatchJob) {
        let dispatcher = self.clone();
        let job = job.clone();
        tokio::spawn(async move {
            dispatcher.send_terminal(&job).await;
        });
    }

    /// Deliver the terminal notification for `job`, dead-lettering on
    /// exhaustion. No-op when the job has no webhook or filtered the event.
    pub async fn send_terminal(&self, job: &BatchJob) {
        let Some(event) = terminal_event(job.status) else {
            return;
        };
        if !job.wants_webhook_event(event) {
            return;
        }
        let Some(config) = job.webhook_config() else {
            return;
        };

        let payload = WebhookPayload::for_job(event, job);
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to serialize webhook payload");
                return;
            }
        };

        match webhook::deliver(&self.client, &config, &body, &self.policy).await {
            Ok(delivery) => {
                info!(
                    job_id = %job.id,
                    event = %event,
                    attempts = delivery.attempts,
                    "webhook delivered"
                );
            }
            Err(failure) => {
                warn!(job_id = %job.id, event = %event, error = %failure, "webhook dead-lettered");
                let payload_text = String::from_utf8_lossy(&body).into_owned();
                if let Err(err) = self
                    .catalog
                    .insert_dead_letter(
                        &job.id,
                        &config.url,
                        event,
                        &payload_text,
                        &failure.last_error,
                        failure.attempts as i64,
                    )
                    .await
                {
                    error!(job_id = %job.id, error = %err, "failed to persist webhook dead letter");
                }
            }
        }
    }

    /// Fire a progress notification in the background. Single attempt, never
    /// dead-lettered; the terminal notification is the durable one.
    pub fn dispatch_progress(&self, job: &BatchJob, completed: i64, failed: i64) {
        if !job.wants_webhook_event(WebhookEvent::Progress) {
            return;
        }
        let Some(mut config) = job.webhook_config() else {
            return;
        };
        config.retries = 1;

        let payload = WebhookPayload {
            event: WebhookEvent::Progress,
            batch_id: job.id.clone(),
            status: JobStatus::InProgress.to_string(),
            total_requests: job.total_requests,
            completed_requests: completed,
            failed_requests: failed,
            timestamp: chrono::Utc::now().timestamp(),
        };

        let client = self.client.clone();
        let policy = self.policy;
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let body = match serde_json::to_vec(&payload) {
                Ok(body) => body,
                Err(_) => return,
            };
            if let Err(failure) = webhook::deliver(&client, &config, &body, &policy).await {
                warn!(job_id = %job_id, error = %failure, "progress webhook dropped");
            }
        });
    }
}

/// The built-in result handler that turns terminal jobs into webhooks.
pub struct WebhookHandler {
    catalog: Catalog,
    dispatcher: WebhookDispatcher,
}

impl WebhookHandler {
    pub fn new(catalog: Catalog, dispatcher: WebhookDispatcher) -> Self {
        Self {
            catalog,
            dispatcher,
        }
    }
}

#[async_trait::async_trait]
impl ResultHandler for WebhookHandler {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn handle(&self, snapshot: &TerminalJobSnapshot) -> Result<(), HandlerError> {
        // The snapshot deliberately omits webhook credentials; refetch the
        // row to build the delivery configuration.
        let job = self
            .catalog
            .get_job(&snapshot.job_id)
            .await
            .map_err(|err| HandlerError {
                handler: "webhook".to_string(),
                message: err.to_string(),
            })?;

        if let Some(job) = job {
            self.dispatcher.dispatch_terminal(&job);
        }
        Ok(())
    }
}
