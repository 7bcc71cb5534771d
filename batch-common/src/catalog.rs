//! Durable state for jobs, failed requests, the worker heartbeat and webhook
//! dead letters, backed by a SQLite database next to the worker.
//!
//! Every status change goes through a compare-and-swap UPDATE so that a lost
//! race (a job cancelled between read and claim, two workers after the same
//! row) shows up as zero affected rows instead of a corrupted transition.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::error::{CatalogError, ErrorKind};
use crate::job::{
    BatchJob, FailedRequest, JobStatus, NewBatchJob, WebhookDeadLetter, WorkerHeartbeat,
    new_batch_id,
};
use crate::webhook::WebhookEvent;

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Connect to the database at `url`, creating it if missing, and bring
    /// the schema up to date.
    pub async fn connect(url: &str, max_connections: u32) -> CatalogResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|error| CatalogError::ConnectionError { error })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|error| CatalogError::ConnectionError { error })?;

        let catalog = Self { pool };
        catalog.migrate().await?;
        Ok(catalog)
    }

    /// Wrap an existing pool. The caller is responsible for migrations.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> CatalogResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ---- jobs ----

    /// Insert a new job directly in `pending`, as one statement. Admission
    /// finishes validating the input before calling this, so either the whole
    /// row lands visible to the queue or nothing does.
    pub async fn insert_job(&self, new: &NewBatchJob) -> CatalogResult<BatchJob> {
        let job = BatchJob {
            id: new_batch_id(),
            model: new.model.clone(),
            input_file_id: new.input_file_id.clone(),
            output_file_id: None,
            status: JobStatus::Pending,
            total_requests: new.total_requests,
            completed_requests: 0,
            failed_requests: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: new.expires_at,
            webhook_url: new.webhook_url.clone(),
            webhook_secret: new.webhook_secret.clone(),
            webhook_events: new.webhook_events.clone().map(sqlx::types::Json),
            webhook_retries: new.webhook_retries,
            webhook_timeout_s: new.webhook_timeout_s,
            metadata: sqlx::types::Json(new.metadata.clone()),
        };

        sqlx::query(
            r#"
INSERT INTO batch_jobs
    (id, model, input_file_id, output_file_id, status, total_requests,
     completed_requests, failed_requests, created_at, started_at, completed_at,
     expires_at, webhook_url, webhook_secret, webhook_events, webhook_retries,
     webhook_timeout_s, metadata)
VALUES
    (?1, ?2, ?3, NULL, ?4, ?5, 0, 0, ?6, NULL, NULL, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&job.id)
        .bind(&job.model)
        .bind(&job.input_file_id)
        .bind(job.status)
        .bind(job.total_requests)
        .bind(job.created_at)
        .bind(job.expires_at)
        .bind(&job.webhook_url)
        .bind(&job.webhook_secret)
        .bind(&job.webhook_events)
        .bind(job.webhook_retries)
        .bind(job.webhook_timeout_s)
        .bind(&job.metadata)
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("INSERT batch_jobs", error))?;

        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> CatalogResult<Option<BatchJob>> {
        sqlx::query_as::<_, BatchJob>("SELECT * FROM batch_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| query_error("SELECT batch_jobs", error))
    }

    /// List jobs, newest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> CatalogResult<Vec<BatchJob>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, BatchJob>(
                    "SELECT * FROM batch_jobs WHERE status = ?1 ORDER BY created_at DESC, id DESC",
                )
                .bind(status)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, BatchJob>(
                    "SELECT * FROM batch_jobs ORDER BY created_at DESC, id DESC",
                )
                .fetch_all(&self.pool)
                .await
            }
        };
        jobs.map_err(|error| query_error("SELECT batch_jobs", error))
    }

    /// The oldest pending job, FIFO by creation time.
    pub async fn get_next_pending(&self) -> CatalogResult<Option<BatchJob>> {
        sqlx::query_as::<_, BatchJob>(
            "SELECT * FROM batch_jobs WHERE status = ?1 ORDER BY created_at, id LIMIT 1",
        )
        .bind(JobStatus::Pending)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| query_error("SELECT batch_jobs", error))
    }

    /// The job this host left running before a crash, if any.
    pub async fn get_in_progress(&self) -> CatalogResult<Option<BatchJob>> {
        sqlx::query_as::<_, BatchJob>("SELECT * FROM batch_jobs WHERE status = ?1 LIMIT 1")
            .bind(JobStatus::InProgress)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| query_error("SELECT batch_jobs", error))
    }

    /// Compare-and-swap a job's status. Returns false if the row was not in
    /// `from` anymore (lost race); errors if `from -> to` is not a legal edge.
    ///
    /// Stamps `started_at` when entering `in_progress` and `completed_at`
    /// when entering `completed` or `failed`.
    pub async fn cas_status(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> CatalogResult<bool> {
        if !JobStatus::can_transition(from, to) {
            return Err(CatalogError::InvalidTransition {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let result = match to {
            JobStatus::InProgress => {
                sqlx::query(
                    r#"
UPDATE batch_jobs
SET status = ?3, started_at = ?4
WHERE id = ?1 AND status = ?2
                    "#,
                )
                .bind(id)
                .bind(from)
                .bind(to)
                .bind(now)
                .execute(&self.pool)
                .await
            }
            JobStatus::Completed | JobStatus::Failed => {
                sqlx::query(
                    r#"
UPDATE batch_jobs
SET status = ?3, completed_at = ?4
WHERE id = ?1 AND status = ?2
                    "#,
                )
                .bind(id)
                .bind(from)
                .bind(to)
                .bind(now)
                .execute(&self.pool)
                .await
            }
            _ => {
                sqlx::query("UPDATE batch_jobs SET status = ?3 WHERE id = ?1 AND status = ?2")
                    .bind(id)
                    .bind(from)
                    .bind(to)
                    .execute(&self.pool)
                    .await
            }
        };

        let result = result.map_err(|error| query_error("UPDATE batch_jobs", error))?;
        Ok(result.rows_affected() == 1)
    }

    /// Best-effort per-chunk progress update. The output file, not these
    /// counters, is the source of truth on restart.
    pub async fn increment_counters(
        &self,
        id: &str,
        completed_delta: i64,
        failed_delta: i64,
    ) -> CatalogResult<()> {
        sqlx::query(
            r#"
UPDATE batch_jobs
SET completed_requests = completed_requests + ?2,
    failed_requests = failed_requests + ?3
WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(completed_delta)
        .bind(failed_delta)
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("UPDATE batch_jobs", error))?;
        Ok(())
    }

    /// Reset counters to match an output file's contents after a resume.
    pub async fn reset_counters(
        &self,
        id: &str,
        completed: i64,
        failed: i64,
    ) -> CatalogResult<()> {
        sqlx::query(
            "UPDATE batch_jobs SET completed_requests = ?2, failed_requests = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(completed)
        .bind(failed)
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("UPDATE batch_jobs", error))?;
        Ok(())
    }

    /// Record the output file id the first time the executor appends for the
    /// job. Returns false if it was already set; it is never rewritten.
    pub async fn set_output_file_once(&self, id: &str, file_id: &str) -> CatalogResult<bool> {
        let result = sqlx::query(
            "UPDATE batch_jobs SET output_file_id = ?2 WHERE id = ?1 AND output_file_id IS NULL",
        )
        .bind(id)
        .bind(file_id)
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("UPDATE batch_jobs", error))?;
        Ok(result.rows_affected() == 1)
    }

    /// Jobs the admission queue-depth cap counts: pending or running.
    pub async fn count_active_jobs(&self) -> CatalogResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM batch_jobs WHERE status IN (?1, ?2)",
        )
        .bind(JobStatus::Pending)
        .bind(JobStatus::InProgress)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| query_error("SELECT batch_jobs", error))
    }

    /// Outstanding (not yet executed) requests across all non-terminal jobs.
    pub async fn total_queued_requests(&self) -> CatalogResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
SELECT COALESCE(SUM(total_requests - completed_requests - failed_requests), 0)
FROM batch_jobs
WHERE status IN (?1, ?2, ?3)
            "#,
        )
        .bind(JobStatus::Validating)
        .bind(JobStatus::Pending)
        .bind(JobStatus::InProgress)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| query_error("SELECT batch_jobs", error))
    }

    /// Expire overdue jobs that never started running. Terminal and
    /// in-progress rows are left alone. Returns how many rows flipped.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> CatalogResult<u64> {
        let result = sqlx::query(
            r#"
UPDATE batch_jobs
SET status = ?3
WHERE status IN (?1, ?2) AND expires_at <= ?4
            "#,
        )
        .bind(JobStatus::Validating)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Expired)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("UPDATE batch_jobs", error))?;
        Ok(result.rows_affected())
    }

    // ---- failed requests ----

    pub async fn insert_failed_request(
        &self,
        job_id: &str,
        custom_id: &str,
        error_kind: ErrorKind,
        error_message: &str,
    ) -> CatalogResult<()> {
        sqlx::query(
            r#"
INSERT INTO failed_requests
    (job_id, custom_id, error_kind, error_message, retry_count, created_at)
VALUES
    (?1, ?2, ?3, ?4, 0, ?5)
            "#,
        )
        .bind(job_id)
        .bind(custom_id)
        .bind(error_kind)
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("INSERT failed_requests", error))?;
        Ok(())
    }

    pub async fn list_failed_requests(&self, job_id: &str) -> CatalogResult<Vec<FailedRequest>> {
        sqlx::query_as::<_, FailedRequest>(
            r#"
SELECT job_id, custom_id, error_kind, error_message, retry_count, created_at
FROM failed_requests
WHERE job_id = ?1
ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| query_error("SELECT failed_requests", error))
    }

    // ---- worker heartbeat ----

    /// Upsert this host's heartbeat row. Never rides a job CAS transaction,
    /// so a slow status change cannot starve liveness reporting.
    pub async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> CatalogResult<()> {
        sqlx::query(
            r#"
INSERT INTO worker_heartbeat
    (host, status, current_job_id, loaded_model, gpu_memory_percent,
     gpu_temperature_c, last_seen)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT (host) DO UPDATE SET
    status = excluded.status,
    current_job_id = excluded.current_job_id,
    loaded_model = excluded.loaded_model,
    gpu_memory_percent = excluded.gpu_memory_percent,
    gpu_temperature_c = excluded.gpu_temperature_c,
    last_seen = excluded.last_seen
            "#,
        )
        .bind(&heartbeat.host)
        .bind(heartbeat.status)
        .bind(&heartbeat.current_job_id)
        .bind(&heartbeat.loaded_model)
        .bind(heartbeat.gpu_memory_percent)
        .bind(heartbeat.gpu_temperature_c)
        .bind(heartbeat.last_seen)
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("UPSERT worker_heartbeat", error))?;
        Ok(())
    }

    /// The most recently seen worker heartbeat, if any worker ever reported.
    pub async fn latest_heartbeat(&self) -> CatalogResult<Option<WorkerHeartbeat>> {
        sqlx::query_as::<_, WorkerHeartbeat>(
            "SELECT * FROM worker_heartbeat ORDER BY last_seen DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| query_error("SELECT worker_heartbeat", error))
    }

    /// Whether some other host's heartbeat is fresher than `deadline`.
    /// Used to refuse promotion while another worker looks alive.
    pub async fn fresh_foreign_heartbeat(
        &self,
        host: &str,
        deadline: chrono::Duration,
    ) -> CatalogResult<bool> {
        let cutoff = Utc::now() - deadline;
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM worker_heartbeat WHERE host != ?1 AND last_seen > ?2",
        )
        .bind(host)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| query_error("SELECT worker_heartbeat", error))?;
        Ok(count > 0)
    }

    // ---- webhook dead letters ----

    pub async fn insert_dead_letter(
        &self,
        job_id: &str,
        url: &str,
        event: WebhookEvent,
        payload: &str,
        error_message: &str,
        attempt_count: i64,
    ) -> CatalogResult<WebhookDeadLetter> {
        let dead_letter = WebhookDeadLetter {
            id: format!("wdl-{}", Uuid::now_v7()),
            job_id: job_id.to_string(),
            url: url.to_string(),
            event,
            payload: payload.to_string(),
            error_message: error_message.to_string(),
            attempt_count,
            retry_success: false,
            forced: false,
            created_at: Utc::now(),
            last_retried_at: None,
        };

        sqlx::query(
            r#"
INSERT INTO webhook_dead_letters
    (id, job_id, url, event, payload, error_message, attempt_count,
     retry_success, forced, created_at, last_retried_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, FALSE, FALSE, ?8, NULL)
            "#,
        )
        .bind(&dead_letter.id)
        .bind(&dead_letter.job_id)
        .bind(&dead_letter.url)
        .bind(dead_letter.event)
        .bind(&dead_letter.payload)
        .bind(&dead_letter.error_message)
        .bind(dead_letter.attempt_count)
        .bind(dead_letter.created_at)
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("INSERT webhook_dead_letters", error))?;

        Ok(dead_letter)
    }

    pub async fn list_dead_letters(&self) -> CatalogResult<Vec<WebhookDeadLetter>> {
        sqlx::query_as::<_, WebhookDeadLetter>(
            "SELECT * FROM webhook_dead_letters ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| query_error("SELECT webhook_dead_letters", error))
    }

    pub async fn get_dead_letter(&self, id: &str) -> CatalogResult<Option<WebhookDeadLetter>> {
        sqlx::query_as::<_, WebhookDeadLetter>("SELECT * FROM webhook_dead_letters WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| query_error("SELECT webhook_dead_letters", error))
    }

    pub async fn mark_dead_letter_retried(
        &self,
        id: &str,
        retry_success: bool,
        forced: bool,
    ) -> CatalogResult<()> {
        sqlx::query(
            r#"
UPDATE webhook_dead_letters
SET retry_success = ?2, forced = ?3, last_retried_at = ?4
WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(retry_success)
        .bind(forced)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("UPDATE webhook_dead_letters", error))?;
        Ok(())
    }
}

fn query_error(command: &str, error: sqlx::Error) -> CatalogError {
    CatalogError::QueryError {
        command: command.to_string(),
        error,
    }
}
