//! The single-flight worker loop.
//!
//! One process per host owns the GPU. Each poll cycle refreshes the
//! heartbeat, expires overdue queued jobs, claims the oldest pending job by
//! CAS, hot-swaps the model if the job needs a different one, hands the job
//! to the chunked executor and finally runs the terminal result handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use batch_common::catalog::Catalog;
use batch_common::error::ErrorKind;
use batch_common::job::{BatchJob, JobStatus, WorkerHeartbeat, WorkerStatus};
use batch_common::store::FileStore;

use crate::dispatch::WebhookDispatcher;
use crate::engine::{EngineError, InferenceEngine};
use crate::error::WorkerError;
use crate::executor::{ChunkPolicy, ChunkedExecutor, ExecutionOutcome};
use crate::gpu::GpuProbe;
use crate::registry::{HandlerRegistry, TerminalJobSnapshot};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub host: String,
    pub poll_interval: Duration,
    pub model_swap_cooldown: Duration,
    pub liveness_deadline: chrono::Duration,
    pub chunk_policy: ChunkPolicy,
}

pub struct Scheduler {
    catalog: Catalog,
    store: FileStore,
    engine: Arc<dyn InferenceEngine>,
    gpu: Arc<dyn GpuProbe>,
    registry: HandlerRegistry,
    dispatcher: WebhookDispatcher,
    settings: SchedulerSettings,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        catalog: Catalog,
        store: FileStore,
        engine: Arc<dyn InferenceEngine>,
        gpu: Arc<dyn GpuProbe>,
        registry: HandlerRegistry,
        dispatcher: WebhookDispatcher,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            catalog,
            store,
            engine,
            gpu,
            registry,
            dispatcher,
            settings,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag checked between jobs; flipping it makes `run` return after the
    /// current cycle. A job that is mid-execution runs to completion.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run until the shutdown flag flips.
    pub async fn run(&self) {
        if let Err(err) = self.resume_abandoned().await {
            error!(error = %err, "failed to resume abandoned job");
        }

        while self.running.load(Ordering::Relaxed) {
            match self.tick().await {
                Ok(true) => {
                    // A job just finished; look for the next one right away.
                }
                Ok(false) => {
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                Err(err) => {
                    error!(error = %err, "poll cycle failed");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }

        info!("scheduler shutting down");
    }

    /// One poll cycle. Returns whether a job was claimed and run.
    pub async fn tick(&self) -> Result<bool, WorkerError> {
        self.refresh_heartbeat(WorkerStatus::Idle, None).await;

        let expired = self.catalog.expire_overdue(Utc::now()).await?;
        if expired > 0 {
            info!(count = expired, "expired overdue queued jobs");
        }

        if self
            .catalog
            .fresh_foreign_heartbeat(&self.settings.host, self.settings.liveness_deadline)
            .await?
        {
            warn!("another worker's heartbeat is fresh, not claiming jobs");
            return Ok(false);
        }

        let Some(job) = self.catalog.get_next_pending().await? else {
            return Ok(false);
        };

        // The claim: losing this race (a concurrent cancel, another worker)
        // just means there is nothing to do this cycle.
        if !self
            .catalog
            .cas_status(&job.id, JobStatus::Pending, JobStatus::InProgress)
            .await?
        {
            return Ok(false);
        }
        let job = match self.catalog.get_job(&job.id).await? {
            Some(job) => job,
            None => return Ok(false),
        };
        info!(job_id = %job.id, model = %job.model, "claimed job");

        self.run_job(job).await?;
        Ok(true)
    }

    /// Execute an already-promoted `in_progress` job through to its terminal
    /// state and hooks.
    async fn run_job(&self, job: BatchJob) -> Result<(), WorkerError> {
        if let Err(err) = self.ensure_model(&job.model).await {
            error!(
                job_id = %job.id,
                model = %job.model,
                kind = %ErrorKind::ModelLoadFailed,
                error = %err,
                "model load failed"
            );
            metrics::counter!("worker_model_load_failures_total").increment(1);
            self.catalog
                .cas_status(&job.id, JobStatus::InProgress, JobStatus::Failed)
                .await?;
            self.finish_terminal(&job.id).await?;
            self.refresh_heartbeat(WorkerStatus::Idle, None).await;
            return Ok(());
        }

        self.refresh_heartbeat(WorkerStatus::Running, Some(&job.id))
            .await;

        let executor = ChunkedExecutor {
            catalog: self.catalog.clone(),
            store: self.store.clone(),
            engine: self.engine.clone(),
            gpu: self.gpu.clone(),
            policy: self.settings.chunk_policy,
            host: self.settings.host.clone(),
            dispatcher: Some(self.dispatcher.clone()),
        };

        match executor.execute(&job).await {
            Ok(ExecutionOutcome::Completed) => {
                self.catalog
                    .cas_status(&job.id, JobStatus::InProgress, JobStatus::Completed)
                    .await?;
                metrics::counter!("worker_jobs_completed_total").increment(1);
            }
            Ok(ExecutionOutcome::Failed { kind, message }) => {
                warn!(job_id = %job.id, kind = %kind, message = %message, "job failed");
                self.catalog
                    .cas_status(&job.id, JobStatus::InProgress, JobStatus::Failed)
                    .await?;
                metrics::counter!("worker_jobs_failed_total").increment(1);
            }
            Err(err) => {
                // Infrastructure error: try to leave a terminal state behind
                // before surfacing it to the loop.
                error!(job_id = %job.id, error = %err, "executor infrastructure error");
                if let Err(cas_err) = self
                    .catalog
                    .cas_status(&job.id, JobStatus::InProgress, JobStatus::Failed)
                    .await
                {
                    error!(job_id = %job.id, error = %cas_err, "failed to mark job failed");
                }
                if let Err(hook_err) = self.finish_terminal(&job.id).await {
                    error!(job_id = %job.id, error = %hook_err, "terminal hooks failed");
                }
                self.refresh_heartbeat(WorkerStatus::Idle, None).await;
                return Err(err);
            }
        }

        self.finish_terminal(&job.id).await?;
        self.refresh_heartbeat(WorkerStatus::Idle, None).await;
        Ok(())
    }

    /// Make sure the job's model is resident: unload the previous one, wait
    /// out the cooldown, load the new one. A no-op when it is already loaded,
    /// so consecutive jobs on the same model cost one load total.
    async fn ensure_model(&self, model: &str) -> Result<(), EngineError> {
        let loaded = self.engine.loaded_model().await;
        if loaded.as_deref() == Some(model) {
            return Ok(());
        }

        if let Some(previous) = loaded {
            info!(from = %previous, to = %model, "hot-swapping model");
            self.refresh_heartbeat(WorkerStatus::Unloading, None).await;
            self.engine.unload().await?;
            tokio::time::sleep(self.settings.model_swap_cooldown).await;
        }

        self.refresh_heartbeat(WorkerStatus::Loading, None).await;
        self.engine.load(model).await?;
        metrics::counter!("worker_model_loads_total").increment(1);
        Ok(())
    }

    /// Run the result-handler registry against the job's terminal snapshot.
    async fn finish_terminal(&self, job_id: &str) -> Result<(), WorkerError> {
        let Some(job) = self.catalog.get_job(job_id).await? else {
            return Ok(());
        };
        if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            let snapshot = TerminalJobSnapshot::from_job(&job);
            self.registry.run(&snapshot).await;
        }
        Ok(())
    }

    /// Pick an `in_progress` job left behind by a crash back up. The resume
    /// offset inside the executor makes this safe to repeat.
    async fn resume_abandoned(&self) -> Result<(), WorkerError> {
        if let Some(job) = self.catalog.get_in_progress().await? {
            info!(job_id = %job.id, "resuming job left in_progress by a previous run");
            self.run_job(job).await?;
        }
        Ok(())
    }

    /// Best-effort heartbeat refresh; a failed write is logged, never fatal.
    async fn refresh_heartbeat(&self, status: WorkerStatus, current_job_id: Option<&str>) {
        let gpu = self.gpu.probe().await;
        let heartbeat = WorkerHeartbeat {
            host: self.settings.host.clone(),
            status,
            current_job_id: current_job_id.map(|id| id.to_string()),
            loaded_model: self.engine.loaded_model().await,
            gpu_memory_percent: gpu.map(|g| g.memory_percent),
            gpu_temperature_c: gpu.map(|g| g.temperature_c),
            last_seen: Utc::now(),
        };
        if let Err(err) = self.catalog.upsert_heartbeat(&heartbeat).await {
            warn!(error = %err, "failed to refresh heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    use batch_common::job::NewBatchJob;
    use batch_common::webhook::RetryPolicy;
    use crate::dispatch::build_http_client;
    use crate::engine::MockEngine;
    use crate::gpu::StaticProbe;

    struct Harness {
        _dir: TempDir,
        catalog: Catalog,
        store: FileStore,
        engine: Arc<MockEngine>,
    }

    async fn harness() -> Harness {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let catalog = Catalog::from_pool(pool);
        catalog.migrate().await.unwrap();

        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        Harness {
            _dir: dir,
            catalog,
            store,
            engine: Arc::new(MockEngine::new()),
        }
    }

    impl Harness {
        fn scheduler(&self) -> Scheduler {
            self.scheduler_with_engine(self.engine.clone())
        }

        fn scheduler_with_engine(&self, engine: Arc<MockEngine>) -> Scheduler {
            let dispatcher = WebhookDispatcher::new(
                self.catalog.clone(),
                build_http_client(true).unwrap(),
                RetryPolicy::default(),
            );
            Scheduler::new(
                self.catalog.clone(),
                self.store.clone(),
                engine,
                Arc::new(StaticProbe(None)),
                HandlerRegistry::new(),
                dispatcher,
                SchedulerSettings {
                    host: "test-host".to_string(),
                    poll_interval: Duration::from_millis(10),
                    model_swap_cooldown: Duration::from_millis(10),
                    liveness_deadline: chrono::Duration::seconds(60),
                    chunk_policy: ChunkPolicy::default(),
                },
            )
        }

        /// Upload a small input file and insert a pending job for `model`.
        async fn pending_job(&self, model: &str, ids: &[&str]) -> BatchJob {
            let mut contents = String::new();
            for id in ids {
                contents.push_str(&format!(
                    r#"{{"custom_id": "{}", "method": "POST", "url": "/v1/chat/completions", "body": {{"model": "{}", "messages": [{{"role": "user", "content": "hello"}}]}}}}"#,
                    id, model
                ));
                contents.push('\n');
            }
            let input_file_id = batch_common::job::new_file_id();
            self.store.put(&input_file_id, contents.as_bytes()).unwrap();

            let job = self
                .catalog
                .insert_job(&NewBatchJob {
                    model: model.to_string(),
                    input_file_id,
                    total_requests: ids.len() as i64,
                    expires_at: Utc::now() + chrono::Duration::hours(24),
                    webhook_url: None,
                    webhook_secret: None,
                    webhook_events: None,
                    webhook_retries: None,
                    webhook_timeout_s: None,
                    metadata: serde_json::json!({}),
                })
                .await
                .unwrap();
            job
        }

        async fn status(&self, id: &str) -> JobStatus {
            self.catalog.get_job(id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn test_tick_with_empty_queue_does_nothing() {
        let h = harness().await;
        let scheduler = h.scheduler();
        assert!(!scheduler.tick().await.unwrap());

        // The heartbeat was still refreshed.
        let heartbeat = h.catalog.latest_heartbeat().await.unwrap().unwrap();
        assert_eq!(heartbeat.status, WorkerStatus::Idle);
        assert_eq!(heartbeat.host, "test-host");
    }

    #[tokio::test]
    async fn test_jobs_run_fifo_one_per_tick() {
        let h = harness().await;
        let first = h.pending_job("m1", &["a"]).await;
        let second = h.pending_job("m1", &["b"]).await;

        let scheduler = h.scheduler();
        assert!(scheduler.tick().await.unwrap());
        assert_eq!(h.status(&first.id).await, JobStatus::Completed);
        assert_eq!(h.status(&second.id).await, JobStatus::Pending);

        assert!(scheduler.tick().await.unwrap());
        assert_eq!(h.status(&second.id).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_hot_swap_loads_each_model_once() {
        let h = harness().await;
        let a = h.pending_job("m1", &["a1"]).await;
        let b = h.pending_job("m1", &["b1"]).await;
        let c = h.pending_job("m2", &["c1"]).await;

        let scheduler = h.scheduler();
        assert!(scheduler.tick().await.unwrap());
        assert!(scheduler.tick().await.unwrap());
        assert!(scheduler.tick().await.unwrap());

        assert_eq!(h.status(&a.id).await, JobStatus::Completed);
        assert_eq!(h.status(&b.id).await, JobStatus::Completed);
        assert_eq!(h.status(&c.id).await, JobStatus::Completed);

        // Two jobs on m1 share one load; the swap to m2 unloads once.
        assert_eq!(h.engine.loads().await, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(h.engine.unload_count().await, 1);
    }

    #[tokio::test]
    async fn test_model_load_failure_fails_the_job() {
        let h = harness().await;
        let job = h.pending_job("broken-model", &["a"]).await;

        let engine = Arc::new(MockEngine::refusing_models(&["broken-model"]));
        let scheduler = h.scheduler_with_engine(engine);
        assert!(scheduler.tick().await.unwrap());

        assert_eq!(h.status(&job.id).await, JobStatus::Failed);

        // The worker is idle again and able to take the next job.
        let heartbeat = h.catalog.latest_heartbeat().await.unwrap().unwrap();
        assert_eq!(heartbeat.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_fresh_foreign_heartbeat_blocks_claiming() {
        let h = harness().await;
        let job = h.pending_job("m1", &["a"]).await;

        h.catalog
            .upsert_heartbeat(&WorkerHeartbeat {
                host: "other-host".to_string(),
                status: WorkerStatus::Running,
                current_job_id: None,
                loaded_model: None,
                gpu_memory_percent: None,
                gpu_temperature_c: None,
                last_seen: Utc::now(),
            })
            .await
            .unwrap();

        let scheduler = h.scheduler();
        assert!(!scheduler.tick().await.unwrap());
        assert_eq!(h.status(&job.id).await, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_not_claimed() {
        let h = harness().await;
        let job = h.pending_job("m1", &["a"]).await;
        h.catalog
            .cas_status(&job.id, JobStatus::Pending, JobStatus::Cancelled)
            .await
            .unwrap();

        let scheduler = h.scheduler();
        assert!(!scheduler.tick().await.unwrap());
        assert_eq!(h.status(&job.id).await, JobStatus::Cancelled);
        assert!(h.engine.loads().await.is_empty());
    }

    #[tokio::test]
    async fn test_overdue_pending_jobs_expire_during_tick() {
        let h = harness().await;
        let job = h
            .catalog
            .insert_job(&NewBatchJob {
                model: "m1".to_string(),
                input_file_id: batch_common::job::new_file_id(),
                total_requests: 1,
                expires_at: Utc::now() - chrono::Duration::hours(1),
                webhook_url: None,
                webhook_secret: None,
                webhook_events: None,
                webhook_retries: None,
                webhook_timeout_s: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let scheduler = h.scheduler();
        assert!(!scheduler.tick().await.unwrap());
        assert_eq!(h.status(&job.id).await, JobStatus::Expired);
        assert!(h.engine.loads().await.is_empty());
    }

    #[tokio::test]
    async fn test_resume_abandoned_finishes_the_job() {
        let h = harness().await;
        let job = h.pending_job("m1", &["a", "b", "c"]).await;
        h.catalog
            .cas_status(&job.id, JobStatus::Pending, JobStatus::InProgress)
            .await
            .unwrap();

        let scheduler = h.scheduler();
        scheduler.resume_abandoned().await.unwrap();

        assert_eq!(h.status(&job.id).await, JobStatus::Completed);
        let job = h.catalog.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.completed_requests, 3);
    }
}
