//! Chunked job execution with incremental, crash-safe result writing.
//!
//! The output file is the durable cursor: one line is appended and synced per
//! finished request, so after a crash the executor skips as many input
//! requests as there are complete output lines and picks up where it left
//! off. Catalog counters are refreshed per chunk but are only advisory; on
//! resume they are reset from the file.

use tracing::{info, warn};

use batch_common::catalog::Catalog;
use batch_common::error::ErrorKind;
use batch_common::job::{BatchJob, WorkerHeartbeat, WorkerStatus};
use batch_common::request::{
    parse_input, Choice, ChoiceMessage, CompletionBody, RequestLine, ResultLine, Usage,
};
use batch_common::store::FileStore;

use crate::dispatch::WebhookDispatcher;
use crate::engine::{InferenceEngine, Prompt};
use crate::error::WorkerError;
use crate::gpu::{GpuProbe, GpuSnapshot};

/// GPU-pressure-aware chunk sizing. Reassessed before every chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    pub ceiling: usize,
    pub floor: usize,
    /// Memory usage above this percentage shrinks chunks by 10x.
    pub memory_pressure_percent: f64,
    /// Free memory below this shrinks chunks by 10x.
    pub min_free_bytes: u64,
}

impl ChunkPolicy {
    pub fn chunk_size(&self, gpu: Option<&GpuSnapshot>) -> usize {
        match gpu {
            Some(snapshot)
                if snapshot.memory_percent > self.memory_pressure_percent
                    || snapshot.memory_free_bytes < self.min_free_bytes =>
            {
                (self.ceiling / 10).max(self.floor)
            }
            _ => self.ceiling.max(1),
        }
    }
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            ceiling: 5_000,
            floor: 500,
            memory_pressure_percent: 90.0,
            min_free_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// How a job run ended. Partial results flushed before a failure stay valid
/// and downloadable.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    Failed { kind: ErrorKind, message: String },
}

pub struct ChunkedExecutor {
    pub catalog: Catalog,
    pub store: FileStore,
    pub engine: std::sync::Arc<dyn InferenceEngine>,
    pub gpu: std::sync::Arc<dyn GpuProbe>,
    pub policy: ChunkPolicy,
    pub host: String,
    pub dispatcher: Option<WebhookDispatcher>,
}

impl ChunkedExecutor {
    /// Run `job` to completion or failure. The caller has already promoted
    /// the job to `in_progress` and loaded its model.
    pub async fn execute(&self, job: &BatchJob) -> Result<ExecutionOutcome, WorkerError> {
        let raw = self.store.get(&job.input_file_id)?;
        let requests = match parse_input(&raw, usize::MAX) {
            Ok(requests) => requests,
            Err(err) => {
                return Ok(ExecutionOutcome::Failed {
                    kind: ErrorKind::InvalidInput,
                    message: err.to_string(),
                });
            }
        };
        if requests.len() as i64 != job.total_requests {
            return Ok(ExecutionOutcome::Failed {
                kind: ErrorKind::InvalidInput,
                message: format!(
                    "input file has {} requests but {} were recorded at admission",
                    requests.len(),
                    job.total_requests
                ),
            });
        }

        let output_id = job
            .output_file_id
            .clone()
            .unwrap_or_else(|| job.output_file_id());

        // A crash mid-append can leave a partial trailing line; drop it, then
        // skip as many inputs as there are complete output lines.
        let resume = self.store.truncate_to_complete_lines(&output_id)?;
        let (mut completed_total, mut failed_total) = (0i64, 0i64);
        if resume > 0 {
            (completed_total, failed_total) = self.recount_from_output(&output_id, resume)?;
            self.catalog
                .reset_counters(&job.id, completed_total, failed_total)
                .await?;
            self.catalog.set_output_file_once(&job.id, &output_id).await?;
            info!(
                job_id = %job.id,
                resume_offset = resume,
                "resuming job from existing output"
            );
        }

        let total = requests.len();
        let mut index = (resume as usize).min(total);
        let mut output_recorded = resume > 0;

        while index < total {
            let gpu = self.gpu.probe().await;
            let chunk_size = self.policy.chunk_size(gpu.as_ref());
            let end = (index + chunk_size).min(total);
            let chunk = &requests[index..end];

            let prompts: Vec<Prompt> = chunk.iter().map(Prompt::from_request).collect();
            let results = match self.engine.generate(&prompts).await {
                Ok(results) => results,
                Err(err) => {
                    return Ok(ExecutionOutcome::Failed {
                        kind: ErrorKind::EngineFailure,
                        message: err.to_string(),
                    });
                }
            };
            if results.len() != chunk.len() {
                return Ok(ExecutionOutcome::Failed {
                    kind: ErrorKind::EngineFailure,
                    message: format!(
                        "engine returned {} results for {} prompts",
                        results.len(),
                        chunk.len()
                    ),
                });
            }

            if !output_recorded {
                self.catalog.set_output_file_once(&job.id, &output_id).await?;
                output_recorded = true;
            }

            let mut chunk_completed = 0i64;
            let mut chunk_failed = 0i64;
            for (request, result) in chunk.iter().zip(results) {
                let line = self.append_result(&output_id, request, result)?;
                if let Some(error) = &line.error {
                    self.catalog
                        .insert_failed_request(
                            &job.id,
                            &request.custom_id,
                            error.kind,
                            &error.message,
                        )
                        .await?;
                    chunk_failed += 1;
                } else {
                    chunk_completed += 1;
                }
            }

            self.catalog
                .increment_counters(&job.id, chunk_completed, chunk_failed)
                .await?;
            completed_total += chunk_completed;
            failed_total += chunk_failed;
            self.refresh_heartbeat(job, gpu).await;

            metrics::counter!("executor_chunks_total").increment(1);
            metrics::counter!("executor_requests_completed_total")
                .increment(chunk_completed as u64);
            metrics::counter!("executor_requests_failed_total").increment(chunk_failed as u64);

            if chunk_failed == chunk.len() as i64 {
                return Ok(ExecutionOutcome::Failed {
                    kind: ErrorKind::EngineFailure,
                    message: format!(
                        "all {} requests in a chunk failed, aborting the job",
                        chunk.len()
                    ),
                });
            }

            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.dispatch_progress(job, completed_total, failed_total);
            }

            index = end;
        }

        Ok(ExecutionOutcome::Completed)
    }

    /// Compose, append and sync one result line. Returns the line so the
    /// caller can account it after the append is durable.
    fn append_result(
        &self,
        output_id: &str,
        request: &RequestLine,
        result: Result<crate::engine::Completion, crate::engine::RequestFailure>,
    ) -> Result<ResultLine, WorkerError> {
        let line = match result {
            Ok(completion) => ResultLine::success(
                request.custom_id.clone(),
                CompletionBody {
                    choices: vec![Choice {
                        message: ChoiceMessage {
                            content: completion.content,
                        },
                    }],
                    usage: Usage {
                        prompt_tokens: completion.prompt_tokens,
                        completion_tokens: completion.completion_tokens,
                    },
                },
            ),
            Err(failure) => ResultLine::failure(
                request.custom_id.clone(),
                ErrorKind::RequestFailed,
                failure.message,
            ),
        };

        let serialized = serde_json::to_string(&line)?;
        self.store.append_line(output_id, &serialized)?;
        Ok(line)
    }

    /// Rebuild counters from the complete lines already in the output file.
    fn recount_from_output(
        &self,
        output_id: &str,
        lines: u64,
    ) -> Result<(i64, i64), WorkerError> {
        let existing = self.store.get(output_id)?;
        let text = String::from_utf8_lossy(&existing);
        let mut completed = 0i64;
        let mut failed = 0i64;
        for line in text.lines().take(lines as usize) {
            match serde_json::from_str::<ResultLine>(line) {
                Ok(parsed) if parsed.error.is_some() => failed += 1,
                _ => completed += 1,
            }
        }
        Ok((completed, failed))
    }

    async fn refresh_heartbeat(&self, job: &BatchJob, gpu: Option<GpuSnapshot>) {
        let heartbeat = WorkerHeartbeat {
            host: self.host.clone(),
            status: WorkerStatus::Running,
            current_job_id: Some(job.id.clone()),
            loaded_model: self.engine.loaded_model().await,
            gpu_memory_percent: gpu.map(|g| g.memory_percent),
            gpu_temperature_c: gpu.map(|g| g.temperature_c),
            last_seen: chrono::Utc::now(),
        };
        if let Err(err) = self.catalog.upsert_heartbeat(&heartbeat).await {
            warn!(error = %err, "failed to refresh heartbeat from executor");
        }
    }
}
