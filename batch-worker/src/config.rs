use envconfig::Envconfig;

use batch_common::webhook::RetryPolicy;

use crate::executor::ChunkPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "sqlite:batch_orchestrator.db")]
    pub database_url: String,

    #[envconfig(default = "4")]
    pub max_db_connections: u32,

    #[envconfig(default = "data/files")]
    pub file_root: String,

    /// Identifies this host in the heartbeat row.
    #[envconfig(default = "gpu-worker")]
    pub worker_name: String,

    /// Base URL of the engine sidecar.
    #[envconfig(default = "http://127.0.0.1:8901")]
    pub engine_base_url: String,

    /// Let webhooks target private and loopback addresses. Development only.
    #[envconfig(default = "false")]
    pub allow_internal_ips: bool,

    #[envconfig(from = "POLL_INTERVAL", default = "10")]
    pub poll_interval_secs: u64,

    #[envconfig(from = "MODEL_SWAP_COOLDOWN", default = "2")]
    pub model_swap_cooldown_secs: u64,

    #[envconfig(from = "WORKER_LIVENESS_DEADLINE", default = "60")]
    pub worker_liveness_deadline_secs: i64,

    #[envconfig(from = "CHUNK_SIZE", default = "5000")]
    pub chunk_size: usize,

    #[envconfig(from = "CHUNK_SIZE_FLOOR", default = "500")]
    pub chunk_size_floor: usize,

    /// Memory usage (percent) above which chunks shrink to the floor.
    #[envconfig(from = "GPU_MEMORY_PRESSURE_THRESHOLD", default = "90.0")]
    pub gpu_memory_pressure_threshold: f64,

    /// Free GPU memory (bytes) below which chunks shrink to the floor.
    #[envconfig(from = "GPU_MIN_FREE_BYTES", default = "2147483648")]
    pub gpu_min_free_bytes: u64,

    #[envconfig(nested = true)]
    pub webhook_retry: WebhookRetryConfig,
}

#[derive(Envconfig, Clone)]
pub struct WebhookRetryConfig {
    #[envconfig(from = "WEBHOOK_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "WEBHOOK_BACKOFF_BASE_MS", default = "2000")]
    pub initial_interval_ms: u64,

    #[envconfig(from = "WEBHOOK_BACKOFF_MAX_MS", default = "60000")]
    pub maximum_interval_ms: u64,
}

impl Config {
    /// Produce a host:port address for binding the status server.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn chunk_policy(&self) -> ChunkPolicy {
        ChunkPolicy {
            ceiling: self.chunk_size,
            floor: self.chunk_size_floor,
            memory_pressure_percent: self.gpu_memory_pressure_threshold,
            min_free_bytes: self.gpu_min_free_bytes,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.webhook_retry.backoff_coefficient,
            std::time::Duration::from_millis(self.webhook_retry.initial_interval_ms),
            Some(std::time::Duration::from_millis(
                self.webhook_retry.maximum_interval_ms,
            )),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_the_documented_knobs() {
        let config = Config::init_from_hashmap(&std::collections::HashMap::new()).unwrap();

        assert_eq!(config.port, 3302);
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.model_swap_cooldown_secs, 2);
        assert_eq!(config.worker_liveness_deadline_secs, 60);

        let policy = config.chunk_policy();
        assert_eq!(policy.ceiling, 5000);
        assert_eq!(policy.floor, 500);
        assert_eq!(policy.memory_pressure_percent, 90.0);
    }
}
