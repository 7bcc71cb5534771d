use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(default = "sqlite:batch_orchestrator.db")]
    pub database_url: String,

    #[envconfig(default = "4")]
    pub max_db_connections: u32,

    #[envconfig(default = "data/files")]
    pub file_root: String,

    #[envconfig(from = "MAX_REQUESTS_PER_JOB", default = "50000")]
    pub max_requests_per_job: usize,

    #[envconfig(from = "MAX_QUEUE_DEPTH", default = "8")]
    pub max_queue_depth: i64,

    #[envconfig(from = "MAX_TOTAL_QUEUED_REQUESTS", default = "200000")]
    pub max_total_queued_requests: i64,

    #[envconfig(from = "GPU_MEMORY_REJECT_THRESHOLD", default = "95.0")]
    pub gpu_memory_reject_threshold: f64,

    #[envconfig(from = "GPU_TEMP_REJECT_THRESHOLD", default = "85.0")]
    pub gpu_temp_reject_threshold: f64,

    #[envconfig(from = "WORKER_LIVENESS_DEADLINE", default = "60")]
    pub worker_liveness_deadline_secs: i64,

    /// Expiry applied when a submission has no completion window.
    #[envconfig(default = "24")]
    pub default_completion_window_hours: i64,

    #[envconfig(from = "WEBHOOK_DEFAULT_RETRIES", default = "3")]
    pub webhook_default_retries: i64,

    #[envconfig(from = "WEBHOOK_DEFAULT_TIMEOUT_S", default = "30")]
    pub webhook_default_timeout_s: i64,

    /// Let webhooks target private and loopback addresses. Development only.
    #[envconfig(default = "false")]
    pub allow_internal_ips: bool,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
