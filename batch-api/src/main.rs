use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;

use batch_api::admission::{AdmissionController, AdmissionLimits};
use batch_api::config::Config;
use batch_api::handlers::{add_routes, AppState};
use batch_common::catalog::Catalog;
use batch_common::metrics::setup_metrics_routes;
use batch_common::store::FileStore;
use batch_common::webhook::{build_http_client, RetryPolicy};

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let catalog = Catalog::connect(&config.database_url, config.max_db_connections)
        .await
        .expect("failed to open catalog");
    let store = FileStore::new(&config.file_root).expect("failed to open file store");

    let admission = AdmissionController::new(
        catalog.clone(),
        store.clone(),
        AdmissionLimits {
            max_requests_per_job: config.max_requests_per_job,
            max_queue_depth: config.max_queue_depth,
            max_total_queued_requests: config.max_total_queued_requests,
            gpu_memory_reject_threshold: config.gpu_memory_reject_threshold,
            gpu_temp_reject_threshold: config.gpu_temp_reject_threshold,
            worker_liveness_deadline: chrono::Duration::seconds(
                config.worker_liveness_deadline_secs,
            ),
            default_completion_window: chrono::Duration::hours(
                config.default_completion_window_hours,
            ),
            webhook_default_retries: config.webhook_default_retries,
            webhook_default_timeout_s: config.webhook_default_timeout_s,
            allow_internal_webhook_urls: config.allow_internal_ips,
        },
    );

    let state = AppState {
        catalog,
        store,
        admission: Arc::new(admission),
        webhook_client: build_http_client(config.allow_internal_ips)
            .expect("failed to build webhook http client"),
        webhook_retry_policy: RetryPolicy::default(),
        worker_liveness_deadline: chrono::Duration::seconds(config.worker_liveness_deadline_secs),
    };

    let app = add_routes(Router::new(), state);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start batch-api http server, {}", e),
    }
}
