//! The batch worker: claims queued jobs, drives the inference engine and
//! writes results. Also serves a small status endpoint with metrics.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tracing::{error, info};

use batch_common::catalog::Catalog;
use batch_common::metrics::{serve, setup_metrics_routes};
use batch_common::store::FileStore;
use batch_worker::config::Config;
use batch_worker::dispatch::{build_http_client, WebhookDispatcher, WebhookHandler};
use batch_worker::engine::HttpEngine;
use batch_worker::gpu::NvidiaSmiProbe;
use batch_worker::registry::HandlerRegistry;
use batch_worker::scheduler::{Scheduler, SchedulerSettings};

pub async fn index() -> &'static str {
    "batch worker"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let catalog = Catalog::connect(&config.database_url, config.max_db_connections)
        .await
        .expect("failed to open catalog");
    let store = FileStore::new(&config.file_root).expect("failed to open file store");

    let client = build_http_client(config.allow_internal_ips).expect("failed to build webhook http client");
    let engine = Arc::new(HttpEngine::new(
        reqwest::Client::new(),
        config.engine_base_url.clone(),
    ));

    let dispatcher = WebhookDispatcher::new(catalog.clone(), client, config.retry_policy());
    let mut registry = HandlerRegistry::new();
    registry.register(Box::new(WebhookHandler::new(
        catalog.clone(),
        dispatcher.clone(),
    )));

    let scheduler = Scheduler::new(
        catalog,
        store,
        engine,
        Arc::new(NvidiaSmiProbe),
        registry,
        dispatcher,
        SchedulerSettings {
            host: config.worker_name.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            model_swap_cooldown: Duration::from_secs(config.model_swap_cooldown_secs),
            liveness_deadline: chrono::Duration::seconds(config.worker_liveness_deadline_secs),
            chunk_policy: config.chunk_policy(),
        },
    );

    // Finish the current poll cycle, then exit, on ctrl-c.
    let shutdown = scheduler.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing current cycle");
            shutdown.store(false, Ordering::Relaxed);
        }
    });

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(index));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to start worker status server, {}", e);
        }
    });

    info!(worker = %config.worker_name, "batch worker starting");
    scheduler.run().await;
}
