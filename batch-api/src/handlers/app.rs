use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{routing, Router};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use batch_common::catalog::Catalog;
use batch_common::store::FileStore;
use batch_common::webhook::RetryPolicy;

use crate::admission::AdmissionController;

use super::{batches, files, health, webhooks};

// Batch input files can be large; default axum limits are sized for events.
const UPLOAD_BODY_LIMIT: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub store: FileStore,
    pub admission: Arc<AdmissionController>,
    pub webhook_client: reqwest::Client,
    pub webhook_retry_policy: RetryPolicy,
    pub worker_liveness_deadline: chrono::Duration,
}

pub fn add_routes(router: Router<AppState>, state: AppState) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route(
            "/v1/files",
            routing::post(files::upload)
                // Disable axum's default limit so tower-http's applies.
                .layer::<_, std::convert::Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(UPLOAD_BODY_LIMIT)),
        )
        .route("/v1/files/:id/content", routing::get(files::content))
        .route(
            "/v1/batches",
            routing::post(batches::create).get(batches::list),
        )
        .route(
            "/v1/batches/:id",
            routing::get(batches::get).delete(batches::cancel),
        )
        .route("/v1/batches/:id/results", routing::get(batches::results))
        .route("/v1/batches/:id/failed", routing::get(batches::failed))
        .route("/health", routing::get(health::health))
        .route(
            "/v1/webhooks/dead-letter",
            routing::get(webhooks::list_dead_letters),
        )
        .route(
            "/v1/webhooks/dead-letter/:id/retry",
            routing::post(webhooks::retry_dead_letter),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn index() -> &'static str {
    "batch api"
}
