//! End-to-end tests for the HTTP surface, driven through the router.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use tower::ServiceExt;

use batch_api::admission::{AdmissionController, AdmissionLimits};
use batch_api::handlers::{add_routes, AppState};
use batch_common::catalog::Catalog;
use batch_common::job::{JobStatus, WorkerHeartbeat, WorkerStatus};
use batch_common::store::FileStore;
use batch_common::webhook::{RetryPolicy, WebhookEvent};

struct Harness {
    _dir: TempDir,
    catalog: Catalog,
    store: FileStore,
    app: Router,
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

    let admission = AdmissionController::new(
        catalog.clone(),
        store.clone(),
        AdmissionLimits {
            max_requests_per_job: 100,
            max_queue_depth: 5,
            max_total_queued_requests: 500,
            gpu_memory_reject_threshold: 95.0,
            gpu_temp_reject_threshold: 85.0,
            worker_liveness_deadline: chrono::Duration::seconds(60),
            default_completion_window: chrono::Duration::hours(24),
            webhook_default_retries: 3,
            webhook_default_timeout_s: 30,
            // The re-drive tests below deliver to a loopback receiver.
            allow_internal_webhook_urls: true,
        },
    );

    let state = AppState {
        catalog: catalog.clone(),
        store: store.clone(),
        admission: Arc::new(admission),
        webhook_client: reqwest::Client::new(),
        webhook_retry_policy: RetryPolicy::new(2, Duration::from_millis(10), None),
        worker_liveness_deadline: chrono::Duration::seconds(60),
    };

    Harness {
        _dir: dir,
        catalog,
        store,
        app: add_routes(Router::new(), state),
    }
}

impl Harness {
    async fn healthy_worker(&self) {
        self.catalog
            .upsert_heartbeat(&WorkerHeartbeat {
                host: "gpu-host".to_string(),
                status: WorkerStatus::Idle,
                current_job_id: None,
                loaded_model: None,
                gpu_memory_percent: Some(30.0),
                gpu_temperature_c: Some(45.0),
                last_seen: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn upload_input(&self, ids: &[&str]) -> String {
        let file_id = batch_common::job::new_file_id();
        let mut contents = String::new();
        for id in ids {
            contents.push_str(&format!(
                r#"{{"custom_id": "{}", "method": "POST", "url": "/v1/chat/completions", "body": {{"model": "m1", "messages": [{{"role": "user", "content": "2+2?"}}]}}}}"#,
                id
            ));
            contents.push('\n');
        }
        self.store.put(&file_id, contents.as_bytes()).unwrap();
        file_id
    }

    async fn submit(&self, file_id: &str) -> (StatusCode, serde_json::Value) {
        let body = serde_json::json!({
            "input_file_id": file_id,
            "model": "m1",
            "endpoint": "/v1/chat/completions",
            "completion_window": "24h",
        });
        self.request(
            Request::builder()
                .method("POST")
                .uri("/v1/batches")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn request(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    async fn raw(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    fn get(&self, uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }
}

#[tokio::test]
async fn test_index() {
    let h = harness().await;
    let (status, body) = h.raw(h.get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"batch api");
}

#[tokio::test]
async fn test_file_upload_round_trips_byte_equal() {
    let h = harness().await;
    let contents =
        r#"{"custom_id": "a", "method": "POST", "url": "/v1/chat/completions", "body": {"model": "m1", "messages": []}}"#;
    let boundary = "test-boundary";
    let multipart = format!(
        "--{b}\r\ncontent-disposition: form-data; name=\"purpose\"\r\n\r\nbatch\r\n--{b}\r\ncontent-disposition: form-data; name=\"file\"; filename=\"input.jsonl\"\r\ncontent-type: application/jsonl\r\n\r\n{contents}\r\n--{b}--\r\n",
        b = boundary,
        contents = contents
    );

    let (status, body) = h
        .request(
            Request::builder()
                .method("POST")
                .uri("/v1/files")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(Body::from(multipart))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["purpose"], "batch");
    assert_eq!(body["bytes"], contents.len() as u64);
    let file_id = body["id"].as_str().unwrap().to_string();
    assert!(file_id.starts_with("file-"));

    let (status, downloaded) = h
        .raw(h.get(&format!("/v1/files/{}/content", file_id)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(downloaded, contents.as_bytes());
}

#[tokio::test]
async fn test_missing_file_download_is_404() {
    let h = harness().await;
    let (status, _) = h.request(h.get("/v1/files/file-nope/content")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_submit_and_fetch_batch() {
    let h = harness().await;
    h.healthy_worker().await;
    let file_id = h.upload_input(&["a", "b", "c"]);

    let (status, body) = h.submit(&file_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["total_requests"], 3);
    assert_eq!(body["queue_position"], 1);
    let batch_id = body["batch_id"].as_str().unwrap().to_string();

    let (status, body) = h.request(h.get(&format!("/v1/batches/{}", batch_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], batch_id.as_str());
    assert_eq!(body["status"], "pending");
    assert_eq!(body["completed_requests"], 0);
    // Secrets never leave the catalog.
    assert!(body.get("webhook_secret").is_none());

    let (status, body) = h.request(h.get("/v1/batches?status=pending")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (status, body) = h.request(h.get("/v1/batches?status=completed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_admission_rejections_surface_kind_and_retry_after() {
    let h = harness().await;
    // No worker heartbeat: 503 worker_unavailable with Retry-After.
    let file_id = h.upload_input(&["a"]);
    let body = serde_json::json!({"input_file_id": file_id, "model": "m1"});
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/batches")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get("retry-after").unwrap(), "30");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"]["kind"], "worker_unavailable");

    // Unknown input file: 400 invalid_input, no row inserted.
    h.healthy_worker().await;
    let (status, json) = h.submit("file-does-not-exist").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["kind"], "invalid_input");
    assert!(h.catalog.list_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_pending_batch() {
    let h = harness().await;
    h.healthy_worker().await;
    let file_id = h.upload_input(&["a", "b"]);
    let (_, body) = h.submit(&file_id).await;
    let batch_id = body["batch_id"].as_str().unwrap().to_string();

    let (status, _) = h
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/batches/{}", batch_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let job = h.catalog.get_job(&batch_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.total_requests, 2);
    assert!(job.output_file_id.is_none());

    // Cancelling again conflicts: the job is terminal now.
    let (status, body) = h
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/batches/{}", batch_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["message"], "terminal");
}

#[tokio::test]
async fn test_cancel_running_batch_conflicts() {
    let h = harness().await;
    h.healthy_worker().await;
    let file_id = h.upload_input(&["a"]);
    let (_, body) = h.submit(&file_id).await;
    let batch_id = body["batch_id"].as_str().unwrap().to_string();
    h.catalog
        .cas_status(&batch_id, JobStatus::Pending, JobStatus::InProgress)
        .await
        .unwrap();

    let (status, body) = h
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/batches/{}", batch_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["message"], "already_running");
}

#[tokio::test]
async fn test_results_require_a_terminal_job() {
    let h = harness().await;
    h.healthy_worker().await;
    let file_id = h.upload_input(&["a"]);
    let (_, body) = h.submit(&file_id).await;
    let batch_id = body["batch_id"].as_str().unwrap().to_string();

    let (status, _) = h
        .request(h.get(&format!("/v1/batches/{}/results", batch_id)))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Complete the job by hand with one output line.
    h.catalog
        .cas_status(&batch_id, JobStatus::Pending, JobStatus::InProgress)
        .await
        .unwrap();
    let output_id = h
        .catalog
        .get_job(&batch_id)
        .await
        .unwrap()
        .unwrap()
        .output_file_id();
    h.store
        .append_line(&output_id, r#"{"custom_id": "a", "response": {"status_code": 200, "body": {"choices": [{"message": {"content": "4"}}], "usage": {"prompt_tokens": 3, "completion_tokens": 1}}}}"#)
        .unwrap();
    h.catalog
        .set_output_file_once(&batch_id, &output_id)
        .await
        .unwrap();
    h.catalog
        .cas_status(&batch_id, JobStatus::InProgress, JobStatus::Completed)
        .await
        .unwrap();

    let (status, raw) = h
        .raw(h.get(&format!("/v1/batches/{}/results", batch_id)))
        .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(raw).unwrap();
    assert_eq!(text.lines().count(), 1);
    assert!(text.contains(r#""custom_id":"a""#) || text.contains(r#""custom_id": "a""#));
}

#[tokio::test]
async fn test_failed_requests_listing() {
    let h = harness().await;
    h.healthy_worker().await;
    let file_id = h.upload_input(&["a", "b"]);
    let (_, body) = h.submit(&file_id).await;
    let batch_id = body["batch_id"].as_str().unwrap().to_string();

    h.catalog
        .insert_failed_request(
            &batch_id,
            "b",
            batch_common::error::ErrorKind::RequestFailed,
            "prompt rejected",
        )
        .await
        .unwrap();

    let (status, body) = h
        .request(h.get(&format!("/v1/batches/{}/failed", batch_id)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["custom_id"], "b");
    assert_eq!(body[0]["error_kind"], "request_failed");

    let (status, _) = h.request(h.get("/v1/batches/batch-nope/failed")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_reflects_worker_freshness() {
    let h = harness().await;

    let (status, _) = h.request(h.get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    h.healthy_worker().await;
    let (status, body) = h.request(h.get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["worker"]["available"], true);
    assert_eq!(body["gpu"]["memory_percent"], 30.0);
    assert_eq!(body["queue"]["active_jobs"], 0);
}

/// A webhook receiver whose status code can be flipped at runtime.
async fn start_flippable_hook() -> (std::net::SocketAddr, Arc<AtomicU16>) {
    use axum::extract::State as AxumState;
    use axum::routing::post;

    let status = Arc::new(AtomicU16::new(500));
    let app = Router::new()
        .route(
            "/hook",
            post(
                |AxumState(status): AxumState<Arc<AtomicU16>>| async move {
                    StatusCode::from_u16(status.load(Ordering::Relaxed)).unwrap()
                },
            ),
        )
        .with_state(status.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, status)
}

#[tokio::test]
async fn test_dead_letter_redrive_flow() {
    let h = harness().await;
    let (addr, hook_status) = start_flippable_hook().await;

    let dead_letter = h
        .catalog
        .insert_dead_letter(
            "batch-1",
            &format!("http://{}/hook", addr),
            WebhookEvent::Completed,
            r#"{"event":"completed","batch_id":"batch-1"}"#,
            "received status 500",
            3,
        )
        .await
        .unwrap();
    let retry_uri = format!("/v1/webhooks/dead-letter/{}/retry", dead_letter.id);

    // Listed for operators.
    let (status, body) = h.request(h.get("/v1/webhooks/dead-letter")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    // Receiver still failing: the attempt is recorded, retry_success stays false.
    let (status, body) = h
        .request(
            Request::builder()
                .method("POST")
                .uri(&retry_uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retry_success"], false);
    let row = h
        .catalog
        .get_dead_letter(&dead_letter.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!row.retry_success);
    assert!(row.last_retried_at.is_some());

    // Receiver fixed: the re-drive succeeds.
    hook_status.store(200, Ordering::Relaxed);
    let (status, body) = h
        .request(
            Request::builder()
                .method("POST")
                .uri(&retry_uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retry_success"], true);

    // Re-driving a successful letter requires force.
    let (status, body) = h
        .request(
            Request::builder()
                .method("POST")
                .uri(&retry_uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "already_retried");

    let (status, body) = h
        .request(
            Request::builder()
                .method("POST")
                .uri(format!("{}?force=true", retry_uri))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retry_success"], true);
    assert_eq!(body["forced"], true);
    let row = h
        .catalog
        .get_dead_letter(&dead_letter.id)
        .await
        .unwrap()
        .unwrap();
    assert!(row.forced);
}
