//! Webhook delivery: payload shape, HMAC signing and the retry loop.
//!
//! Delivery is shared between the worker's dispatcher (terminal and progress
//! notifications) and the API's dead-letter re-drive endpoint, so both go
//! through the same signing and retry logic.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header;
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::dns::{is_error_source, is_safe_webhook_host, NoPublicIPv4Error, PublicIPv4Resolver};
use crate::job::BatchJob;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

pub const DEFAULT_RETRIES: u32 = 3;
pub const MIN_RETRIES: u32 = 1;
pub const MAX_RETRIES: u32 = 10;

pub const DEFAULT_TIMEOUT_S: u64 = 30;
pub const MIN_TIMEOUT_S: u64 = 5;
pub const MAX_TIMEOUT_S: u64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// Build the client used for webhook requests. Timeouts are set per attempt
/// from each job's own configuration.
///
/// Unless `allow_internal_ips` is set, DNS resolution is filtered to public
/// IPv4 addresses and redirects may only follow to safe hosts, so a
/// caller-supplied URL cannot be used to reach into the local network.
pub fn build_http_client(allow_internal_ips: bool) -> reqwest::Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("batch-webhooks");
    if !allow_internal_ips {
        builder = builder
            .dns_resolver(Arc::new(PublicIPv4Resolver {}))
            .redirect(Policy::custom(|attempt| {
                if is_safe_webhook_host(attempt.url()) {
                    attempt.follow()
                } else {
                    attempt.error(NoPublicIPv4Error)
                }
            }));
    }
    builder.build()
}

/// The closed set of events a job may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WebhookEvent {
    Completed,
    Failed,
    Progress,
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookEvent::Completed => write!(f, "completed"),
            WebhookEvent::Failed => write!(f, "failed"),
            WebhookEvent::Progress => write!(f, "progress"),
        }
    }
}

impl FromStr for WebhookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(WebhookEvent::Completed),
            "failed" => Ok(WebhookEvent::Failed),
            "progress" => Ok(WebhookEvent::Progress),
            invalid => Err(format!("{} is not a valid webhook event", invalid)),
        }
    }
}

/// Per-job delivery configuration, with retries and timeout clamped into
/// their supported ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: Option<String>,
    pub events: Option<Vec<WebhookEvent>>,
    pub retries: u32,
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn new(
        url: String,
        secret: Option<String>,
        events: Option<Vec<WebhookEvent>>,
        retries: Option<i64>,
        timeout_s: Option<i64>,
    ) -> Self {
        let retries = retries
            .map(|r| (r.max(MIN_RETRIES as i64) as u32).min(MAX_RETRIES))
            .unwrap_or(DEFAULT_RETRIES);
        let timeout_s = timeout_s
            .map(|t| (t.max(MIN_TIMEOUT_S as i64) as u64).min(MAX_TIMEOUT_S))
            .unwrap_or(DEFAULT_TIMEOUT_S);
        Self {
            url,
            secret,
            events,
            retries,
            timeout: Duration::from_secs(timeout_s),
        }
    }
}

/// The notification body. Serialized once per delivery; the exact bytes are
/// what the signature covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub batch_id: String,
    pub status: String,
    pub total_requests: i64,
    pub completed_requests: i64,
    pub failed_requests: i64,
    pub timestamp: i64,
}

impl WebhookPayload {
    pub fn for_job(event: WebhookEvent, job: &BatchJob) -> Self {
        Self {
            event,
            batch_id: job.id.clone(),
            status: job.status.to_string(),
            total_requests: job.total_requests,
            completed_requests: job.completed_requests,
            failed_requests: job.failed_requests,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Hex HMAC-SHA256 over the exact payload bytes, in the
/// `sha256=<hex>` header format.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature against payload bytes.
pub fn verify(secret: &str, payload: &[u8], signature: &str) -> bool {
    sign(secret, payload) == signature
}

/// Exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval after the first failed attempt.
    initial_interval: Duration,
    /// The maximum possible backoff between attempts.
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// The interval to sleep after failed attempt number `attempt` (1-based).
    pub fn interval_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let candidate = self.initial_interval * self.backoff_coefficient.pow(exponent);
        match self.maximum_interval {
            Some(max) => std::cmp::min(candidate, max),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(2),
            maximum_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// A successful delivery: which attempt landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub attempts: u32,
}

/// All attempts exhausted. Carries what the dead letter needs.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub attempts: u32,
    pub last_error: String,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "webhook delivery failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

/// POST `payload` to `config.url`, retrying with backoff until a 2xx lands
/// or `config.retries` attempts are spent.
///
/// The timestamp header and the signature are rebuilt inside the loop on
/// every attempt. Hoisting them out would resend a stale timestamp on
/// retries, which verifiers enforcing freshness windows reject.
pub async fn deliver(
    client: &reqwest::Client,
    config: &WebhookConfig,
    payload: &[u8],
    policy: &RetryPolicy,
) -> Result<Delivery, DeliveryFailure> {
    let mut last_error = String::new();

    for attempt in 1..=config.retries {
        let mut request = client
            .post(&config.url)
            .timeout(config.timeout)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, Utc::now().timestamp().to_string());
        if let Some(secret) = &config.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, payload));
        }

        match request.body(payload.to_vec()).send().await {
            Ok(response) if response.status().is_success() => {
                metrics::counter!("webhook_deliveries_total").increment(1);
                return Ok(Delivery { attempts: attempt });
            }
            Ok(response) => {
                last_error = format!("received status {}", response.status());
            }
            Err(error) => {
                last_error = error.to_string();
                // A host with no public address will not grow one by the next
                // attempt; stop retrying.
                if is_error_source::<NoPublicIPv4Error>(&error) {
                    metrics::counter!("webhook_deliveries_rejected_total").increment(1);
                    warn!(url = %config.url, "webhook host has no public address");
                    return Err(DeliveryFailure {
                        attempts: attempt,
                        last_error: format!("{}: {}", NoPublicIPv4Error, last_error),
                    });
                }
            }
        }

        metrics::counter!("webhook_delivery_retries_total").increment(1);
        warn!(
            url = %config.url,
            attempt,
            error = %last_error,
            "webhook attempt failed"
        );

        if attempt < config.retries {
            tokio::time::sleep(policy.interval_after(attempt)).await;
        }
    }

    metrics::counter!("webhook_deliveries_exhausted_total").increment(1);
    Err(DeliveryFailure {
        attempts: config.retries,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(10), None)
    }

    #[test]
    fn test_signature_is_stable_and_verifiable() {
        let signature = sign("top-secret", b"{\"event\":\"completed\"}");
        assert!(signature.starts_with("sha256="));
        // 32-byte digest, hex encoded.
        assert_eq!(signature.len(), "sha256=".len() + 64);

        assert!(verify("top-secret", b"{\"event\":\"completed\"}", &signature));
        assert!(!verify("other-secret", b"{\"event\":\"completed\"}", &signature));
        assert!(!verify("top-secret", b"{\"event\":\"failed\"}", &signature));
    }

    #[test]
    fn test_retry_policy_backs_off_exponentially() {
        let policy = RetryPolicy::new(2, Duration::from_secs(2), None);
        assert_eq!(policy.interval_after(1), Duration::from_secs(2));
        assert_eq!(policy.interval_after(2), Duration::from_secs(4));
        assert_eq!(policy.interval_after(3), Duration::from_secs(8));

        let capped = RetryPolicy::new(2, Duration::from_secs(2), Some(Duration::from_secs(5)));
        assert_eq!(capped.interval_after(3), Duration::from_secs(5));
    }

    #[test]
    fn test_config_clamps_retries_and_timeout() {
        let config = WebhookConfig::new("https://example.com".to_string(), None, None, None, None);
        assert_eq!(config.retries, DEFAULT_RETRIES);
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_S));

        let config =
            WebhookConfig::new("https://example.com".to_string(), None, None, Some(0), Some(1));
        assert_eq!(config.retries, MIN_RETRIES);
        assert_eq!(config.timeout, Duration::from_secs(MIN_TIMEOUT_S));

        let config = WebhookConfig::new(
            "https://example.com".to_string(),
            None,
            None,
            Some(100),
            Some(100_000),
        );
        assert_eq!(config.retries, MAX_RETRIES);
        assert_eq!(config.timeout, Duration::from_secs(MAX_TIMEOUT_S));
    }

    #[test]
    fn test_event_parsing_is_closed() {
        assert_eq!(
            WebhookEvent::from_str("completed").unwrap(),
            WebhookEvent::Completed
        );
        assert_eq!(
            WebhookEvent::from_str("progress").unwrap(),
            WebhookEvent::Progress
        );
        assert!(WebhookEvent::from_str("finished").is_err());
    }

    #[tokio::test]
    async fn test_deliver_succeeds_first_try() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .header("content-type", "application/json");
                then.status(200);
            })
            .await;

        let config = WebhookConfig::new(server.url("/hook"), None, None, Some(3), None);
        // The mock server lives on loopback, so internal IPs must be allowed.
        let client = build_http_client(true).unwrap();
        let delivery = deliver(&client, &config, b"{}", &fast_policy())
            .await
            .unwrap();

        assert_eq!(delivery.attempts, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deliver_refuses_internal_hosts_without_retrying() {
        let config = WebhookConfig::new(
            "http://localhost:9/hook".to_string(),
            None,
            None,
            Some(3),
            None,
        );
        let client = build_http_client(false).unwrap();
        let failure = deliver(&client, &config, b"{}", &fast_policy())
            .await
            .unwrap_err();

        // The resolver refusal is final; no backoff loop.
        assert_eq!(failure.attempts, 1);
        assert!(failure.last_error.contains("No public IPv4"));
    }

    #[tokio::test]
    async fn test_deliver_exhausts_attempts_and_reports_last_error() {
        let server = MockServer::start_async().await;
        let failures = server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(500);
            })
            .await;

        let config = WebhookConfig::new(server.url("/hook"), None, None, Some(3), None);
        let client = reqwest::Client::new();
        let failure = deliver(&client, &config, b"{}", &fast_policy())
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 3);
        assert!(failure.last_error.contains("500"));
        failures.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn test_deliver_signs_every_attempt() {
        let server = MockServer::start_async().await;
        let payload = br#"{"event":"completed","batch_id":"batch-1"}"#;
        let expected_signature = sign("s3cret", payload);

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .header("X-Webhook-Signature", &expected_signature)
                    .header_exists("X-Webhook-Timestamp");
                then.status(200);
            })
            .await;

        let config = WebhookConfig::new(
            server.url("/hook"),
            Some("s3cret".to_string()),
            None,
            Some(1),
            None,
        );
        let client = reqwest::Client::new();
        deliver(&client, &config, payload, &fast_policy())
            .await
            .unwrap();

        mock.assert_async().await;
    }
}
