//! The seam to the backing inference engine.
//!
//! The engine is a black box that owns the GPU between `load` and `unload`.
//! `HttpEngine` drives an engine sidecar over three HTTP endpoints
//! (`/v1/models/load`, `/v1/models/unload`, `/v1/generate`); `MockEngine` is
//! the scriptable double the executor and scheduler tests run against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use batch_common::request::{ChatMessage, RequestLine};

/// Per-request sampling knobs, carried alongside the rendered messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Sampling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

/// One prompt as handed to the engine: the request's messages rendered
/// through the adapter's prompt-formatting contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
    pub sampling: Sampling,
}

impl Prompt {
    pub fn from_request(request: &RequestLine) -> Self {
        Self {
            messages: request.body.messages.clone(),
            sampling: Sampling {
                max_tokens: request.body.max_tokens,
                temperature: request.body.temperature,
                top_p: request.body.top_p,
                stop: request.body.stop.clone(),
                seed: request.body.seed,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A failure scoped to one prompt. The chunk keeps going.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFailure {
    pub message: String,
}

pub type GenerateResult = Vec<Result<Completion, RequestFailure>>;

/// Errors that take down the whole call, not a single prompt.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load model {model}: {message}")]
    LoadFailed { model: String, message: String },
    #[error("engine transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("engine failure: {0}")]
    Fatal(String),
}

/// Lifecycle over the backing engine.
///
/// Contract: `generate` is synchronous from the caller's point of view and
/// returns one element per prompt, in input order, with per-element errors
/// for prompts that failed individually. `load` is idempotent for the model
/// that is already resident. The adapter owns GPU memory exclusively between
/// `load` and `unload`; callers wait out a cooldown between an `unload` and
/// the next `load`.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn load(&self, model: &str) -> Result<(), EngineError>;
    async fn unload(&self) -> Result<(), EngineError>;
    async fn generate(&self, prompts: &[Prompt]) -> Result<GenerateResult, EngineError>;
    async fn loaded_model(&self) -> Option<String>;
}

/// Adapter over an engine sidecar process reachable by HTTP.
pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
    loaded: Mutex<Option<String>>,
}

#[derive(Serialize)]
struct LoadRequest<'a> {
    model: &'a str,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompts: &'a [Prompt],
}

#[derive(Deserialize)]
struct GenerateResponse {
    results: Vec<GenerateResultLine>,
}

#[derive(Deserialize)]
struct GenerateResultLine {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpEngine {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            loaded: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl InferenceEngine for HttpEngine {
    async fn load(&self, model: &str) -> Result<(), EngineError> {
        let mut loaded = self.loaded.lock().await;
        if loaded.as_deref() == Some(model) {
            return Ok(());
        }

        let response = self
            .client
            .post(self.url("/v1/models/load"))
            .json(&LoadRequest { model })
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::LoadFailed {
                model: model.to_string(),
                message: format!("sidecar returned {}: {}", status, body),
            });
        }

        *loaded = Some(model.to_string());
        Ok(())
    }

    async fn unload(&self) -> Result<(), EngineError> {
        let mut loaded = self.loaded.lock().await;
        if loaded.is_none() {
            return Ok(());
        }

        let response = self
            .client
            .post(self.url("/v1/models/unload"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::Fatal(format!(
                "unload returned {}",
                response.status()
            )));
        }

        *loaded = None;
        Ok(())
    }

    async fn generate(&self, prompts: &[Prompt]) -> Result<GenerateResult, EngineError> {
        let model = self
            .loaded
            .lock()
            .await
            .clone()
            .ok_or_else(|| EngineError::Fatal("generate called with no model loaded".into()))?;

        let response = self
            .client
            .post(self.url("/v1/generate"))
            .json(&GenerateRequest {
                model: &model,
                prompts,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::Fatal(format!(
                "generate returned {}",
                response.status()
            )));
        }

        let parsed: GenerateResponse = response.json().await?;
        if parsed.results.len() != prompts.len() {
            return Err(EngineError::Fatal(format!(
                "engine returned {} results for {} prompts",
                parsed.results.len(),
                prompts.len()
            )));
        }

        Ok(parsed
            .results
            .into_iter()
            .map(|line| match line.error {
                Some(message) => Err(RequestFailure { message }),
                None => Ok(Completion {
                    content: line.content.unwrap_or_default(),
                    prompt_tokens: line.prompt_tokens.unwrap_or(0),
                    completion_tokens: line.completion_tokens.unwrap_or(0),
                }),
            })
            .collect())
    }

    async fn loaded_model(&self) -> Option<String> {
        self.loaded.lock().await.clone()
    }
}

/// Scriptable engine double.
///
/// Behaviour is driven by marker strings in the last message of a prompt:
/// [`MockEngine::FAIL_MARKER`] provokes a per-request failure and
/// [`MockEngine::FATAL_MARKER`] an engine-level failure for the whole call.
/// Models listed in `refuse_models` fail to load.
pub struct MockEngine {
    state: Mutex<MockEngineState>,
    refuse_models: Vec<String>,
}

#[derive(Default)]
struct MockEngineState {
    loaded: Option<String>,
    loads: Vec<String>,
    unloads: u32,
    generate_calls: u32,
}

impl MockEngine {
    pub const FAIL_MARKER: &'static str = "__fail_request__";
    pub const FATAL_MARKER: &'static str = "__fatal__";

    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockEngineState::default()),
            refuse_models: Vec::new(),
        }
    }

    pub fn refusing_models(models: &[&str]) -> Self {
        Self {
            state: Mutex::new(MockEngineState::default()),
            refuse_models: models.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Every model ever passed to `load`, including idempotent re-loads.
    pub async fn loads(&self) -> Vec<String> {
        self.state.lock().await.loads.clone()
    }

    pub async fn unload_count(&self) -> u32 {
        self.state.lock().await.unloads
    }

    pub async fn generate_calls(&self) -> u32 {
        self.state.lock().await.generate_calls
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn load(&self, model: &str) -> Result<(), EngineError> {
        if self.refuse_models.iter().any(|m| m == model) {
            return Err(EngineError::LoadFailed {
                model: model.to_string(),
                message: "model not available".to_string(),
            });
        }

        let mut state = self.state.lock().await;
        if state.loaded.as_deref() == Some(model) {
            return Ok(());
        }
        state.loads.push(model.to_string());
        state.loaded = Some(model.to_string());
        Ok(())
    }

    async fn unload(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.loaded.take().is_some() {
            state.unloads += 1;
        }
        Ok(())
    }

    async fn generate(&self, prompts: &[Prompt]) -> Result<GenerateResult, EngineError> {
        {
            let mut state = self.state.lock().await;
            if state.loaded.is_none() {
                return Err(EngineError::Fatal("no model loaded".to_string()));
            }
            state.generate_calls += 1;
        }

        let mut results = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let last = prompt
                .messages
                .last()
                .map(|m| m.content.as_str())
                .unwrap_or("");
            if last.contains(Self::FATAL_MARKER) {
                return Err(EngineError::Fatal("engine crashed mid-batch".to_string()));
            }
            if last.contains(Self::FAIL_MARKER) {
                results.push(Err(RequestFailure {
                    message: "prompt rejected by engine".to_string(),
                }));
            } else {
                let prompt_tokens = prompt
                    .messages
                    .iter()
                    .map(|m| m.content.split_whitespace().count() as u32)
                    .sum();
                results.push(Ok(Completion {
                    content: format!("completion for: {}", last),
                    prompt_tokens,
                    completion_tokens: 3,
                }));
            }
        }
        Ok(results)
    }

    async fn loaded_model(&self) -> Option<String> {
        self.state.lock().await.loaded.clone()
    }
}
