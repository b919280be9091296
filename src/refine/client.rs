//! Model client.
//!
//! Sends one completion request per chunk to an HTTP LLM backend and turns
//! every outcome into a [`CompletionResult`]. Transient failures (transport
//! errors, timeouts, HTTP 429 and 5xx) are retried with exponential backoff;
//! nothing transient ever leaves this module.
//!
//! Two wire dialects are supported:
//! - **Ollama**: `POST {base}/api/generate`, fragment at `/response`
//! - **OpenAI**: `POST {base}/v1/chat/completions`, fragment at
//!   `/choices/0/message/content`

use crate::config::Config;
use crate::defaults;
use crate::error::Result;
use crate::refine::types::{ChunkFailure, CompletionRequest, CompletionResult, RequestState};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const OLLAMA_GENERATE_PATH: &str = "/api/generate";
const OPENAI_CHAT_PATH: &str = "/v1/chat/completions";

/// Error bodies longer than this are truncated in failure messages.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Backend wire dialect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Ollama,
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::OpenAi => "openai",
        }
    }

    /// JSON pointer of the refined text in a successful response.
    pub fn default_response_pointer(&self) -> &'static str {
        match self {
            Provider::Ollama => "/response",
            Provider::OpenAi => "/choices/0/message/content",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Provider::Ollama),
            "openai" => Ok(Provider::OpenAi),
            _ => Err(format!(
                "Unknown provider: {}. Use 'ollama' or 'openai'",
                s
            )),
        }
    }
}

/// Builds the request URL from a base URL.
///
/// A trailing slash is dropped; a base that already names the API path is
/// used as is.
pub fn normalize_endpoint(provider: Provider, base: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    match provider {
        Provider::Ollama if base.ends_with(OLLAMA_GENERATE_PATH) => base.to_string(),
        Provider::Ollama => format!("{}{}", base, OLLAMA_GENERATE_PATH),
        Provider::OpenAi if base.ends_with("/chat/completions") => base.to_string(),
        Provider::OpenAi if base.ends_with("/v1") => format!("{}/chat/completions", base),
        Provider::OpenAi => format!("{}{}", base, OPENAI_CHAT_PATH),
    }
}

/// Retry schedule for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base_delay * 2^n`, capped at `max_delay`.
    pub fn backoff(&self) -> ExponentialBuilder {
        let retries = self.max_attempts.saturating_sub(1) as usize;
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(retries);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Model client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub provider: Provider,
    /// Base URL or full API URL.
    pub endpoint: String,
    pub model: String,
    /// Sent as a bearer token when set.
    pub api_key: Option<String>,
    /// Overrides the provider's default response pointer.
    pub response_pointer: Option<String>,
    /// Per-attempt timeout.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            endpoint: defaults::DEFAULT_ENDPOINT.to_string(),
            model: defaults::DEFAULT_MODEL.to_string(),
            api_key: None,
            response_pointer: None,
            request_timeout: Duration::from_millis(defaults::REQUEST_TIMEOUT_MS),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider: config.model.provider,
            endpoint: config.model.endpoint.clone(),
            model: config.model.model.clone(),
            api_key: config.model.api_key.clone(),
            response_pointer: config.model.response_pointer.clone(),
            request_timeout: Duration::from_millis(config.refine.request_timeout_ms),
            retry: RetryPolicy {
                max_attempts: config.refine.max_retry_attempts,
                base_delay: Duration::from_millis(config.refine.retry_base_delay_ms),
                max_delay: Duration::from_millis(config.refine.retry_max_delay_ms),
                jitter: true,
            },
        }
    }

    /// Full request URL.
    pub fn url(&self) -> String {
        normalize_endpoint(self.provider, &self.endpoint)
    }

    /// JSON pointer used to extract the fragment.
    pub fn pointer(&self) -> &str {
        self.response_pointer
            .as_deref()
            .unwrap_or_else(|| self.provider.default_response_pointer())
    }
}

/// Anything that can turn a [`CompletionRequest`] into a [`CompletionResult`].
///
/// Implementations never return transient errors: the result is either a
/// fragment or a terminal [`ChunkFailure`].
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> CompletionResult;

    /// Model name, used in cache keys and the sidecar.
    fn model_name(&self) -> &str;
}

/// Failure of a single HTTP attempt.
#[derive(Error, Debug)]
enum AttemptError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Format(String),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Transport(_) | AttemptError::Timeout => true,
            AttemptError::Status { status, .. } => *status == 429 || *status >= 500,
            AttemptError::Format(_) => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AttemptError::Timeout
        } else {
            AttemptError::Transport(err.to_string())
        }
    }
}

/// HTTP client for the model backend.
///
/// Holds one connection pool; build one per run and drop it afterwards.
pub struct ModelClient {
    http: reqwest::Client,
    config: ClientConfig,
    url: String,
}

impl ModelClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        let url = config.url();
        tracing::debug!(url = %url, provider = %config.provider, model = %config.model, "Created model client");
        Ok(Self { http, config, url })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Full request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        match self.config.provider {
            Provider::Ollama => serde_json::json!({
                "model": self.config.model,
                "prompt": request.prompt,
                "system": request.system,
                "stream": false,
            }),
            Provider::OpenAi => serde_json::json!({
                "model": self.config.model,
                "messages": [
                    {"role": "system", "content": request.system},
                    {"role": "user", "content": request.prompt}
                ],
                "stream": false,
            }),
        }
    }

    async fn send_once(&self, request: &CompletionRequest) -> std::result::Result<String, AttemptError> {
        let mut builder = self
            .http
            .post(&self.url)
            .json(&self.request_body(request))
            .timeout(self.config.request_timeout);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(AttemptError::from_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(AttemptError::from_reqwest)?;

        if !status.is_success() {
            return Err(AttemptError::Status {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY_CHARS),
            });
        }
        extract_fragment(&body, self.config.pointer())
    }
}

#[async_trait]
impl CompletionBackend for ModelClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> CompletionResult {
        let chunk = request.chunk_index;
        log_transition(chunk, RequestState::Pending);
        if cancel.is_cancelled() {
            return CompletionResult::failure(chunk, ChunkFailure::Cancelled, 0);
        }

        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let retrying = (|| async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            log_transition(chunk, RequestState::Sending { attempt });
            self.send_once(request).await
        })
        .retry(self.config.retry.backoff())
        .when(AttemptError::is_retryable)
        .notify(|err: &AttemptError, delay: Duration| {
            let state = RequestState::RetryableFailure {
                attempt: attempts.load(Ordering::SeqCst),
            };
            tracing::warn!(
                chunk,
                state = %state,
                error = %err,
                retry_delay_ms = delay.as_millis() as u64,
                "Retrying completion request"
            );
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = retrying => Some(result),
        };
        let attempts = counter.load(Ordering::SeqCst);

        match outcome {
            Some(Ok(fragment)) => {
                log_transition(chunk, RequestState::Succeeded);
                CompletionResult::success(chunk, fragment, attempts)
            }
            Some(Err(err)) => {
                log_transition(chunk, RequestState::TerminalFailure);
                let failure = match err {
                    AttemptError::Status { status, body } if !(status == 429 || status >= 500) => {
                        ChunkFailure::RequestRejected { status, body }
                    }
                    AttemptError::Format(message) => ChunkFailure::ResponseFormat { message },
                    other => ChunkFailure::RetriesExhausted {
                        attempts,
                        last_error: other.to_string(),
                    },
                };
                tracing::error!(chunk, attempts, error = %failure, "Completion request failed");
                CompletionResult::failure(chunk, failure, attempts)
            }
            None => {
                tracing::debug!(chunk, attempts, "Completion request cancelled");
                CompletionResult::failure(chunk, ChunkFailure::Cancelled, attempts)
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

fn log_transition(chunk: usize, state: RequestState) {
    tracing::debug!(chunk, state = %state, "Completion request state");
}

fn extract_fragment(body: &str, pointer: &str) -> std::result::Result<String, AttemptError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| {
        AttemptError::Format(format!(
            "response is not JSON ({}): {}",
            e,
            truncate(body, MAX_ERROR_BODY_CHARS)
        ))
    })?;
    value
        .pointer(pointer)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AttemptError::Format(format!("no string at JSON pointer {}", pointer)))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Returns the transcript part of a user prompt built by the prompt builder.
fn transcript_section(prompt: &str) -> &str {
    match prompt.rfind("\n\nTranscript:\n") {
        Some(idx) => &prompt[idx + "\n\nTranscript:\n".len()..],
        None => prompt,
    }
}

fn echo(request: &CompletionRequest) -> std::result::Result<String, ChunkFailure> {
    Ok(transcript_section(&request.prompt).to_string())
}

type Responder = dyn Fn(&CompletionRequest) -> std::result::Result<String, ChunkFailure> + Send + Sync;
type Latency = dyn Fn(usize) -> Duration + Send + Sync;

/// In-process backend for tests.
///
/// Echoes the transcript section of each prompt unless a responder is set,
/// and records how many calls were in flight at once.
#[derive(Clone)]
pub struct MockBackend {
    model_name: String,
    responder: Arc<Responder>,
    latency: Arc<Latency>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Create a mock backend that echoes the chunk text.
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            responder: Arc::new(echo),
            latency: Arc::new(|_: usize| Duration::ZERO),
            calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Configure how each request is answered.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> std::result::Result<String, ChunkFailure> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Configure a per-chunk delay.
    pub fn with_latency<F>(mut self, latency: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        self.latency = Arc::new(latency);
        self
    }

    /// Configure the mock to fail the given chunk.
    pub fn with_failure_on(self, chunk_index: usize) -> Self {
        self.with_responder(move |req| {
            if req.chunk_index == chunk_index {
                Err(ChunkFailure::RetriesExhausted {
                    attempts: 3,
                    last_error: "HTTP 500: mock failure".to_string(),
                })
            } else {
                echo(req)
            }
        })
    }

    /// Requests received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent requests observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> CompletionResult {
        let chunk = request.chunk_index;
        if cancel.is_cancelled() {
            return CompletionResult::failure(chunk, ChunkFailure::Cancelled, 0);
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = (self.latency)(chunk);
        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if cancelled {
            return CompletionResult::failure(chunk, ChunkFailure::Cancelled, 1);
        }
        match (self.responder)(request) {
            Ok(fragment) => CompletionResult::success(chunk, fragment, 1),
            Err(failure) => CompletionResult::failure(chunk, failure, 1),
        }
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(index: usize, prompt: &str) -> CompletionRequest {
        CompletionRequest {
            chunk_index: index,
            system: "sys".to_string(),
            prompt: prompt.to_string(),
            is_first: index == 0,
            is_last: false,
        }
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("ollama".parse::<Provider>().unwrap(), Provider::Ollama);
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert!("mistral".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_serde_is_lowercase() {
        let json = serde_json::to_string(&Provider::OpenAi).unwrap();
        assert_eq!(json, "\"openai\"");
        let parsed: Provider = serde_json::from_str("\"ollama\"").unwrap();
        assert_eq!(parsed, Provider::Ollama);
    }

    #[test]
    fn test_normalize_endpoint_ollama() {
        assert_eq!(
            normalize_endpoint(Provider::Ollama, "http://127.0.0.1:11434/"),
            "http://127.0.0.1:11434/api/generate"
        );
        assert_eq!(
            normalize_endpoint(Provider::Ollama, "http://host:1/api/generate"),
            "http://host:1/api/generate"
        );
    }

    #[test]
    fn test_normalize_endpoint_openai() {
        assert_eq!(
            normalize_endpoint(Provider::OpenAi, "https://api.openai.com"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            normalize_endpoint(Provider::OpenAi, "http://localhost:8080/v1/"),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(
            normalize_endpoint(Provider::OpenAi, "http://x/v1/chat/completions"),
            "http://x/v1/chat/completions"
        );
    }

    #[test]
    fn test_pointer_defaults_and_override() {
        let mut config = ClientConfig::default();
        assert_eq!(config.pointer(), "/response");
        config.provider = Provider::OpenAi;
        assert_eq!(config.pointer(), "/choices/0/message/content");
        config.response_pointer = Some("/output/text".to_string());
        assert_eq!(config.pointer(), "/output/text");
    }

    #[test]
    fn test_extract_fragment() {
        let fragment = extract_fragment(r##"{"response":"# Notes"}"##, "/response").unwrap();
        assert_eq!(fragment, "# Notes");
    }

    #[test]
    fn test_extract_fragment_rejects_non_json() {
        let err = extract_fragment("<html>busy</html>", "/response").unwrap_err();
        assert!(matches!(err, AttemptError::Format(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_extract_fragment_rejects_missing_field() {
        let err = extract_fragment(r#"{"done":true}"#, "/response").unwrap_err();
        assert!(err.to_string().contains("/response"));
    }

    #[test]
    fn test_attempt_error_classification() {
        let status = |s| AttemptError::Status {
            status: s,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(AttemptError::Timeout.is_retryable());
        assert!(AttemptError::Transport("refused".to_string()).is_retryable());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[test]
    fn test_transcript_section() {
        assert_eq!(transcript_section("plain"), "plain");
        assert_eq!(
            transcript_section("Context (x):\nold\n\nTranscript:\nnew text"),
            "new text"
        );
    }

    #[test]
    fn test_client_config_from_config() {
        let mut config = Config::default();
        config.model.provider = Provider::OpenAi;
        config.refine.max_retry_attempts = 5;
        config.refine.request_timeout_ms = 1500;
        let client = ClientConfig::from_config(&config);
        assert_eq!(client.provider, Provider::OpenAi);
        assert_eq!(client.retry.max_attempts, 5);
        assert_eq!(client.request_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_model_client_builds_url() {
        let client = ModelClient::new(ClientConfig::default()).unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:11434/api/generate");
        assert_eq!(client.model_name(), "llama3.1");
    }

    #[tokio::test]
    async fn test_model_client_respects_pre_cancelled_token() {
        let client = ModelClient::new(ClientConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.complete(&request(0, "x"), &cancel).await;
        assert_eq!(result.outcome, Err(ChunkFailure::Cancelled));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn test_mock_backend_echoes_transcript_section() {
        let mock = MockBackend::new("mock");
        let cancel = CancellationToken::new();
        let result = mock
            .complete(&request(1, "Context (c):\nold\n\nTranscript:\nfresh"), &cancel)
            .await;
        assert_eq!(result.fragment(), Some("fresh"));
        assert_eq!(mock.calls(), 1);
        assert_eq!(mock.model_name(), "mock");
    }

    #[tokio::test]
    async fn test_mock_backend_failure_on_chunk() {
        let mock = MockBackend::new("mock").with_failure_on(2);
        let cancel = CancellationToken::new();
        assert!(mock.complete(&request(1, "a"), &cancel).await.is_success());
        let failed = mock.complete(&request(2, "b"), &cancel).await;
        assert!(matches!(
            failed.outcome,
            Err(ChunkFailure::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_backend_cancelled_during_latency() {
        let mock = MockBackend::new("mock").with_latency(|_| Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = mock.complete(&request(0, "a"), &cancel).await;
        assert_eq!(result.outcome, Err(ChunkFailure::Cancelled));
    }
}
