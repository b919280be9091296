//! Model client and pipeline against a mock HTTP backend.

use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voxcompose::refine::{
    ChunkFailure, ClientConfig, CompletionBackend, CompletionRequest, ModelClient, Pipeline,
    PipelineConfig, PromptBuilder, Provider, RetryPolicy,
};
use voxcompose::{Config, Transcript, VoxError};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    }
}

fn ollama_client(server: &MockServer, max_attempts: u32) -> ModelClient {
    ModelClient::new(ClientConfig {
        provider: Provider::Ollama,
        endpoint: server.uri(),
        model: "llama3.1".to_string(),
        request_timeout: Duration::from_secs(5),
        retry: fast_retry(max_attempts),
        ..ClientConfig::default()
    })
    .unwrap()
}

fn request(prompt: &str) -> CompletionRequest {
    CompletionRequest {
        chunk_index: 0,
        system: "Refine this.".to_string(),
        prompt: prompt.to_string(),
        is_first: true,
        is_last: true,
    }
}

/// Answers every Ollama request with the transcript section of its prompt.
struct EchoResponder;

impl Respond for EchoResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let prompt = body["prompt"].as_str().unwrap_or_default();
        let text = match prompt.rfind("\n\nTranscript:\n") {
            Some(idx) => &prompt[idx + "\n\nTranscript:\n".len()..],
            None => prompt,
        };
        ResponseTemplate::new(200).set_body_json(json!({ "response": text }))
    }
}

#[tokio::test]
async fn ollama_success_extracts_response_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "llama3.1",
            "system": "Refine this.",
            "prompt": "um hello",
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "# Hello" })))
        .expect(1)
        .mount(&server)
        .await;

    let result = ollama_client(&server, 3)
        .complete(&request("um hello"), &CancellationToken::new())
        .await;

    assert_eq!(result.fragment(), Some("# Hello"));
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn server_errors_are_retried_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&server)
        .await;

    let result = ollama_client(&server, 3)
        .complete(&request("text"), &CancellationToken::new())
        .await;

    match result.outcome {
        Err(ChunkFailure::RetriesExhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("500"), "{}", last_error);
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(result.attempts, 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(400).set_body_string("model not found"))
        .expect(1)
        .mount(&server)
        .await;

    let result = ollama_client(&server, 3)
        .complete(&request("text"), &CancellationToken::new())
        .await;

    match result.outcome {
        Err(ChunkFailure::RequestRejected { status, body }) => {
            assert_eq!(status, 400);
            assert!(body.contains("model not found"));
        }
        other => panic!("expected RequestRejected, got {:?}", other),
    }
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn rate_limit_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "ok" })))
        .expect(1)
        .mount(&server)
        .await;

    let result = ollama_client(&server, 3)
        .complete(&request("text"), &CancellationToken::new())
        .await;

    assert_eq!(result.fragment(), Some("ok"));
    assert_eq!(result.attempts, 2);
}

#[tokio::test]
async fn malformed_body_is_a_format_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "unexpected": true })))
        .expect(1)
        .mount(&server)
        .await;

    let result = ollama_client(&server, 3)
        .complete(&request("text"), &CancellationToken::new())
        .await;

    assert!(matches!(
        result.outcome,
        Err(ChunkFailure::ResponseFormat { .. })
    ));
}

#[tokio::test]
async fn slow_responses_time_out_and_count_as_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "response": "late" }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = ModelClient::new(ClientConfig {
        endpoint: server.uri(),
        request_timeout: Duration::from_millis(50),
        retry: fast_retry(2),
        ..ClientConfig::default()
    })
    .unwrap();
    let result = client
        .complete(&request("text"), &CancellationToken::new())
        .await;

    assert!(matches!(
        result.outcome,
        Err(ChunkFailure::RetriesExhausted { attempts: 2, .. })
    ));
}

#[tokio::test]
async fn cancellation_abandons_in_flight_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "response": "never" }))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = ollama_client(&server, 3);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = client.complete(&request("text"), &cancel).await;
    assert_eq!(result.outcome, Err(ChunkFailure::Cancelled));
}

#[tokio::test]
async fn openai_dialect_sends_bearer_and_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "messages": [
                { "role": "system", "content": "Refine this." },
                { "role": "user", "content": "um hello" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "Hello." } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ModelClient::new(ClientConfig {
        provider: Provider::OpenAi,
        endpoint: server.uri(),
        model: "gpt-4o-mini".to_string(),
        api_key: Some("sk-test".to_string()),
        retry: fast_retry(1),
        ..ClientConfig::default()
    })
    .unwrap();
    let result = client
        .complete(&request("um hello"), &CancellationToken::new())
        .await;

    assert_eq!(result.fragment(), Some("Hello."));
}

#[tokio::test]
async fn custom_response_pointer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "text": "Custom." } })),
        )
        .mount(&server)
        .await;

    let client = ModelClient::new(ClientConfig {
        endpoint: server.uri(),
        response_pointer: Some("/data/text".to_string()),
        retry: fast_retry(1),
        ..ClientConfig::default()
    })
    .unwrap();
    let result = client
        .complete(&request("x"), &CancellationToken::new())
        .await;

    assert_eq!(result.fragment(), Some("Custom."));
}

fn pipeline_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.model.endpoint = server.uri();
    config.refine.max_chunk_size = 100;
    config.refine.overlap_size = 30;
    config.refine.concurrency_limit = 3;
    config.refine.retry_base_delay_ms = 1;
    config.refine.retry_max_delay_ms = 5;
    config
}

fn sentences(count: usize) -> Transcript {
    let text: String = (0..count)
        .map(|i| format!("Sentence number {:02} is here. ", i))
        .collect();
    Transcript::new(text)
}

#[tokio::test]
async fn pipeline_end_to_end_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(EchoResponder)
        .mount(&server)
        .await;

    let config = pipeline_config(&server);
    let client = ModelClient::new(ClientConfig::from_config(&config)).unwrap();
    let pipeline = Pipeline::new(
        client,
        PromptBuilder::default(),
        PipelineConfig::from_config(&config),
    );

    let transcript = sentences(16);
    let doc = pipeline
        .refine(&transcript, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(doc.markdown, transcript.text().trim());
    assert!(doc.manifest.len() > 1);
    assert!(!doc.is_partial());
}

#[tokio::test]
async fn pipeline_fails_when_backend_rejects() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let config = pipeline_config(&server);
    let client = ModelClient::new(ClientConfig::from_config(&config)).unwrap();
    let pipeline = Pipeline::new(
        client,
        PromptBuilder::default(),
        PipelineConfig::from_config(&config),
    );

    let err = pipeline
        .refine(&sentences(16), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        VoxError::Merge { failed, .. } => assert!(!failed.is_empty()),
        other => panic!("expected Merge error, got {:?}", other),
    }
}

#[tokio::test]
async fn partial_mode_emits_placeholders_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let mut config = pipeline_config(&server);
    config.refine.partial_on_failure = true;
    let client = ModelClient::new(ClientConfig::from_config(&config)).unwrap();
    let pipeline = Pipeline::new(
        client,
        PromptBuilder::default(),
        PipelineConfig::from_config(&config),
    );

    let doc = pipeline
        .refine(&sentences(8), &CancellationToken::new())
        .await
        .unwrap();

    assert!(doc.is_partial());
    assert!(doc.markdown.starts_with("> [chunk 1 failed: request rejected (HTTP 400)"));
}
