use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use ssr_harness::gateway::openrouter::{ChatProvider, OpenRouterAdapter};
use ssr_harness::gateway::{
    Attribution, ChatModel, ChatRequest, Embedder, FinishReason, GatewayConfig, Message,
    NoopUsageSink, OpenAiEmbeddings, ProviderError, ProviderGateway,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn completion(content: &str, prompt_tokens: u32, completion_tokens: u32) -> Value {
    json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": prompt_tokens, "completion_tokens": completion_tokens }
    })
}

async fn chat_server(reply: impl Respond + 'static) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(reply)
        .mount(&server)
        .await;
    server
}

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config(
        "sk-test",
        format!("{}/", server.uri()),
        Duration::from_secs(5),
        Some("https://example.test".into()),
        None,
    )
    .unwrap()
}

fn rationale_request() -> ChatRequest {
    ChatRequest::new(
        ChatModel::new("openai/gpt-5-mini"),
        vec![Message::user("Would you buy refillable toothpaste tablets?")],
        Attribution::new("test"),
    )
    .seed(Some(7))
}

#[tokio::test]
async fn json_mode_request_returns_content_and_token_counts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "model": "openai/gpt-5-mini",
            "seed": 7,
            "response_format": { "type": "json_object" }
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion(r#"{"rationale": "Looks handy."}"#, 10, 20)),
        )
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .chat(&rationale_request().json())
        .await
        .unwrap();
    assert_eq!(resp.content, r#"{"rationale": "Looks handy."}"#);
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!((resp.input_tokens, resp.output_tokens), (10, 20));
}

#[tokio::test]
async fn refusal_in_content_is_not_retryable() {
    let server = chat_server(
        ResponseTemplate::new(200).set_body_json(completion("I won't rate this product.", 3, 4)),
    )
    .await;

    let err = adapter(&server).chat(&rationale_request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn too_many_requests_keeps_status_code_and_request_id() {
    let server = chat_server(
        ResponseTemplate::new(429)
            .insert_header("x-request-id", "req-42")
            .set_body_json(json!({
                "error": { "message": "slow down", "code": "rate_limit_exceeded" }
            })),
    )
    .await;

    let err = adapter(&server).chat(&rationale_request()).await.unwrap_err();
    assert!(err.is_retryable());
    let (retry_after, ctx) = match err {
        ProviderError::RateLimited {
            retry_after,
            context: Some(ctx),
            ..
        } => (retry_after, ctx),
        other => panic!("expected a rate limit with context, got {other:?}"),
    };
    assert_eq!(retry_after, Duration::from_secs(60));
    assert_eq!(ctx.http_status, Some(429));
    assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
    assert_eq!(ctx.request_id.as_deref(), Some("req-42"));
}

#[tokio::test]
async fn bad_request_is_classified_as_invalid() {
    let server = chat_server(ResponseTemplate::new(400).set_body_json(json!({
        "error": { "message": "unknown model" }
    })))
    .await;

    let err = adapter(&server).chat(&rationale_request()).await.unwrap_err();
    assert_eq!(err.code(), "invalid_request");
    assert!(err.to_string().contains("unknown model"));
}

/// Fails with a 500 on the first call and succeeds afterwards.
#[derive(Clone)]
struct FailOnce {
    calls: Arc<AtomicUsize>,
}

impl FailOnce {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Respond for FailOnce {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            ResponseTemplate::new(500).set_body_json(json!({
                "error": { "message": "upstream hiccup", "code": "internal" }
            }))
        } else {
            ResponseTemplate::new(200).set_body_json(completion("ok", 1, 1))
        }
    }
}

fn gateway(server: &MockServer, max_retries: u32) -> ProviderGateway<NoopUsageSink> {
    ProviderGateway::with_config(
        adapter(server),
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries,
            retry_base_delay: Duration::ZERO,
        },
    )
}

#[tokio::test]
async fn gateway_makes_a_single_attempt_by_default() {
    let server = chat_server(FailOnce::new()).await;
    let default_gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    );

    let err = default_gateway.chat(rationale_request()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn gateway_retries_server_errors_when_allowed() {
    let server = chat_server(FailOnce::new()).await;

    let resp = gateway(&server, 1).chat(rationale_request()).await.unwrap();
    assert_eq!(resp.content, "ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

async fn embeddings_server(body: Value) -> (MockServer, OpenAiEmbeddings) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(body_partial_json(json!({ "model": "text-embedding-3-small" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;
    let client = OpenAiEmbeddings::with_config(
        "sk-test",
        server.uri(),
        "text-embedding-3-small",
        Duration::from_secs(5),
        Arc::new(NoopUsageSink),
    )
    .unwrap();
    (server, client)
}

#[tokio::test]
async fn embedding_rows_follow_input_order() {
    let (_server, client) = embeddings_server(json!({
        "data": [
            { "index": 1, "embedding": [0.0, 1.0] },
            { "index": 0, "embedding": [1.0, 0.0] }
        ],
        "usage": { "prompt_tokens": 4 }
    }))
    .await;

    let vectors = client
        .embed_batch(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
}

#[tokio::test]
async fn short_embedding_reply_is_rejected() {
    let (_server, client) = embeddings_server(json!({
        "data": [{ "index": 0, "embedding": [1.0, 0.0] }]
    }))
    .await;

    let err = client
        .embed_batch(&["a".to_string(), "b".to_string()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expected 2 embeddings, got 1"));
}

#[tokio::test]
async fn single_text_embedding_and_empty_batch() {
    let (server, client) = embeddings_server(json!({
        "data": [{ "index": 0, "embedding": [0.5, 0.5, 0.0] }]
    }))
    .await;

    assert_eq!(client.embed("minty").await.unwrap(), vec![0.5, 0.5, 0.0]);
    assert!(client.embed_batch(&[]).await.unwrap().is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
