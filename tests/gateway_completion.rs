use std::sync::Arc;
use std::time::Duration;

use intake_report::gateway::openai::OpenAiAdapter;
use intake_report::{
    Attribution, CompletionCall, CompletionClient, LlmClient, NoopUsageSink, ProviderError,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> CompletionClient<OpenAiAdapter, NoopUsageSink> {
    let adapter =
        OpenAiAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    CompletionClient::openai(adapter, "gpt-4o", Arc::new(NoopUsageSink))
}

fn call(timeout: Duration) -> CompletionCall<'static> {
    CompletionCall {
        system_prompt: "You are an analyst.",
        user_prompt: "Analyse this business.",
        timeout,
        max_completion_tokens: Some(4000),
        attribution: Attribution::new("test"),
    }
}

fn success(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 34 }
    }))
}

#[tokio::test]
async fn strips_code_fence_and_sends_both_prompts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o",
            "max_completion_tokens": 4000,
            "messages": [
                { "role": "system", "content": "You are an analyst." },
                { "role": "user", "content": "Analyse this business." }
            ]
        })))
        .respond_with(success("```json\n{\"ok\": true}\n```"))
        .expect(1)
        .mount(&server)
        .await;

    let text = client(&server)
        .send(call(Duration::from_secs(5)), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, "{\"ok\": true}");
}

#[tokio::test]
async fn non_success_status_carries_provider_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "req-42")
                .set_body_json(json!({
                    "error": { "message": "Rate limit reached", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .send(call(Duration::from_secs(5)), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "rate_limited");
    assert!(err.is_retryable());
    assert_eq!(err.request_id(), Some("req-42"));
    match err {
        ProviderError::Api {
            status,
            message,
            payload,
            ..
        } => {
            assert_eq!(status, 429);
            assert_eq!(message, "Rate limit reached");
            assert_eq!(payload["error"]["code"], "rate_limit_exceeded");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_content_is_an_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(success("   "))
        .mount(&server)
        .await;

    let err = client(&server)
        .send(call(Duration::from_secs(5)), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_response");
}

#[tokio::test]
async fn slow_provider_hits_the_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(success("{}").set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    let err = client(&server)
        .send(call(Duration::from_millis(200)), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Timeout(d) if d == Duration::from_millis(200)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancelled_token_aborts_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(success("{}").set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = client(&server)
        .send(call(Duration::from_secs(30)), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Cancelled));
}
