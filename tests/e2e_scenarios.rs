// Black-box HTTP-level scenarios, driven through the public router surface
// only: no access to scheduler/queue internals here, just requests in and
// responses out, against a mocked upstream.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use cloudcode_chat_proxy::config::AppConfig;
use cloudcode_chat_proxy::credentials::CredentialStore;
use cloudcode_chat_proxy::queue::AdmissionQueue;
use cloudcode_chat_proxy::scheduler::CredentialScheduler;
use cloudcode_chat_proxy::server::create_router;
use cloudcode_chat_proxy::upstream::UpstreamClient;

fn write_credential_fixture() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    let now = chrono::Utc::now().timestamp_millis();
    let json = serde_json::json!([
        {
            "refresh_token": "1//0test-refresh",
            "access_token": "ya29.still-fresh",
            "expires_in": 3600,
            "timestamp": now,
            "enable": true,
            "project_id": "brave-otter-a1b2c"
        }
    ]);
    std::fs::write(file.path(), serde_json::to_vec_pretty(&json).unwrap()).unwrap();
    file
}

async fn build_router(mock_url: &str, api_key: Option<&str>) -> axum::Router {
    let mut config = AppConfig::default();
    config.api.url = format!("{mock_url}/v1internal:streamGenerateContent");
    config.api.models_url = format!("{mock_url}/v1internal/models");
    config.security.api_key = api_key.map(|k| k.to_string());
    config.concurrency.queue_limit = 10;
    config.concurrency.timeout_ms = 5_000;

    // The store only reads this file once, during `CredentialScheduler::new`
    // below, so it's fine for the temp file to be removed once this function
    // returns.
    let file = write_credential_fixture();
    let store = Arc::new(CredentialStore::new(file.path()));
    let scheduler = Arc::new(CredentialScheduler::new(store, 2).await.unwrap());
    let max_concurrent = config.concurrency.max_concurrent.resolve(1, 2);
    let queue = Arc::new(AdmissionQueue::new(max_concurrent, config.concurrency.queue_limit, config.concurrency.timeout_ms));
    let upstream = Arc::new(UpstreamClient::new(config.api.clone()).unwrap());

    create_router(config, scheduler, upstream, queue).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Scenario 1: single credential, non-streaming happy path.
#[tokio::test]
async fn non_streaming_happy_path_returns_openai_shaped_completion() {
    let mut server = mockito::Server::new_async().await;
    let sse_body = "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello there\"}]},\"finishReason\":\"STOP\"}]}}\n\n";
    let mock = server
        .mock("POST", "/v1internal:streamGenerateContent")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse_body)
        .create_async()
        .await;

    let app = build_router(&server.url(), None).await;

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "model": "gemini-2.5-pro",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["choices"][0]["message"]["content"], "Hello there");
    assert_eq!(value["choices"][0]["message"]["role"], "assistant");
    mock.assert_async().await;
}

/// Scenario 2: a `<think>` block split across two SSE `data:` lines must
/// surface as `reasoning_content`, separate from ordinary `content`.
#[tokio::test]
async fn reasoning_block_is_split_into_reasoning_content() {
    let mut server = mockito::Server::new_async().await;
    let sse_body = concat!(
        "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"before \"}]}}]}}\n\n",
        "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"pondering\",\"thought\":true}]}}]}}\n\n",
        "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" after\"}]},\"finishReason\":\"STOP\"}]}}\n\n",
    );
    let _mock = server
        .mock("POST", "/v1internal:streamGenerateContent")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse_body)
        .create_async()
        .await;

    let app = build_router(&server.url(), None).await;

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "model": "gemini-2.5-pro",
                "messages": [{"role": "user", "content": "think it over"}],
                "stream": false
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["choices"][0]["message"]["content"], "before  after");
    assert_eq!(value["choices"][0]["message"]["reasoning_content"], "pondering");
}

/// A configured `security.api_key` rejects requests without a matching
/// bearer token before they ever reach the queue or scheduler.
#[tokio::test]
async fn missing_bearer_token_is_rejected_with_401() {
    let server = mockito::Server::new_async().await;
    let app = build_router(&server.url(), Some("secret-key")).await;

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"model": "gemini-2.5-pro", "messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let value = body_json(response).await;
    assert_eq!(value["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn correct_bearer_token_is_admitted() {
    let mut server = mockito::Server::new_async().await;
    let sse_body = "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]},\"finishReason\":\"STOP\"}]}}\n\n";
    let _mock = server
        .mock("POST", "/v1internal:streamGenerateContent")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse_body)
        .create_async()
        .await;

    let app = build_router(&server.url(), Some("secret-key")).await;

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", "Bearer secret-key")
        .body(Body::from(
            serde_json::json!({"model": "gemini-2.5-pro", "messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_endpoint_reports_queue_and_credential_state() {
    let server = mockito::Server::new_async().await;
    let app = build_router(&server.url(), None).await;

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["status"], "ok");
    assert_eq!(value["enabled_credentials"], 1);
}

#[tokio::test]
async fn stats_endpoint_reports_the_loaded_credential() {
    let server = mockito::Server::new_async().await;
    let app = build_router(&server.url(), None).await;

    let req = Request::builder().uri("/api/stats").body(Body::empty()).unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["summary"]["total"], 1);
    assert_eq!(value["summary"]["enabled"], 1);
}

/// An upstream 5xx with retries exhausted surfaces as a 500 `api_error`
/// rather than a retry hanging the request.
#[tokio::test]
async fn upstream_server_error_exhausts_retries_and_surfaces_as_api_error() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1internal:streamGenerateContent")
        .with_status(500)
        .with_body("{\"error\":{\"message\":\"internal\"}}")
        .expect_at_least(1)
        .create_async()
        .await;

    let app = build_router(&server.url(), None).await;

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"model": "gemini-2.5-pro", "messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let value = body_json(response).await;
    assert_eq!(value["error"]["type"], "api_error");
    mock.assert_async().await;
}
