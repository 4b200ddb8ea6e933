// HTTP request handlers

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};

use super::routes::AppState;
use crate::config::ThinkingOutputMode;
use crate::error::{ProxyError, Result};
use crate::models::openai::ChatCompletionRequest;
use crate::models::upstream::GenerateContentRequest;
use crate::scheduler::CredentialScheduler;
use crate::streaming::{NonStreamCollector, StreamEvent};
use crate::translation::response::{build_completion_response, build_model_list, chunk_to_sse, StreamChunkEncoder, DONE_SSE};
use crate::translation::translate_request;
use crate::upstream::UpstreamClient;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queue: crate::queue::QueueStatus,
    pub enabled_credentials: usize,
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        queue: state.queue.status(),
        enabled_credentials: state.scheduler.enabled_count(),
    })
}

pub async fn stats_handler(State(state): State<AppState>) -> Json<crate::scheduler::AllStats> {
    Json(state.scheduler.get_all_stats().await)
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))],
        crate::metrics::gather_metrics(),
    )
}

pub async fn list_models_handler(State(state): State<AppState>) -> Result<Response> {
    let models = state.upstream.list_models(&state.scheduler).await?;
    Ok(Json(build_model_list(models)).into_response())
}

fn event_label(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::Text(_) => "text",
        StreamEvent::Thinking(_) => "thinking",
        StreamEvent::ToolCalls(_) => "tool_calls",
    }
}

pub async fn chat_completions_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response> {
    info!(model = %req.model, stream = req.stream.unwrap_or(false), messages = req.messages.len(), "received chat completion request");

    let generate_request = translate_request(&req, &state.config.defaults)?;
    let model = req.model.clone();
    let stream_mode = req.stream.unwrap_or(false);
    let max_retries = state.config.retry.max_retries;
    let thinking_output = state.config.thinking.output;
    let scheduler = Arc::clone(&state.scheduler);
    let upstream = Arc::clone(&state.upstream);

    state
        .queue
        .run(move |guard| async move {
            if stream_mode {
                stream_response(guard, scheduler, upstream, model, generate_request, max_retries, thinking_output).await
            } else {
                non_stream_response(scheduler, upstream, model, generate_request, max_retries, thinking_output).await
            }
        })
        .await?
}

async fn non_stream_response(
    scheduler: Arc<CredentialScheduler>,
    upstream: Arc<UpstreamClient>,
    model: String,
    request: GenerateContentRequest,
    max_retries: u32,
    thinking_output: ThinkingOutputMode,
) -> Result<Response> {
    let mut collector = NonStreamCollector::new(thinking_output);

    upstream
        .generate(&scheduler, &model, &request, max_retries, |event| {
            crate::metrics::record_sse_event(event_label(&event), &model);
            collector.push(event);
        })
        .await?;

    let collected = collector.finish();
    Ok(Json(build_completion_response(&model, collected)).into_response())
}

/// Streaming responses hand the event callback to a detached task writing
/// into an unbounded channel; the response body reads from the channel as an
/// async stream. Once this function returns, headers are already on the
/// wire, so a late `generate` failure only closes the connection — it cannot
/// still be converted into a JSON error body. The admission guard moves into
/// the detached task too, so the slot stays held until the stream itself
/// finishes rather than being released as soon as headers go out.
async fn stream_response(
    guard: crate::queue::AdmissionGuard,
    scheduler: Arc<CredentialScheduler>,
    upstream: Arc<UpstreamClient>,
    model: String,
    request: GenerateContentRequest,
    max_retries: u32,
    thinking_output: ThinkingOutputMode,
) -> Result<Response> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let _guard = guard;
        let mut encoder = StreamChunkEncoder::new(&model, thinking_output);
        let _ = tx.send(chunk_to_sse(&encoder.role_chunk()));

        let result = upstream
            .generate(&scheduler, &model, &request, max_retries, |event| {
                crate::metrics::record_sse_event(event_label(&event), &model);
                if let Some(chunk) = encoder.event_chunk(event) {
                    let _ = tx.send(chunk_to_sse(&chunk));
                }
            })
            .await;

        match result {
            Ok(()) => {
                let _ = tx.send(chunk_to_sse(&encoder.finish_chunk()));
                let _ = tx.send(DONE_SSE.to_string());
                crate::metrics::record_sse_connection("closed");
            }
            Err(e) => {
                warn!(error = %e, "streaming generation failed after headers were sent, closing connection");
                crate::metrics::record_sse_connection("error");
            }
        }
    });
    crate::metrics::record_sse_connection("opened");

    let body_stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(chunk));
        }
    };

    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(CONNECTION, HeaderValue::from_static("keep-alive"))
        .header("x-accel-buffering", HeaderValue::from_static("no"))
        .body(axum::body::Body::from_stream(body_stream))
        .map_err(|e| ProxyError::Internal(format!("failed to build streaming response: {e}")))
}
