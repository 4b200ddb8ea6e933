// HTTP middleware

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use super::routes::AppState;
use crate::error::ProxyError;

/// Records the `requests_total`/`request_duration_seconds` series for every
/// ingress call. Model-level granularity lives on `upstream_calls_total`
/// instead (recorded once per credential attempt in the retry loop), since
/// that is where a request actually resolves to one model.
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    crate::metrics::record_request(&method, &path, response.status().as_u16(), "-", start.elapsed().as_secs_f64());
    response
}

/// Create request ID layers for the application
pub fn request_id_layers() -> (SetRequestIdLayer<MakeRequestUuid>, PropagateRequestIdLayer) {
    (
        SetRequestIdLayer::x_request_id(MakeRequestUuid),
        PropagateRequestIdLayer::x_request_id(),
    )
}

/// Enforces the optional static bearer key from `security.api_key` on the
/// `/v1/*` ingress routes. A no-op when no key is configured.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let Some(expected) = state.config.security.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(next.run(request).await),
        _ => Err(ProxyError::AuthenticationError("missing or invalid bearer token".to_string())),
    }
}
