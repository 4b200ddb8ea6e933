// Error types for the chat completions proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Error surfaced by a single upstream attempt, before it is classified
/// against a credential's retry/cooldown state.
///
/// This is the tagged variant the retry loop matches on directly, rather than
/// stringly-typed status/body pairs threaded through closures.
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("http {status}")]
    HttpError {
        status: u16,
        body: String,
        retry_after_ms: Option<u64>,
    },

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("no credentials available: {reason}")]
    NoCredentials { reason: String },
}

#[derive(Error, Debug)]
pub enum ProxyError {
    /// 400 - malformed ingress body.
    #[error("{0}")]
    Validation(String),

    /// 401 - missing/invalid bearer, or upstream 401/403.
    #[error("{0}")]
    AuthenticationError(String),

    /// 429 - all credentials cooling, or retries exhausted on 429.
    #[error("{0}")]
    RateLimitError { message: String, retry_after_secs: Option<u64> },

    /// 503 - no usable credential (none enabled, all overloaded, or the
    /// scheduler cannot find a candidate for another reason).
    #[error("{0}")]
    ServiceUnavailable(String),

    /// 503 - admission queue saturated.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// 504 - admission timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// 500 - other upstream non-2xx.
    #[error("upstream error: {0}")]
    ApiError(String),

    /// 500 (or connection termination if bytes were already sent) - transport
    /// failure or a mid-stream parse/transform failure.
    #[error("{0}")]
    NetworkError(String),

    #[error("{0}")]
    StreamError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("config parsing error: {0}")]
    ConfigParsing(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Numeric status code carried alongside the error, independent of the
    /// axum status mapping (used when logging or propagating to callers that
    /// don't go through `IntoResponse`).
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Validation(_) => 400,
            ProxyError::AuthenticationError(_) => 401,
            ProxyError::RateLimitError { .. } => 429,
            ProxyError::ServiceUnavailable(_) | ProxyError::QueueFull(_) => 503,
            ProxyError::Timeout(_) => 504,
            ProxyError::ApiError(_) => 500,
            ProxyError::NetworkError(_) | ProxyError::StreamError(_) => 500,
            ProxyError::Config(_) | ProxyError::ConfigParsing(_) | ProxyError::Io(_)
            | ProxyError::Json(_) | ProxyError::Http(_) | ProxyError::Internal(_) => 500,
        }
    }

    /// Stable `type` tag for the OpenAI-shaped error taxonomy, used in both
    /// the JSON error body and for metrics labeling.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Validation(_) => "validation",
            ProxyError::AuthenticationError(_) => "authentication_error",
            ProxyError::RateLimitError { .. } => "rate_limit_error",
            ProxyError::ServiceUnavailable(_) => "service_unavailable",
            ProxyError::QueueFull(_) => "queue_full",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::ApiError(_) => "api_error",
            ProxyError::NetworkError(_) => "network_error",
            ProxyError::StreamError(_) => "stream_error",
            ProxyError::Config(_) | ProxyError::ConfigParsing(_) | ProxyError::Io(_)
            | ProxyError::Json(_) | ProxyError::Http(_) | ProxyError::Internal(_) => "api_error",
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ProxyError::RateLimitError { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        }
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::NetworkError(msg) => ProxyError::NetworkError(msg),
            UpstreamError::HttpError { status, body, retry_after_ms } => match status {
                401 | 403 => ProxyError::AuthenticationError(body),
                429 => ProxyError::RateLimitError {
                    message: body,
                    retry_after_secs: retry_after_ms.map(|ms| ms.div_ceil(1000)),
                },
                500..=599 => ProxyError::ApiError(body),
                _ => ProxyError::ApiError(format!("http {status}: {body}")),
            },
            UpstreamError::StreamError(msg) => ProxyError::StreamError(msg),
            UpstreamError::NoCredentials { reason } => ProxyError::ServiceUnavailable(reason),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let error_type = self.error_type();
        let retry_after = self.retry_after_secs();
        let message = self.to_string();

        let body = json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
            }
        });

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = ProxyError::RateLimitError {
            message: "all credentials cooling".to_string(),
            retry_after_secs: Some(10),
        };
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.error_type(), "rate_limit_error");
        assert_eq!(err.retry_after_secs(), Some(10));
    }

    #[test]
    fn http_error_401_maps_to_authentication_error() {
        let err: ProxyError = UpstreamError::HttpError {
            status: 401,
            body: "invalid_grant".to_string(),
            retry_after_ms: None,
        }
        .into();
        assert!(matches!(err, ProxyError::AuthenticationError(_)));
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn http_error_429_converts_ms_to_ceiling_seconds() {
        let err: ProxyError = UpstreamError::HttpError {
            status: 429,
            body: "rate limited".to_string(),
            retry_after_ms: Some(10_500),
        }
        .into();
        assert_eq!(err.retry_after_secs(), Some(11));
    }

    #[test]
    fn queue_full_is_503_with_stable_type() {
        let err = ProxyError::QueueFull("queue size 10".to_string());
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.error_type(), "queue_full");
    }
}
