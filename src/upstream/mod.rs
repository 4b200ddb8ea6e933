// Upstream client + retry loop: issues the chat-completion POST with
// whichever credential the scheduler selects, classifies the response, and
// retries by re-selecting another credential up to `max_retries`. Retries
// only ever happen before the streaming phase starts — once bytes may have
// reached the client there is no safe way to replay.
//
// Connection-pool tuning (`pool_max_idle_per_host`, keep-alive, `tcp_nodelay`,
// rustls) mirrors the usual reqwest-over-rustls POST-with-streaming-body
// client construction used throughout this codebase.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_TYPE, HOST, RETRY_AFTER, USER_AGENT};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::error::{ProxyError, Result};
use crate::models::upstream::{GenerateContentRequest, InternalApiRequest, ModelsResponse};
use crate::retry::extract_retry_after_ms;
use crate::scheduler::{CredentialScheduler, Outcome};
use crate::streaming::{transform_stream, StreamEvent};

pub struct UpstreamClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl UpstreamClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build upstream http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Execute one chat completion against upstream, retrying across
    /// credentials. `on_event` is driven directly by the SSE transformer, so
    /// partial output may already be visible to the caller by the time a
    /// stream-phase error surfaces — that phase is never retried.
    pub async fn generate(
        &self,
        scheduler: &CredentialScheduler,
        model: &str,
        request_body: &GenerateContentRequest,
        max_retries: u32,
        mut on_event: impl FnMut(StreamEvent) + Send,
    ) -> Result<()> {
        let mut tried: HashSet<usize> = HashSet::new();
        let mut attempt: u32 = 0;

        loop {
            let (selection, access_token, project_id) = scheduler.select(&mut tried).await?;
            let idx = selection.index;
            let attempt_start = std::time::Instant::now();

            let wrapped = InternalApiRequest {
                model: model.to_string(),
                project: Some(project_id),
                user_prompt_id: Some(format!("req_{}", Uuid::new_v4().simple())),
                request: request_body.clone(),
            };
            let body = serde_json::to_string(&wrapped).map_err(|e| ProxyError::Internal(format!("failed to serialize upstream request: {e}")))?;

            let mut headers = HeaderMap::new();
            if let Ok(v) = HeaderValue::from_str(&self.config.host) {
                headers.insert(HOST, v);
            }
            if let Ok(v) = HeaderValue::from_str(&self.config.user_agent) {
                headers.insert(USER_AGENT, v);
            }
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {access_token}")) {
                headers.insert(AUTHORIZATION, v);
            }
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

            let response = self.http.post(&self.config.url).headers(headers).body(body).send().await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    scheduler.report(selection, Outcome::NetworkError).await;
                    crate::metrics::record_upstream_call(model, 0, true, attempt_start.elapsed().as_secs_f64());
                    tried.insert(idx);
                    attempt += 1;
                    warn!(attempt, error = %e, "upstream transport failure, retrying across credentials");
                    if attempt >= max_retries {
                        return Err(ProxyError::NetworkError(format!("upstream transport failure exhausted retries: {e}")));
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();

            if (200..300).contains(&status) {
                let byte_stream = response.bytes_stream();
                let result = transform_stream(byte_stream, &mut on_event).await;
                crate::metrics::record_upstream_call(model, status, true, attempt_start.elapsed().as_secs_f64());
                return match result {
                    Ok(()) => {
                        scheduler.report(selection, Outcome::Success).await;
                        Ok(())
                    }
                    Err(e) => {
                        // Partial output may already be client-visible; no retry.
                        scheduler.report(selection, Outcome::ServerError).await;
                        Err(e)
                    }
                };
            }

            let retry_after_header = response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
            let body_text = response.text().await.unwrap_or_default();
            crate::metrics::record_upstream_call(model, status, true, attempt_start.elapsed().as_secs_f64());

            match status {
                401 | 403 => {
                    scheduler.report(selection, Outcome::AuthFailed).await;
                    return Err(ProxyError::AuthenticationError(format!("upstream rejected credential: http {status}")));
                }
                429 => {
                    let retry_after_ms = extract_retry_after_ms(retry_after_header.as_deref(), &body_text);
                    scheduler.report(selection, Outcome::RateLimited { retry_after_ms }).await;
                    tried.insert(idx);
                    attempt += 1;
                    debug!(attempt, retry_after_ms, "upstream rate limited, retrying across credentials");
                    if attempt >= max_retries {
                        return Err(ProxyError::RateLimitError {
                            message: "rate limit retries exhausted".to_string(),
                            retry_after_secs: retry_after_ms.map(|ms| ms.max(0).div_euclid(1000) as u64 + 1),
                        });
                    }
                    continue;
                }
                500..=599 => {
                    scheduler.report(selection, Outcome::ServerError).await;
                    tried.insert(idx);
                    attempt += 1;
                    warn!(attempt, status, "upstream server error, retrying across credentials");
                    if attempt >= max_retries {
                        return Err(ProxyError::ApiError(format!("upstream server errors exhausted retries: http {status}")));
                    }
                    continue;
                }
                _ => {
                    scheduler.report(selection, Outcome::ServerError).await;
                    return Err(ProxyError::ApiError(format!("upstream http {status}: {body_text}")));
                }
            }
        }
    }

    /// `GET /v1/models` proxies to the upstream model list, authenticated
    /// with whichever credential the scheduler currently prefers. Unlike
    /// `generate`, a single untried credential is enough — there is nothing
    /// to stream and a cold credential failing here is surfaced directly.
    pub async fn list_models(&self, scheduler: &CredentialScheduler) -> Result<ModelsResponse> {
        let mut tried = HashSet::new();
        let (selection, access_token, _project_id) = scheduler.select(&mut tried).await?;

        let result = self
            .http
            .get(&self.config.models_url)
            .header(AUTHORIZATION, format!("Bearer {access_token}"))
            .header(USER_AGENT, &self.config.user_agent)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                scheduler.report(selection, Outcome::Success).await;
                resp.json::<ModelsResponse>()
                    .await
                    .map_err(|e| ProxyError::ApiError(format!("models response unparsable: {e}")))
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                scheduler.report(selection, Outcome::ServerError).await;
                Err(ProxyError::ApiError(format!("upstream model list http {status}")))
            }
            Err(e) => {
                scheduler.report(selection, Outcome::NetworkError).await;
                Err(ProxyError::NetworkError(format!("model list transport error: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_default_config() {
        let config = ApiConfig {
            url: "https://example.test/generate".to_string(),
            models_url: "https://example.test/models".to_string(),
            host: "example.test".to_string(),
            user_agent: "test-agent/0.1".to_string(),
            timeout_seconds: 30,
        };
        assert!(UpstreamClient::new(config).is_ok());
    }
}
