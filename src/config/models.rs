// Configuration data structures

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub thinking: ThinkingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

/// Where the pool of refresh-token credentials lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credentials_path")]
    pub path: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self { path: default_credentials_path() }
    }
}

/// Field names are the `api.{url,modelsUrl,host,userAgent}` configuration
/// contract; `camelCase` on the wire, `snake_case` in Rust.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub url: String,

    #[serde(default = "default_models_url")]
    pub models_url: String,

    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            models_url: default_models_url(),
            host: default_api_host(),
            user_agent: default_user_agent(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Field names are the `security.{maxRequestSize,apiKey}` configuration
/// contract; `camelCase` on the wire, `snake_case` in Rust.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    /// Optional static bearer key; when set, every `/v1/*` request must
    /// present it exactly.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { max_request_size: default_max_request_size(), api_key: None }
    }
}

/// Field names are the `retry.{maxRetries,baseDelay}` configuration
/// contract; `camelCase` on the wire, `snake_case` in Rust. `base_delay_ms`
/// carries an explicit override since automatic conversion would yield
/// `baseDelayMs`, not the contract's `baseDelay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms", rename = "baseDelay")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: default_max_retries(), base_delay_ms: default_base_delay_ms() }
    }
}

/// `max_concurrent` is either a fixed integer or `"auto"`, resolved at
/// startup against the enabled credential count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MaxConcurrent {
    Auto(String),
    Fixed(u32),
}

impl Default for MaxConcurrent {
    fn default() -> Self {
        MaxConcurrent::Auto("auto".to_string())
    }
}

impl MaxConcurrent {
    /// Resolve against the number of enabled credentials and the
    /// per-token concurrency budget, clamped to `[1, 100]`.
    pub fn resolve(&self, enabled_credential_count: usize, per_token_concurrency: u32) -> u32 {
        match self {
            MaxConcurrent::Fixed(n) => *n,
            MaxConcurrent::Auto(_) => {
                let raw = enabled_credential_count as u64 * per_token_concurrency as u64;
                raw.clamp(1, 100) as u32
            }
        }
    }
}

/// Field names are the `concurrency.{maxConcurrent,perTokenConcurrency,
/// queueLimit,timeout}` configuration contract; `camelCase` on the wire,
/// `snake_case` in Rust. `timeout_ms` carries an explicit override since
/// automatic conversion would yield `timeoutMs`, not the contract's bare
/// `timeout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    #[serde(default)]
    pub max_concurrent: MaxConcurrent,

    #[serde(default = "default_per_token_concurrency")]
    pub per_token_concurrency: u32,

    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    #[serde(default = "default_queue_timeout_ms", rename = "timeout")]
    pub timeout_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: MaxConcurrent::default(),
            per_token_concurrency: default_per_token_concurrency(),
            queue_limit: default_queue_limit(),
            timeout_ms: default_queue_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingOutputMode {
    ReasoningContent,
    Raw,
    Filter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(default = "default_thinking_output")]
    pub output: ThinkingOutputMode,
}

impl Default for ThinkingConfig {
    fn default() -> Self {
        Self { output: default_thinking_output() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub sanitize_tokens: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format(), sanitize_tokens: true }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            credentials: CredentialsConfig::default(),
            api: ApiConfig::default(),
            defaults: DefaultsConfig::default(),
            security: SecurityConfig::default(),
            retry: RetryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            thinking: ThinkingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// Default value functions

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_credentials_path() -> String {
    "data/accounts.json".to_string()
}

fn default_per_token_concurrency() -> u32 {
    2
}

fn default_api_url() -> String {
    "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent".to_string()
}

fn default_models_url() -> String {
    "https://cloudcode-pa.googleapis.com/v1internal/models".to_string()
}

fn default_api_host() -> String {
    "cloudcode-pa.googleapis.com".to_string()
}

fn default_user_agent() -> String {
    format!("cloudcode-chat-proxy/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> u32 {
    40
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_max_request_size() -> usize {
    50 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_queue_limit() -> usize {
    100
}

fn default_queue_timeout_ms() -> u64 {
    300_000
}

fn default_thinking_output() -> ThinkingOutputMode {
    ThinkingOutputMode::ReasoningContent
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_concurrent_auto_resolves_and_clamps() {
        let auto = MaxConcurrent::Auto("auto".to_string());
        assert_eq!(auto.resolve(3, 2), 6);
        assert_eq!(auto.resolve(0, 2), 1);
        assert_eq!(auto.resolve(1000, 2), 100);
    }

    #[test]
    fn max_concurrent_fixed_ignores_credential_count() {
        let fixed = MaxConcurrent::Fixed(5);
        assert_eq!(fixed.resolve(1, 2), 5);
    }

    #[test]
    fn default_config_round_trips_through_serde() {
        let cfg = AppConfig::default();
        let value = serde_json::to_value(&cfg).unwrap();
        let back: AppConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back.server.port, cfg.server.port);
    }
}
