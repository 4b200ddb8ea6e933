// Configuration module

mod models;

pub use models::*;

use crate::error::{ProxyError, Result};
use config::{Config, Environment, File};
use std::path::PathBuf;

impl AppConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. An explicit `--config` file, or `./config.toml`
    /// 3. `~/.config/cloudcode-chat-proxy/config.toml`, if present
    /// 4. Defaults (lowest)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name(&Self::user_config_path()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        } else {
            builder = builder.add_source(File::with_name("config.toml").required(false));
        }

        let config = builder
            .add_source(Environment::with_prefix("GEMINI_PROXY").separator("__"))
            .build()
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ProxyError::Config(e.to_string()))
    }

    fn user_config_path() -> String {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudcode-chat-proxy")
            .join("config.toml")
            .to_string_lossy()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_file_falls_back_to_defaults() {
        let cfg = AppConfig::load(None).expect("defaults alone must deserialize");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.concurrency.max_concurrent, MaxConcurrent::Auto("auto".to_string()));
    }

    #[test]
    fn load_with_missing_explicit_file_errors() {
        let result = AppConfig::load(Some("/nonexistent/path/does-not-exist.toml"));
        assert!(result.is_err());
    }
}
