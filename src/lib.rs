// cloudcode-chat-proxy - OpenAI-compatible chat completions proxy
// fronting a multi-credential CloudCode-style upstream

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod streaming;
pub mod translation;
pub mod upstream;
pub mod utils;
