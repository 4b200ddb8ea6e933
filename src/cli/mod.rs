// CLI argument parsing.

use clap::Parser;

/// cloudcode-chat-proxy - OpenAI-compatible chat completions proxy in front
/// of a multi-credential CloudCode upstream.
#[derive(Parser, Debug)]
#[command(name = "cloudcode-chat-proxy", version, about, long_about = None)]
pub struct Args {
    /// Path to a config file (layered over built-in defaults and env vars)
    #[arg(long, short = 'c')]
    pub config: Option<String>,
}
