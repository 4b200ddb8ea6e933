// cloudcode-chat-proxy - OpenAI-compatible chat completions proxy fronting a
// multi-credential CloudCode-style upstream

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use cloudcode_chat_proxy::cli::Args;
use cloudcode_chat_proxy::config::AppConfig;
use cloudcode_chat_proxy::credentials::CredentialStore;
use cloudcode_chat_proxy::metrics;
use cloudcode_chat_proxy::queue::AdmissionQueue;
use cloudcode_chat_proxy::scheduler::CredentialScheduler;
use cloudcode_chat_proxy::server::create_router;
use cloudcode_chat_proxy::upstream::UpstreamClient;
use cloudcode_chat_proxy::utils::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref())?;

    logging::init(&config.logging)?;
    info!("starting cloudcode-chat-proxy v{}", env!("CARGO_PKG_VERSION"));

    info!(path = %config.credentials.path, "loading credential pool");
    let store = Arc::new(CredentialStore::new(&config.credentials.path));
    let scheduler = match CredentialScheduler::new(store.clone(), config.concurrency.per_token_concurrency).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to initialize credential scheduler");
            std::process::exit(1);
        }
    };
    info!(enabled = scheduler.enabled_count(), "credential pool ready");

    let max_concurrent = config.concurrency.max_concurrent.resolve(scheduler.enabled_count(), config.concurrency.per_token_concurrency);
    info!(max_concurrent, queue_limit = config.concurrency.queue_limit, "admission queue sized");
    let queue = Arc::new(AdmissionQueue::new(max_concurrent, config.concurrency.queue_limit, config.concurrency.timeout_ms));

    let upstream = Arc::new(UpstreamClient::new(config.api.clone())?);

    let addr: SocketAddr =
        format!("{}:{}", config.server.host, config.server.port).parse().context("invalid server host/port")?;

    let shutdown_queue = queue.clone();
    let metrics_scheduler = scheduler.clone();
    tokio::spawn(refresh_credential_metrics_loop(metrics_scheduler));

    let app = create_router(config, scheduler, upstream, queue)?;

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind server address");
            std::process::exit(1);
        }
    };

    info!(%addr, "listening");
    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_queue));

    match tokio::time::timeout(std::time::Duration::from_secs(5) + std::time::Duration::from_millis(500), serve).await {
        Ok(Ok(())) => info!("server shut down gracefully"),
        Ok(Err(e)) => {
            error!(error = %e, "server exited with error");
            std::process::exit(1);
        }
        Err(_) => {
            info!("graceful drain window elapsed, forcing exit");
        }
    }

    Ok(())
}

/// Waits for ctrl-c or SIGTERM, pauses the admission queue so no new request
/// is admitted, and returns — letting axum stop accepting connections and
/// drain whatever is already in flight, bounded by the 5s timeout the caller
/// wraps this future in.
async fn shutdown_signal(queue: Arc<AdmissionQueue>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, starting graceful shutdown"),
        _ = terminate => info!("received sigterm, starting graceful shutdown"),
    }

    queue.pause();
}

/// Snapshots `get_all_stats()` into the `credential_active`/`credential_status`
/// gauges every 15s, since those are point-in-time observations rather than
/// counters any single request path can update on its own.
async fn refresh_credential_metrics_loop(scheduler: Arc<CredentialScheduler>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(15));
    loop {
        interval.tick().await;
        let stats = scheduler.get_all_stats().await;
        for credential in &stats.credentials {
            metrics::set_credential_active(&credential.token_prefix, credential.active_count);
        }
        let rate_limited = stats.credentials.iter().filter(|c| c.effective_status == "rate_limited").count();
        metrics::set_credential_status_counts(stats.summary.active, rate_limited, stats.summary.disabled);
    }
}
