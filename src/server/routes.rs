// HTTP routes configuration

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers::{chat_completions_handler, health_handler, list_models_handler, metrics_handler, stats_handler};
use super::middleware::{request_id_layers, require_api_key, track_metrics};
use crate::config::AppConfig;
use crate::error::Result;
use crate::queue::AdmissionQueue;
use crate::scheduler::CredentialScheduler;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub scheduler: Arc<CredentialScheduler>,
    pub upstream: Arc<UpstreamClient>,
    pub queue: Arc<AdmissionQueue>,
}

pub fn create_router(
    config: AppConfig,
    scheduler: Arc<CredentialScheduler>,
    upstream: Arc<UpstreamClient>,
    queue: Arc<AdmissionQueue>,
) -> Result<Router> {
    let max_request_size = config.security.max_request_size;
    let state = AppState { config: Arc::new(config), scheduler, upstream, queue };

    let (set_request_id, propagate_request_id) = request_id_layers();

    let ingress = Router::new()
        .route("/v1/models", get(list_models_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let app = Router::new()
        .merge(ingress)
        .route("/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(max_request_size))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(track_metrics))
        .layer(propagate_request_id)
        .layer(set_request_id)
        .with_state(state);

    Ok(app)
}
