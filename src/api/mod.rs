//! HTTP surface of the relay.
//!
//! - [`relay`]: the `POST /chat-stream` passthrough
//! - [`usage`]: token balance and model catalogue
//! - [`auth`]: caller authentication and rate limiting middleware
//! - [`models`]: domain types shared by handlers and services

pub mod auth;
pub mod disconnect;
pub mod models;
pub mod relay;
pub mod usage;

use crate::core::config::AppConfig;
use crate::core::metrics::gather_text;
use crate::core::middleware::{request_id_middleware, MetricsMiddleware};
use crate::core::rate_limiter::RateLimiter;
use crate::core::tokenizer::TokenEstimator;
use crate::services::catalog::{ChannelCatalog, ChannelHealthReporter, QuotaLedger, TokenStore};
use crate::services::channel_selector::{ChannelSelector, RandomSource};
use crate::services::dispatcher::RelayDispatcher;
use crate::services::quota_reconciler::QuotaReconciler;
use crate::services::transport::{build_http_client, PassthroughTransport};
use axum::{
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use models::{CallerToken, Channel, ChatStreamRequest, RelayInfo};

/// Storage collaborators behind the relay.
#[derive(Clone)]
pub struct Backends {
    pub catalog: Arc<dyn ChannelCatalog>,
    pub tokens: Arc<dyn TokenStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub health: Arc<dyn ChannelHealthReporter>,
}

impl Backends {
    /// Use one store for every collaborator.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ChannelCatalog + TokenStore + QuotaLedger + ChannelHealthReporter + 'static,
    {
        Self {
            catalog: store.clone(),
            tokens: store.clone(),
            ledger: store.clone(),
            health: store,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub tokens: Arc<dyn TokenStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub estimator: Arc<dyn TokenEstimator>,
    pub selector: Arc<ChannelSelector>,
    pub dispatcher: Arc<RelayDispatcher>,
    pub reconciler: Arc<QuotaReconciler>,
    pub rate_limiter: Arc<RateLimiter>,
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Wire the relay services from configuration and collaborators.
    pub fn new(
        config: AppConfig,
        backends: Backends,
        estimator: Arc<dyn TokenEstimator>,
        rng: Arc<dyn RandomSource>,
    ) -> anyhow::Result<Self> {
        let http_client = build_http_client(&config)?;
        let selector = Arc::new(ChannelSelector::new(
            backends.catalog,
            rng,
            config.capability_tag.clone(),
        ));
        let transport = Arc::new(PassthroughTransport::new(http_client.clone(), &config));
        let dispatcher = Arc::new(RelayDispatcher::new(
            selector.clone(),
            transport,
            backends.health,
            config.retry_times as usize,
        ));
        let reconciler = Arc::new(QuotaReconciler::new(
            backends.ledger.clone(),
            config.pricing.quota_per_unit,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.model_request_rate_limit.as_ref()));

        Ok(Self {
            config: Arc::new(config),
            tokens: backends.tokens,
            ledger: backends.ledger,
            estimator,
            selector,
            dispatcher,
            reconciler,
            rate_limiter,
            http_client,
        })
    }
}

/// Build the router with every endpoint and the global middleware stack.
pub fn build_router(state: AppState) -> Router {
    let relay_routes = Router::new()
        .route(&state.config.relay_path, post(relay::relay_passthrough))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::token_auth_middleware,
        ));

    let usage_routes = Router::new()
        .route("/usage/api/balance", get(usage::balance))
        .route("/usage/api/get-models", get(usage::get_models))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::token_auth_middleware,
        ));

    Router::new()
        .merge(relay_routes)
        .merge(usage_routes)
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(middleware::from_fn(MetricsMiddleware::track_metrics))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

/// Prometheus text exposition.
async fn metrics_handler() -> Response {
    match gather_text() {
        Ok((content_type, buffer)) => {
            ([(header::CONTENT_TYPE, content_type)], buffer).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}
