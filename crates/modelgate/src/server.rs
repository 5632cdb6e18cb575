//! HTTP server wiring.

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::api::{admin_api, inference_api, model_api, registration_api};
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::state::AppState;

/// Build the REST router. Streaming bodies are not subject to `request_timeout`;
/// it only bounds the time until response headers are sent.
pub fn build_router(
    state: AppState,
    request_timeout: Duration,
    max_concurrent_requests: usize,
) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route(
            "/v1/models",
            get(model_api::list_models).post(model_api::launch_model),
        )
        .route(
            "/v1/models/:uid",
            get(model_api::describe_model).delete(model_api::terminate_model),
        )
        .route("/v1/models/:uid/generate", post(inference_api::generate))
        .route("/v1/models/:uid/chat", post(inference_api::chat))
        .route("/v1/models/:uid/embeddings", post(inference_api::create_embedding))
        .route(
            "/v1/model_registrations",
            get(registration_api::list_model_registrations).post(registration_api::register_model),
        )
        .route(
            "/v1/model_registrations/:name",
            get(registration_api::get_model_registration)
                .delete(registration_api::unregister_model),
        )
        .route("/v1/status", get(admin_api::get_status))
        .route("/healthz", get(admin_api::health))
        .route("/metrics", get(crate::metrics::get_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(ConcurrencyLimitLayer::new(max_concurrent_requests))
        .with_state(state)
}

/// Run the server until ctrl-c, then terminate every running model.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let orchestrator = Arc::new(Orchestrator::new(
        cfg.orchestrator_config(),
        cfg.build_catalog()?,
        cfg.runtime_factory(),
    ));
    let app = build_router(
        AppState::new(orchestrator.clone()),
        Duration::from_secs(cfg.request_timeout_seconds),
        cfg.max_concurrent_requests,
    );

    let addr = cfg.api_addr()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, terminating {} running model(s)", orchestrator.running_count());
    orchestrator.terminate_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
