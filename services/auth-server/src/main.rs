//! TaskIQ Auth Server
//!
//! Single-binary service that:
//! 1. Issues Google authorization URLs for chat bot users
//! 2. Receives the OAuth redirect and stores per-user tokens on disk
//! 3. Answers token status queries, refreshing expired access tokens
//! 4. Exposes health and Prometheus metrics

mod config;
mod error;
mod metrics;
mod pages;
mod routes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use google_auth::{AuthorizationRequestBuilder, FileCredentialStore, HttpTokenExchanger};
use metrics_exporter_prometheus::PrometheusHandle;
use oauth_flow::FlowController;
use tokio::net::TcpListener;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::routes::ApiState;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for the operational endpoints
#[derive(Clone)]
struct AppState {
    flow: Arc<FlowController>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Every request passes through `track_request` (request id span and HTTP
/// metrics) and a concurrency limit of `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let api = routes::build_api_router(ApiState::new(state.flow.clone()));
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(api)
        .layer(axum::middleware::from_fn(track_request))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON output; LOG_LEVEL takes precedence over RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting taskiq-auth-server");

    // Install before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let client = Arc::new(
        config
            .client_config()
            .context("failed to load OAuth client configuration")?,
    );

    info!(
        listen_addr = %config.server.listen_addr,
        token_dir = %config.storage.token_dir.display(),
        redirect_uri = %client.redirect_uri,
        scopes = client.scopes.len(),
        "configuration loaded"
    );

    let store = FileCredentialStore::open(config.storage.token_dir.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open token directory {}",
                config.storage.token_dir.display()
            )
        })?;
    let exchanger = HttpTokenExchanger::new(
        client.clone(),
        Duration::from_secs(config.oauth.timeout_secs),
    )
    .context("failed to build token endpoint client")?;

    let flow = FlowController::new(
        AuthorizationRequestBuilder::new(client),
        Arc::new(exchanger),
        Arc::new(store),
    )
    .with_pending_ttl(Duration::from_secs(config.oauth.pending_ttl_secs));

    let app_state = AppState {
        flow: Arc::new(flow),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Tag each request with an id span and record HTTP metrics.
async fn track_request(request: Request, next: Next) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let method = request.method().clone();
    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %request.uri().path()
    );

    let start = Instant::now();
    let response = next.run(request).instrument(span).await;
    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Health endpoint: status, uptime and pending authorizations.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "pending_authorizations": state.flow.pending_count().await,
    });
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
