//! relayd, the outbound message dispatch service
//!
//! Single-binary Rust service that:
//! 1. Loads sender accounts and engine tuning from TOML config
//! 2. Builds the HTTP delivery transport and the dispatch engine
//! 3. Accepts payloads on `POST /send`, resolving each request when its
//!    task completes
//! 4. Exposes pool health on `GET /health` and Prometheus metrics on
//!    `GET /metrics`
//! 5. Drains in-flight sends on shutdown, bounded by a drain timeout

mod config;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use dispatch::Scheduler;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{HttpTransport, Payload};

use crate::config::Config;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    scheduler: Arc<Scheduler>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`; excess
/// requests queue behind it rather than being rejected.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/send", post(send_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting relayd");

    // Install the Prometheus recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

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

    info!(
        listen_addr = %config.server.listen_addr,
        endpoint_url = %config.delivery.endpoint_url,
        accounts = config.accounts.len(),
        rate_limit = config.engine.rate_limit,
        pool_size = config.engine.pool_size,
        "configuration loaded"
    );

    let transport = Arc::new(HttpTransport::new(
        config.delivery.endpoint_url.clone(),
        Duration::from_secs(config.delivery.timeout_secs),
    ));
    let scheduler = Scheduler::new(config.credentials(), transport, config.scheduler_config())
        .context("failed to start dispatch engine")?;

    let state = AppState {
        scheduler: scheduler.clone(),
        prometheus,
    };
    let app = build_router(state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "accepting requests");

    // Graceful shutdown:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and finishes in-flight requests
    // 3. the dispatch engine drains queued and in-flight sends, bounded by
    //    the configured drain timeout
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

    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => info!("http server drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = drain_timeout.as_secs(),
            "http drain timeout exceeded"
        ),
    }

    scheduler.shutdown(drain_timeout).await;

    info!("shutdown complete");
    Ok(())
}

/// Map an engine error onto an HTTP status for the API response.
fn error_status(err: &dispatch::Error) -> StatusCode {
    match err {
        dispatch::Error::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        dispatch::Error::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        dispatch::Error::SendRejected { .. } | dispatch::Error::RetriesExhausted { .. } => {
            StatusCode::BAD_GATEWAY
        }
        dispatch::Error::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON error response: {"error":{"type":"dispatch_error","message":...,
/// "code":...,"request_id":"req_..."}}. `code` is the remote reply code when
/// the failure carries one, so callers can tell message-level from
/// account-level rejections.
fn error_response(err: &dispatch::Error, request_id: &str) -> Response {
    let status = error_status(err);
    let body = serde_json::json!({
        "error": {
            "type": "dispatch_error",
            "message": err.to_string(),
            "code": err.code(),
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Accept one payload, wait for its task to finish, and report the outcome.
async fn send_handler(
    State(state): State<AppState>,
    axum::Json(payload): axum::Json<Payload>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

    let response = match state.scheduler.submit(payload) {
        Err(err) => error_response(&err, &request_id),
        Ok(handle) => {
            let task_id = handle.id().to_string();
            match handle.result().await {
                Ok(receipt) => (
                    StatusCode::OK,
                    axum::Json(serde_json::json!({
                        "task_id": task_id,
                        "status": "sent",
                        "detail": receipt.detail,
                        "request_id": request_id,
                    })),
                )
                    .into_response(),
                Err(err) => {
                    warn!(task = %task_id, error = %err, "send failed");
                    error_response(&err, &request_id)
                }
            }
        }
    };

    metrics::record_request(response.status().as_u16());
    response
}

/// Pool health rollup: 200 while any pool can take work, 503 once every
/// account is quarantined.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.scheduler.health();
    let status = if health["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        health.to_string(),
    )
}

/// Prometheus metrics endpoint — returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
