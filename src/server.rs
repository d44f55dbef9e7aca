// ABOUTME: HTTP server wiring: MCP tool endpoint, health report, and Prometheus metrics
// ABOUTME: Owns process-wide shutdown: cancels pending waits and closes stateful sessions

use anyhow::{Context, Result};
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use parley_core::config::Config;
use parley_core::metrics;
use parley_core::{
    BacklogReconciler, ConnectionProvider, SessionManager, WaiterRegistry, WatermarkStore,
};

use crate::mcp::{mcp_handler, McpState};

impl McpState {
    /// Assemble the core components for one provider and watermark store.
    pub fn new(
        config: &Config,
        provider: Arc<dyn ConnectionProvider>,
        store: Arc<dyn WatermarkStore>,
    ) -> Self {
        Self {
            sessions: SessionManager::new(provider),
            waiters: WaiterRegistry::new(),
            backlog: Arc::new(BacklogReconciler::new(store, config.backlog.fallback_window)),
            waiter_config: config.waiter.clone(),
            default_page_size: config.backlog.default_page_size,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the router. `/metrics` is only served when a recorder handle is given.
pub fn build_router(state: McpState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let state = Arc::new(state);

    let mcp_routes = Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let app = match metrics_handle {
        Some(handle) => mcp_routes.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(Arc::new(handle)),
        ),
        None => mcp_routes,
    };

    app.layer(TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<Arc<McpState>>) -> impl IntoResponse {
    let stateful = state.sessions.stateful_sessions();
    Json(json!({
        "status": "ok",
        "platform": state.sessions.platform_id(),
        "wait_mode": state.waiter_config.wait_mode,
        "stateful_sessions": stateful.len(),
        "pending_waits": state.waiters.pending_count(),
        "dispatchers": state.waiters.dispatcher_count(),
    }))
}

async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Run the HTTP server until Ctrl+C.
pub async fn serve(
    config: Config,
    provider: Arc<dyn ConnectionProvider>,
    store: Arc<dyn WatermarkStore>,
) -> Result<()> {
    let metrics_handle =
        metrics::init_metrics().context("Failed to initialize Prometheus metrics")?;

    let state = McpState::new(&config, provider, store);
    let sessions = state.sessions.clone();
    let waiters = state.waiters.clone();
    let shutdown = state.shutdown.clone();

    let app = build_router(state, Some(metrics_handle));

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(
        addr = %addr,
        platform = sessions.platform_id(),
        wait_mode = %config.waiter.wait_mode,
        "Starting parley server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone(), waiters))
        .await?;

    shutdown.cancel();
    sessions.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken, waiters: WaiterRegistry) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = shutdown.cancelled() => {}
    }
    // Wake every blocked wait so in-flight requests can finish
    shutdown.cancel();
    waiters.shutdown();
}
