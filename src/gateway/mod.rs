//! Axum gateway for the router.
//!
//! - `/api/*` is the caller-facing REST surface over [`TaskRouter`].
//! - `/ws/supervisor` lets a remote supervisor attach itself to the
//!   in-process transport as a named endpoint.

pub mod api;
pub mod ws;

use crate::config::GatewayConfig;
use crate::coordination::TaskRouter;
use crate::transport::InProcessTransport;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: TaskRouter,
    /// Concrete transport so WebSocket peers can attach mailboxes.
    pub transport: Arc<InProcessTransport>,
    pub gateway: GatewayConfig,
}

impl AppState {
    pub fn new(router: TaskRouter, transport: Arc<InProcessTransport>, gateway: GatewayConfig) -> Self {
        Self {
            router,
            transport,
            gateway,
        }
    }
}

/// Build the axum application with body-size and timeout limits applied.
pub fn build_app(state: AppState) -> Router {
    let max_body = state.gateway.max_body_bytes;
    let timeout = Duration::from_secs(state.gateway.request_timeout_secs.max(1));

    Router::new()
        .route("/health", get(handle_health))
        // ── Tasks ──
        .route("/api/tasks", post(api::handle_route_task))
        .route("/api/tasks/{id}", delete(api::handle_cancel_task))
        // ── Registry ──
        .route("/api/supervisors", get(api::handle_list_supervisors))
        .route("/api/agents", get(api::handle_list_agents))
        .route("/api/agents", post(api::handle_register_agent))
        .route("/api/agents/{id}", get(api::handle_agent_status))
        .route("/api/stats", get(api::handle_stats))
        // ── Supervisor transport ──
        .route("/ws/supervisor", get(ws::handle_ws_supervisor))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
}

/// Bind `host:port` and serve until the task is cancelled.
pub async fn run_gateway(host: &str, port: u16, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid gateway address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway on {addr}"))?;
    let actual_port = listener.local_addr()?.port();

    println!("🛰️  Cartrita gateway listening on http://{host}:{actual_port}");
    println!("  POST   /api/tasks          — route a task");
    println!("  DELETE /api/tasks/{{id}}     — cancel an in-flight task");
    println!("  GET    /api/supervisors    — supervisor pools");
    println!("  GET    /api/agents         — registered agents");
    println!("  POST   /api/agents         — register an agent or supervisor");
    println!("  GET    /api/stats          — router statistics");
    println!("  GET    /ws/supervisor?id=  — supervisor transport");
    println!("  GET    /health             — health check");

    tracing::info!(
        router = state.router.name(),
        port = actual_port,
        "gateway started"
    );
    crate::health::mark_component_ok("gateway");

    axum::serve(listener, build_app(state))
        .await
        .context("gateway server stopped")?;
    Ok(())
}

/// GET /health — component snapshot plus a router summary
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.router.get_stats();
    Json(serde_json::json!({
        "status": "ok",
        "router": stats.router,
        "healthy_supervisors": stats.healthy_supervisors,
        "pending_tasks": stats.pending_tasks,
        "runtime": crate::health::snapshot_json(),
    }))
}
