//! rttprobe Web Server - renderer API and ping responder
//!
//! Two independent surfaces live here:
//! - the renderer API ([`api`], [`ws`]) that exposes a running
//!   [`ProbeEngine`] to dashboards and scripts, and
//! - the responder ([`echo`]) that answers probes over WebSocket, TCP,
//!   and UDP so the engine has something to measure against.

pub mod api;
pub mod echo;
pub mod ws;

use axum::http::{header, HeaderValue};
use axum::Router;
use rttprobe_core::ProbeEngine;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    /// The measuring engine
    pub engine: ProbeEngine,
    /// WebSocket broadcast channel (snapshot JSON)
    pub ws_tx: tokio::sync::broadcast::Sender<String>,
    /// Server configuration
    pub config: ServerConfig,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// HTTP port (renderer API, or the responder's WebSocket echo)
    pub port: u16,
    /// Responder TCP echo port
    pub tcp_port: u16,
    /// Responder UDP echo port
    pub udp_port: u16,
    /// Bind address
    pub bind_addr: String,
    /// Drop pings on connections with too much unsent reply data
    pub backpressure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8920,
            tcp_port: 8921,
            udp_port: 8922,
            bind_addr: "0.0.0.0".to_string(),
            backpressure: false,
        }
    }
}

impl AppState {
    /// Create a new AppState around a running engine
    pub fn new(engine: ProbeEngine, config: ServerConfig) -> Self {
        let (ws_tx, _) = tokio::sync::broadcast::channel(256);
        Self {
            engine,
            ws_tx,
            config,
        }
    }
}

/// Build the Axum router with all API routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", axum::routing::get(api::get_status))
        .route("/api/v1/stats", axum::routing::get(api::get_stats))
        .route("/api/v1/run", axum::routing::post(api::set_running))
        .route(
            "/api/v1/config",
            axum::routing::get(api::get_config).patch(api::update_config),
        )
        .route("/api/v1/ws", axum::routing::get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Serve the API on an already bound listener
///
/// Also starts the task that pushes snapshots to WebSocket clients.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let pusher = ws::spawn_snapshot_pusher(&state);
    let app = build_router(state);
    let result = axum::serve(listener, app).await;
    pusher.abort();
    result?;
    Ok(())
}

/// Start the API server on the configured address
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "rttprobe API listening");
    serve(listener, state).await
}
