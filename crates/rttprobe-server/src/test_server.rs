//! Standalone test server for E2E testing
//!
//! Starts a responder on ephemeral ports, an engine measuring against it
//! over all three transports, and the renderer API. The run is left idle;
//! start it with `POST /api/v1/run`.

use rttprobe_core::{ProbeEngine, ProbeSettings, TransportId};
use rttprobe_server::echo::Responder;
use rttprobe_server::{AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rttprobe=debug".parse()?),
        )
        .init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8930u16);

    let responder = Responder::bind(&ServerConfig {
        port: 0,
        tcp_port: 0,
        udp_port: 0,
        bind_addr: "127.0.0.1".to_string(),
        backpressure: false,
    })
    .await?;

    let engine = ProbeEngine::new(ProbeSettings::default());
    for id in TransportId::ALL {
        if let Err(e) = engine.connect(id, &responder.endpoint(id)).await {
            tracing::warn!(transport = %id, error = %e, "Transport unavailable");
        }
    }

    let config = ServerConfig {
        port,
        bind_addr: "127.0.0.1".to_string(),
        ..ServerConfig::default()
    };
    let state = AppState::new(engine, config);

    tracing::info!(port, "Test server starting");

    rttprobe_server::start_server(state).await?;
    Ok(())
}
