//! rttprobe - multi-transport round-trip latency prober
//!
//! `rttprobe serve` runs the responder; `rttprobe probe` measures against
//! one and prints rolling statistics every few seconds.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rttprobe::config::AppConfig;
use rttprobe::probe::message::MAX_PADDING_BYTES;
use rttprobe::server::echo::Responder;
use rttprobe::server::{AppState, ServerConfig};
use rttprobe::{ProbeEngine, ProbeSettings, TransportId};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "rttprobe",
    version,
    about = "Measure round-trip latency over WebSocket, TCP, and UDP at once"
)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer probes on WebSocket, TCP, and UDP
    Serve(ServeArgs),
    /// Send probes and report latency per transport
    Probe(ProbeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// HTTP port for the WebSocket echo (`/echo`)
    #[arg(long, env = "RTTPROBE_PORT", default_value_t = 8920)]
    port: u16,

    /// TCP echo port
    #[arg(long, env = "RTTPROBE_TCP_PORT", default_value_t = 8921)]
    tcp_port: u16,

    /// UDP echo port
    #[arg(long, env = "RTTPROBE_UDP_PORT", default_value_t = 8922)]
    udp_port: u16,

    /// Address to bind every listener to
    #[arg(long, env = "RTTPROBE_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Drop pings on connections with more than 32 KiB of unsent replies
    #[arg(long)]
    backpressure: bool,
}

#[derive(Args)]
struct ProbeArgs {
    /// Stream transport endpoint
    #[arg(long, value_name = "URL")]
    stream: Option<String>,

    /// Reliable transport endpoint
    #[arg(long, value_name = "URL")]
    reliable: Option<String>,

    /// Unreliable transport endpoint
    #[arg(long, value_name = "URL")]
    unreliable: Option<String>,

    /// Probe interval in milliseconds (invalid values fall back to 100)
    #[arg(long, value_name = "MS")]
    interval: Option<String>,

    /// Filler bytes added to each probe (capped so replies fit one datagram)
    #[arg(long, value_name = "N")]
    padding: Option<i64>,

    /// Do not send probes on this transport (repeatable)
    #[arg(long, value_name = "TRANSPORT")]
    disable: Vec<TransportId>,

    /// Send probes on this transport even if previously disabled (repeatable)
    #[arg(long, value_name = "TRANSPORT")]
    enable: Vec<TransportId>,

    /// Stop after this many seconds (default: until Ctrl+C)
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Serve the renderer API on this port
    #[arg(long, env = "RTTPROBE_API_PORT", value_name = "PORT")]
    api_port: Option<u16>,

    /// Config file (default: `<data_dir>/rttprobe/config.json`)
    #[arg(long, env = "RTTPROBE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Do not write settings back to the config file
    #[arg(long)]
    no_save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("rttprobe={}", level).parse()?),
        )
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Probe(args) => probe(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig {
        port: args.port,
        tcp_port: args.tcp_port,
        udp_port: args.udp_port,
        bind_addr: args.bind,
        backpressure: args.backpressure,
    };
    let responder = Responder::bind(&config).await?;
    info!(
        stream = %responder.endpoint(TransportId::Stream),
        reliable = %responder.endpoint(TransportId::Reliable),
        unreliable = %responder.endpoint(TransportId::Unreliable),
        "Responder ready, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    let stats = responder.stats();
    info!(
        ws_answered = stats.stream.answered,
        tcp_answered = stats.reliable.answered,
        udp_answered = stats.unreliable.answered,
        dropped = stats.stream.dropped + stats.reliable.dropped + stats.unreliable.dropped,
        "Responder shutting down"
    );
    Ok(())
}

/// Merge command-line overrides into the persisted config
fn apply_overrides(config: &mut AppConfig, args: &ProbeArgs) {
    let endpoints = [
        (TransportId::Stream, &args.stream),
        (TransportId::Reliable, &args.reliable),
        (TransportId::Unreliable, &args.unreliable),
    ];
    for (id, endpoint) in endpoints {
        if let Some(endpoint) = endpoint {
            config.endpoints.insert(id, endpoint.clone());
        }
    }
    if let Some(raw) = &args.interval {
        config.interval_ms = ProbeSettings::parse_interval(raw);
    }
    if let Some(padding) = args.padding {
        if padding > MAX_PADDING_BYTES as i64 {
            warn!(padding, max = MAX_PADDING_BYTES, "Padding too large, capping");
        }
        config.padding_bytes = padding.clamp(0, MAX_PADDING_BYTES as i64);
    }
    for id in &args.enable {
        config.enabled.insert(*id, true);
    }
    for id in &args.disable {
        config.enabled.insert(*id, false);
    }
}

async fn probe(args: ProbeArgs) -> Result<()> {
    let (config_path, mut config) = match &args.config {
        Some(path) => (path.clone(), AppConfig::load_from(path)),
        None => (AppConfig::path(), AppConfig::load()),
    };
    apply_overrides(&mut config, &args);

    let engine = ProbeEngine::new(config.probe_settings());
    for id in TransportId::ALL {
        let endpoint = config.endpoint(id);
        match engine.connect(id, &endpoint).await {
            Ok(()) => info!(transport = %id, %endpoint, "Transport connected"),
            Err(e) => warn!(transport = %id, %endpoint, error = %e, "Transport unavailable"),
        }
    }

    let api = match args.api_port {
        Some(port) => {
            let state = AppState::new(
                engine.clone(),
                ServerConfig {
                    port,
                    bind_addr: "127.0.0.1".to_string(),
                    ..ServerConfig::default()
                },
            );
            Some(tokio::spawn(async move {
                if let Err(e) = rttprobe::server::start_server(state).await {
                    tracing::error!("API server error: {}", e);
                }
            }))
        }
        None => None,
    };

    engine.start();
    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let period = Duration::from_millis(rttprobe::STATS_INTERVAL_MS);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                print_report(&engine);
            }
            _ = &mut deadline => break,
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    engine.stop();
    // Replies already in flight still count
    tokio::time::sleep(Duration::from_millis(250)).await;
    print_report(&engine);

    if let Some(api) = api {
        api.abort();
    }

    if !args.no_save {
        config.remember(&engine.settings());
        if let Err(e) = config.save(&config_path) {
            warn!(path = %config_path.display(), error = %e, "Could not save config");
        }
    }
    Ok(())
}

fn print_report(engine: &ProbeEngine) {
    let now = chrono::Local::now().format("%H:%M:%S");
    print!("[{}] {}", now, rttprobe::render::format_snapshot(&engine.snapshot()));
}
