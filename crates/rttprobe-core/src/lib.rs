//! rttprobe Core - Probe engine, transports, and rolling statistics
//!
//! This library measures round-trip latency over several independent
//! transports at once (an ordered reliable stream, an ordered reliable
//! message channel, and an unordered unreliable datagram channel). It sends
//! sequenced ping probes on a fixed tick, turns every pong reply into a
//! latency sample, and keeps rolling statistics plus a chart-ready series
//! for each transport.

pub mod engine;
pub mod probe;
pub mod stats;
pub mod transport;

pub use engine::{EngineEvent, EngineState, ProbeEngine};
pub use probe::message::{Probe, Sample};
pub use probe::settings::ProbeSettings;
pub use stats::store::{EngineSnapshot, StatsStore};
pub use transport::{TransportError, TransportEvent, TransportHandle, TransportId};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Trailing span of the rolling statistics window (ms)
pub const WINDOW_MS: i64 = 3000;

/// Cadence of the rolling statistics refresh (ms)
pub const STATS_INTERVAL_MS: u64 = 3000;

/// Number of most recent probes the chart series tracks
pub const MAX_SAMPLES: u64 = 100;

/// Extra sequence ids a series point may lag behind before eviction
pub const SERIES_LAG: u64 = 10;

/// Probe interval used when the configured one is absent or invalid (ms)
pub const DEFAULT_INTERVAL_MS: u64 = 100;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
