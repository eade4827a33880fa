//! rttprobe - multi-transport round-trip latency prober
//!
//! This library re-exports the engine, transports, and statistics from
//! `rttprobe-core`, the API and responder from `rttprobe-server`, and adds
//! the persisted configuration and the terminal renderer used by the CLI.

pub mod config;
pub mod render;

pub use rttprobe_core::{engine, probe, stats, transport};
pub use rttprobe_server as server;

pub use rttprobe_core::{EngineEvent, EngineSnapshot, EngineState, ProbeEngine, ProbeSettings};
pub use rttprobe_core::{Probe, Sample, StatsStore, TransportId};
pub use rttprobe_core::{MAX_SAMPLES, SERIES_LAG, STATS_INTERVAL_MS, VERSION, WINDOW_MS};
