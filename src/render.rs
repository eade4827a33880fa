//! Terminal renderer for engine snapshots

use rttprobe_core::stats::store::TransportSnapshot;
use rttprobe_core::EngineSnapshot;
use std::fmt::Write;

fn format_ms(value: Option<f64>) -> String {
    match value {
        Some(ms) => format!("{:>8.2} ms", ms),
        None => format!("{:>8} ms", "-"),
    }
}

/// One line per transport
pub fn format_transport(t: &TransportSnapshot) -> String {
    let status = match (t.enabled, t.open) {
        (false, _) => "off",
        (true, true) => "open",
        (true, false) => "closed",
    };
    format!(
        "  {:<11}{:<7}sent {:>6}  recv {:>6}  drop {:>4}  avg{}  med{}",
        t.transport.label(),
        status,
        t.sent,
        t.received,
        t.dropped,
        format_ms(t.average),
        format_ms(t.median),
    )
}

/// Multi-line report: run header followed by every transport
pub fn format_snapshot(snapshot: &EngineSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}  seq {}  probe {} B  x {}..{}  up {}s",
        if snapshot.running { "running" } else { "idle" },
        snapshot.sequence_counter,
        snapshot.last_probe_bytes,
        snapshot.axis.min,
        snapshot.axis.max,
        snapshot.uptime_seconds,
    );
    for t in &snapshot.transports {
        let _ = writeln!(out, "{}", format_transport(t));
    }
    out
}
