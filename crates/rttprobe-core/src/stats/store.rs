//! Per-transport measurement state and the run it belongs to
//!
//! One [`StatsStore`] holds everything the scheduler, the correlator, and the
//! statistics tick mutate. The engine keeps it behind a single mutex, which
//! serializes those three writers for every transport.

use super::series::{AxisRange, SeriesBuffer, SeriesPoint};
use super::window::{RollingSummary, RollingWindow};
use crate::probe::message::{Probe, Sample};
use crate::transport::{TransportError, TransportId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters and buffers for one transport
#[derive(Debug, Clone)]
pub struct TransportState {
    /// Probes handed to the transport this run
    pub sent: u64,
    /// Replies accepted this run
    pub received: u64,
    /// Sends that failed (backpressure or closed) this run
    pub dropped: u64,
    /// Samples from the last `WINDOW_MS`
    pub window: RollingWindow,
    /// Chart points keyed by sequence id
    pub series: SeriesBuffer,
    /// Last non-empty rolling summary
    pub summary: Option<RollingSummary>,
    /// Connection status reported by the transport
    pub open: bool,
    /// User choice; survives run resets
    pub enabled: bool,
}

impl TransportState {
    fn new() -> Self {
        Self {
            sent: 0,
            received: 0,
            dropped: 0,
            window: RollingWindow::new(),
            series: SeriesBuffer::new(),
            summary: None,
            open: false,
            enabled: true,
        }
    }

    /// Clear run data, keeping connection status and the enable flag
    fn reset(&mut self) {
        self.sent = 0;
        self.received = 0;
        self.dropped = 0;
        self.window.clear();
        self.series.clear();
        self.summary = None;
    }
}

/// Process-wide run bookkeeping
#[derive(Debug, Clone, Default)]
pub struct RunState {
    /// Whether the scheduler is allowed to emit probes
    pub running: bool,
    /// Id of the most recent probe (0 before the first tick)
    pub sequence_counter: u64,
    /// Serialized size of the most recent probe
    pub last_probe_bytes: usize,
    /// When the current (or last) run started
    pub started_at: Option<DateTime<Utc>>,
}

/// Renderer view of one transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSnapshot {
    pub transport: TransportId,
    pub open: bool,
    pub enabled: bool,
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    /// Rolling average RTT (ms), `None` until the first refresh with data
    pub average: Option<f64>,
    /// Rolling median RTT (ms)
    pub median: Option<f64>,
    pub series: Vec<SeriesPoint>,
}

/// Renderer view of the whole engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub running: bool,
    pub sequence_counter: u64,
    pub last_probe_bytes: usize,
    pub uptime_seconds: u64,
    pub axis: AxisRange,
    pub transports: Vec<TransportSnapshot>,
}

impl EngineSnapshot {
    /// Entry for one transport
    pub fn transport(&self, id: TransportId) -> Option<&TransportSnapshot> {
        self.transports.iter().find(|t| t.transport == id)
    }
}

/// Statistics store for every transport of the engine
#[derive(Debug)]
pub struct StatsStore {
    run: RunState,
    transports: BTreeMap<TransportId, TransportState>,
}

impl StatsStore {
    /// Create an idle store with one entry per transport slot
    pub fn new() -> Self {
        Self {
            run: RunState::default(),
            transports: TransportId::ALL
                .into_iter()
                .map(|id| (id, TransportState::new()))
                .collect(),
        }
    }

    /// Enter the running state, resetting the counter and all transports
    ///
    /// Returns `false` (and changes nothing) if a run is already active.
    pub fn begin_run(&mut self) -> bool {
        if self.run.running {
            return false;
        }
        self.run.running = true;
        self.run.sequence_counter = 0;
        self.run.last_probe_bytes = 0;
        self.run.started_at = Some(Utc::now());
        for state in self.transports.values_mut() {
            state.reset();
        }
        true
    }

    /// Leave the running state; counters and buffers stay for inspection
    ///
    /// Returns `false` if no run was active.
    pub fn end_run(&mut self) -> bool {
        std::mem::replace(&mut self.run.running, false)
    }

    pub fn is_running(&self) -> bool {
        self.run.running
    }

    pub fn sequence_counter(&self) -> u64 {
        self.run.sequence_counter
    }

    pub fn run(&self) -> &RunState {
        &self.run
    }

    /// Advance the sequence counter and build the next probe
    ///
    /// Returns `None` when no run is active.
    pub fn next_probe(&mut self, now: i64, padding_bytes: usize) -> Option<Probe> {
        if !self.run.running {
            return None;
        }
        self.run.sequence_counter += 1;
        Some(Probe::new(self.run.sequence_counter, now, padding_bytes))
    }

    /// Remember the wire size of the probe just built
    pub fn set_last_probe_bytes(&mut self, bytes: usize) {
        self.run.last_probe_bytes = bytes;
    }

    /// Count the outcome of one send attempt
    pub fn record_send(&mut self, id: TransportId, outcome: &Result<(), TransportError>) {
        let state = self.state_mut(id);
        match outcome {
            Ok(()) => state.sent += 1,
            Err(_) => state.dropped += 1,
        }
    }

    /// Feed a sample into the rolling window and the chart series
    pub fn record_sample(&mut self, sample: &Sample) {
        let counter = self.run.sequence_counter;
        let state = self.state_mut(sample.transport);
        state.received += 1;
        state.window.push(sample.arrival_ms, sample.rtt_ms);
        state
            .series
            .append(sample.sequence_id, sample.rtt_ms, counter);
    }

    /// Evict stale window entries and recompute every transport's summary
    ///
    /// A transport whose window is empty keeps its previous summary.
    pub fn refresh_rolling(&mut self, now: i64) {
        for state in self.transports.values_mut() {
            if let Some(summary) = state.window.refresh(now) {
                state.summary = Some(summary);
            }
        }
    }

    pub fn set_open(&mut self, id: TransportId, open: bool) {
        self.state_mut(id).open = open;
    }

    pub fn set_enabled(&mut self, id: TransportId, enabled: bool) {
        self.state_mut(id).enabled = enabled;
    }

    pub fn is_enabled(&self, id: TransportId) -> bool {
        self.transport(id).enabled
    }

    /// State of one transport
    pub fn transport(&self, id: TransportId) -> &TransportState {
        // Every slot is inserted by `new` and never removed
        &self.transports[&id]
    }

    fn state_mut(&mut self, id: TransportId) -> &mut TransportState {
        self.transports.entry(id).or_insert_with(TransportState::new)
    }

    /// Recommended chart x-axis range for the current counter
    pub fn axis_range(&self) -> AxisRange {
        AxisRange::for_counter(self.run.sequence_counter)
    }

    /// Seconds since the current run started (frozen at 0 when idle)
    pub fn uptime_seconds(&self) -> u64 {
        match (self.run.running, self.run.started_at) {
            (true, Some(started)) => (Utc::now() - started).num_seconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Copy everything a renderer needs
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            running: self.run.running,
            sequence_counter: self.run.sequence_counter,
            last_probe_bytes: self.run.last_probe_bytes,
            uptime_seconds: self.uptime_seconds(),
            axis: self.axis_range(),
            transports: self
                .transports
                .iter()
                .map(|(id, state)| TransportSnapshot {
                    transport: *id,
                    open: state.open,
                    enabled: state.enabled,
                    sent: state.sent,
                    received: state.received,
                    dropped: state.dropped,
                    average: state.summary.map(|s| s.average),
                    median: state.summary.map(|s| s.median),
                    series: state.series.to_vec(),
                })
                .collect(),
        }
    }
}

impl Default for StatsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(transport: TransportId, sequence_id: u64, rtt_ms: i64, arrival_ms: i64) -> Sample {
        Sample {
            transport,
            sequence_id,
            rtt_ms,
            arrival_ms,
        }
    }

    #[test]
    fn test_store_creation() {
        let store = StatsStore::new();
        assert!(!store.is_running());
        assert_eq!(store.sequence_counter(), 0);
        assert_eq!(store.snapshot().transports.len(), 3);
    }

    #[test]
    fn test_no_probe_while_idle() {
        let mut store = StatsStore::new();
        assert!(store.next_probe(0, 0).is_none());
        assert_eq!(store.sequence_counter(), 0);
    }

    #[test]
    fn test_begin_run_twice_is_noop() {
        let mut store = StatsStore::new();
        assert!(store.begin_run());
        store.next_probe(0, 0);
        assert!(!store.begin_run());
        assert_eq!(store.sequence_counter(), 1);
    }

    #[test]
    fn test_restart_resets_everything() {
        let mut store = StatsStore::new();
        store.set_open(TransportId::Stream, true);
        store.set_enabled(TransportId::Unreliable, false);
        store.begin_run();
        for _ in 0..5 {
            store.next_probe(1_000, 0);
        }
        store.record_send(TransportId::Stream, &Ok(()));
        store.record_send(
            TransportId::Reliable,
            &Err(TransportError::Backpressure(TransportId::Reliable)),
        );
        store.record_sample(&sample(TransportId::Stream, 3, 12, 1_012));
        store.refresh_rolling(1_100);

        assert!(store.end_run());
        assert!(!store.end_run());
        // Stopping keeps data for inspection
        assert_eq!(store.transport(TransportId::Stream).received, 1);

        assert!(store.begin_run());
        for id in TransportId::ALL {
            let state = store.transport(id);
            assert_eq!(state.sent, 0);
            assert_eq!(state.received, 0);
            assert_eq!(state.dropped, 0);
            assert!(state.window.is_empty());
            assert!(state.series.is_empty());
            assert!(state.summary.is_none());
        }
        // Connection status and user choice survive
        assert!(store.transport(TransportId::Stream).open);
        assert!(!store.is_enabled(TransportId::Unreliable));
        assert_eq!(store.next_probe(2_000, 0).unwrap().id, 1);
    }

    #[test]
    fn test_empty_window_keeps_last_summary() {
        let mut store = StatsStore::new();
        store.begin_run();
        store.next_probe(0, 0);
        store.record_sample(&sample(TransportId::Reliable, 1, 10, 1_000));
        store.record_sample(&sample(TransportId::Reliable, 1, 20, 1_000));
        store.refresh_rolling(1_500);
        let first = store.transport(TransportId::Reliable).summary.unwrap();
        assert_eq!(first.average, 15.0);

        // Window drains completely; summary stays put
        store.refresh_rolling(60_000);
        assert!(store.transport(TransportId::Reliable).window.is_empty());
        assert_eq!(store.transport(TransportId::Reliable).summary, Some(first));
    }

    #[test]
    fn test_snapshot_reports_series_and_axis() {
        let mut store = StatsStore::new();
        store.begin_run();
        for _ in 0..120 {
            store.next_probe(0, 0);
        }
        store.record_sample(&sample(TransportId::Unreliable, 118, 4, 10));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.axis, AxisRange { min: 20, max: 120 });
        let unrel = snapshot.transport(TransportId::Unreliable).unwrap();
        assert_eq!(unrel.series, vec![SeriesPoint { x: 118, y: 4 }]);
        assert_eq!(unrel.received, 1);
        assert_eq!(unrel.average, None);
    }
}
