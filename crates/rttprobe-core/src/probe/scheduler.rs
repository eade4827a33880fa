//! Probe scheduler
//!
//! Emits one probe per tick and fans it out to every open, enabled
//! transport. The whole tick runs under the store lock: sends are queue
//! pushes that never block, and holding the lock makes a concurrent stop
//! either wait for the tick to finish or make it a no-op.

use crate::engine::EngineEvent;
use crate::stats::store::StatsStore;
use crate::transport::{TransportHandle, TransportId, TransportSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Sequence id of the probe
    pub sequence_id: u64,
    /// Serialized probe size in bytes
    pub bytes: usize,
    /// Transports that accepted the probe
    pub sent: Vec<TransportId>,
    /// Transports whose send failed (counted as drops)
    pub dropped: Vec<TransportId>,
}

/// Run one tick against the store
///
/// Returns `None` without touching anything when no run is active.
pub fn run_tick(
    store: &mut StatsStore,
    handles: &[Arc<dyn TransportHandle>],
    padding_bytes: usize,
    now: i64,
) -> Option<TickReport> {
    let probe = store.next_probe(now, padding_bytes)?;
    let message = probe.encode();
    store.set_last_probe_bytes(message.len());

    let mut report = TickReport {
        sequence_id: probe.id,
        bytes: message.len(),
        sent: Vec::new(),
        dropped: Vec::new(),
    };

    for handle in handles {
        let id = handle.id();
        if !store.is_enabled(id) || !handle.is_open() {
            continue;
        }
        let outcome = handle.send(&message);
        if let Err(ref e) = outcome {
            tracing::debug!(transport = %id, sequence_id = probe.id, error = %e, "probe_dropped");
            report.dropped.push(id);
        } else {
            report.sent.push(id);
        }
        store.record_send(id, &outcome);
    }

    tracing::trace!(
        sequence_id = report.sequence_id,
        bytes = report.bytes,
        sent = report.sent.len(),
        dropped = report.dropped.len(),
        "probe_tick"
    );
    Some(report)
}

/// Owner of the periodic tick task
#[derive(Debug, Default)]
pub struct ProbeScheduler {
    task: Option<JoinHandle<()>>,
}

impl ProbeScheduler {
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Start ticking every `interval`; replaces any previous task
    ///
    /// The first probe goes out one interval after the call.
    pub fn start(
        &mut self,
        interval: Duration,
        padding_bytes: usize,
        store: Arc<Mutex<StatsStore>>,
        transports: TransportSet,
        notify: broadcast::Sender<EngineEvent>,
    ) {
        self.stop();
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            padding_bytes,
            "Probe scheduler started"
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let handles = transports.handles();
                let report = match store.lock() {
                    Ok(mut store) => run_tick(&mut store, &handles, padding_bytes, crate::now_millis()),
                    Err(_) => {
                        tracing::error!("Stats store poisoned, stopping scheduler");
                        break;
                    }
                };
                match report {
                    Some(report) => {
                        let _ = notify.send(EngineEvent::ProbeSent {
                            sequence_id: report.sequence_id,
                        });
                    }
                    // Run ended between ticks
                    None => break,
                }
            }
        }));
    }

    /// Stop ticking; calling it when already stopped does nothing
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Probe scheduler stopped");
        }
    }

    /// Whether a tick task is alive
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ProbeScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-test transport with scripted behavior
    struct FakeTransport {
        id: TransportId,
        open: bool,
        fail: bool,
        sends: AtomicUsize,
    }

    impl FakeTransport {
        fn new(id: TransportId, open: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                open,
                fail,
                sends: AtomicUsize::new(0),
            })
        }
    }

    impl TransportHandle for FakeTransport {
        fn id(&self) -> TransportId {
            self.id
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn send(&self, _message: &[u8]) -> Result<(), TransportError> {
            self.sends.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(TransportError::Backpressure(self.id))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_tick_is_noop_when_idle() {
        let mut store = StatsStore::new();
        let stream = FakeTransport::new(TransportId::Stream, true, false);
        let handles: Vec<Arc<dyn TransportHandle>> = vec![stream.clone()];
        assert!(run_tick(&mut store, &handles, 0, 0).is_none());
        assert_eq!(stream.sends.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_failure_on_one_transport_does_not_block_others() {
        let mut store = StatsStore::new();
        store.begin_run();
        let failing = FakeTransport::new(TransportId::Stream, true, true);
        let reliable = FakeTransport::new(TransportId::Reliable, true, false);
        let unreliable = FakeTransport::new(TransportId::Unreliable, true, false);
        let handles: Vec<Arc<dyn TransportHandle>> =
            vec![failing.clone(), reliable.clone(), unreliable.clone()];

        let first = run_tick(&mut store, &handles, 0, 0).unwrap();
        assert_eq!(first.dropped, vec![TransportId::Stream]);
        assert_eq!(first.sent, vec![TransportId::Reliable, TransportId::Unreliable]);

        // Next tick still happens and still reaches everyone
        let second = run_tick(&mut store, &handles, 0, 100).unwrap();
        assert_eq!(second.sequence_id, 2);
        assert_eq!(failing.sends.load(Ordering::Relaxed), 2);
        assert_eq!(store.transport(TransportId::Stream).dropped, 2);
        assert_eq!(store.transport(TransportId::Stream).sent, 0);
        assert_eq!(store.transport(TransportId::Reliable).sent, 2);
        assert_eq!(store.transport(TransportId::Unreliable).sent, 2);
    }

    #[test]
    fn test_closed_and_disabled_transports_are_skipped() {
        let mut store = StatsStore::new();
        store.begin_run();
        store.set_enabled(TransportId::Reliable, false);
        let closed = FakeTransport::new(TransportId::Stream, false, false);
        let disabled = FakeTransport::new(TransportId::Reliable, true, false);
        let handles: Vec<Arc<dyn TransportHandle>> = vec![closed.clone(), disabled.clone()];

        let report = run_tick(&mut store, &handles, 0, 0).unwrap();
        assert!(report.sent.is_empty());
        assert!(report.dropped.is_empty());
        assert_eq!(closed.sends.load(Ordering::Relaxed), 0);
        assert_eq!(disabled.sends.load(Ordering::Relaxed), 0);
        // The sequence still advances
        assert_eq!(store.sequence_counter(), 1);
    }

    #[test]
    fn test_padding_changes_probe_size() {
        let mut store = StatsStore::new();
        store.begin_run();
        let plain = run_tick(&mut store, &[], 0, 0).unwrap();
        let padded = run_tick(&mut store, &[], 64, 0).unwrap();
        assert!(padded.bytes >= plain.bytes + 64);
        assert_eq!(store.run().last_probe_bytes, padded.bytes);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut scheduler = ProbeScheduler::new();
        scheduler.stop();
        let store = Arc::new(Mutex::new(StatsStore::new()));
        store.lock().unwrap().begin_run();
        let (tx, _rx) = broadcast::channel(16);
        scheduler.start(
            Duration::from_millis(10),
            0,
            Arc::clone(&store),
            TransportSet::new(),
            tx,
        );
        assert!(scheduler.is_active());
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_active());
    }
}
