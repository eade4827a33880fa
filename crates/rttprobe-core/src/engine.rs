//! Probe engine and run controller
//!
//! [`ProbeEngine`] wires the pieces together: the transport registry, the
//! shared [`StatsStore`], the probe scheduler, the reply correlator, and the
//! periodic rolling-statistics refresh. It is cheap to clone; every clone
//! drives the same engine.
//!
//! Run state machine: `Idle --start--> Running --stop--> Idle`. Starting
//! resets every counter and buffer; stopping only halts probe emission, so
//! replies still in flight are recorded and the last numbers stay visible.

use crate::probe::correlator::run_correlator;
use crate::probe::message::Sample;
use crate::probe::scheduler::ProbeScheduler;
use crate::probe::settings::ProbeSettings;
use crate::stats::store::{EngineSnapshot, StatsStore};
use crate::transport::{
    self, EventSender, TransportError, TransportHandle, TransportId, TransportSet,
    EVENT_QUEUE_CAPACITY,
};
use crate::STATS_INTERVAL_MS;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Capacity of the engine notification channel
const NOTIFY_CAPACITY: usize = 256;

/// Errors surfaced by engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Transport {0} is disabled")]
    Disabled(TransportId),
}

/// Notification broadcast to renderers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A tick emitted probe `sequence_id`
    ProbeSent { sequence_id: u64 },
    /// A reply was turned into a sample
    Sample(Sample),
    /// Rolling averages and medians were recomputed
    StatsRefreshed,
    /// A transport opened or closed
    TransportStatus { transport: TransportId, open: bool },
    /// The run was started or stopped
    RunState { running: bool },
    /// Interval, padding, or enable flags changed
    SettingsChanged,
}

/// Run controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Running,
}

struct Inner {
    store: Arc<Mutex<StatsStore>>,
    transports: TransportSet,
    settings: RwLock<ProbeSettings>,
    scheduler: Mutex<ProbeScheduler>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    correlator: JoinHandle<()>,
    events: EventSender,
    notify: broadcast::Sender<EngineEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.correlator.abort();
        if let Ok(mut task) = self.stats_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Multi-transport round-trip latency engine
#[derive(Clone)]
pub struct ProbeEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProbeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeEngine")
            .field("state", &self.state())
            .field("transports", &self.inner.transports)
            .finish()
    }
}

impl ProbeEngine {
    /// Create an idle engine and start its correlator
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(settings: ProbeSettings) -> Self {
        let mut store = StatsStore::new();
        for id in TransportId::ALL {
            store.set_enabled(id, settings.is_enabled(id));
        }
        let store = Arc::new(Mutex::new(store));
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        let correlator = tokio::spawn(run_correlator(
            events_rx,
            Arc::clone(&store),
            notify.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                store,
                transports: TransportSet::new(),
                settings: RwLock::new(settings),
                scheduler: Mutex::new(ProbeScheduler::new()),
                stats_task: Mutex::new(None),
                correlator,
                events,
                notify,
            }),
        }
    }

    /// Queue that transports must push their events into
    pub fn event_sender(&self) -> EventSender {
        self.inner.events.clone()
    }

    /// Connect `id` to `endpoint` and register the resulting handle
    pub async fn connect(&self, id: TransportId, endpoint: &str) -> Result<(), EngineError> {
        let handle = transport::connect(id, endpoint, self.event_sender()).await?;
        self.attach(handle);
        Ok(())
    }

    /// Register an already connected handle
    ///
    /// The handle must push its events into [`Self::event_sender`].
    pub fn attach(&self, handle: Arc<dyn TransportHandle>) {
        let id = handle.id();
        let open = handle.is_open();
        if self.inner.transports.insert(handle).is_some() {
            tracing::info!(transport = %id, "Replaced transport handle");
        }
        self.lock_store().set_open(id, open);
    }

    /// Unregister the handle for `id`
    pub fn detach(&self, id: TransportId) -> Option<Arc<dyn TransportHandle>> {
        let handle = self.inner.transports.remove(id)?;
        self.lock_store().set_open(id, false);
        let _ = self.inner.notify.send(EngineEvent::TransportStatus {
            transport: id,
            open: false,
        });
        Some(handle)
    }

    /// Handle registered for `id`
    pub fn transport(&self, id: TransportId) -> Option<Arc<dyn TransportHandle>> {
        self.inner.transports.get(id)
    }

    /// Begin a run
    ///
    /// Resets the sequence counter and every transport's counters and
    /// buffers, then starts the scheduler and the statistics refresh.
    /// Returns `false` if a run is already active.
    pub fn start(&self) -> bool {
        let mut scheduler = self.lock_scheduler();
        if !self.lock_store().begin_run() {
            return false;
        }

        let settings = self.settings();
        scheduler.start(
            settings.interval(),
            settings.padding(),
            Arc::clone(&self.inner.store),
            self.inner.transports.clone(),
            self.inner.notify.clone(),
        );
        self.start_stats_task();

        tracing::info!(
            interval_ms = settings.interval().as_millis() as u64,
            padding_bytes = settings.padding(),
            "Run started"
        );
        let _ = self.inner.notify.send(EngineEvent::RunState { running: true });
        true
    }

    /// End the run
    ///
    /// Counters and buffers are left intact. Returns `false` if no run was
    /// active.
    pub fn stop(&self) -> bool {
        let mut scheduler = self.lock_scheduler();
        if !self.lock_store().end_run() {
            return false;
        }
        scheduler.stop();
        if let Some(task) = self.lock_stats_task().take() {
            task.abort();
        }

        tracing::info!(
            sequence_counter = self.lock_store().sequence_counter(),
            "Run stopped"
        );
        let _ = self.inner.notify.send(EngineEvent::RunState { running: false });
        true
    }

    pub fn state(&self) -> EngineState {
        if self.lock_store().is_running() {
            EngineState::Running
        } else {
            EngineState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Copy of everything a renderer needs
    pub fn snapshot(&self) -> EngineSnapshot {
        self.lock_store().snapshot()
    }

    /// Subscribe to engine notifications
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.notify.subscribe()
    }

    /// Current settings
    pub fn settings(&self) -> ProbeSettings {
        match self.inner.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the settings
    ///
    /// Enable flags apply immediately. A new interval or padding size takes
    /// effect on the next tick of an active run without resetting it.
    pub fn update_settings(&self, settings: ProbeSettings) {
        {
            let mut store = self.lock_store();
            for id in TransportId::ALL {
                store.set_enabled(id, settings.is_enabled(id));
            }
        }
        match self.inner.settings.write() {
            Ok(mut current) => *current = settings.clone(),
            Err(poisoned) => *poisoned.into_inner() = settings.clone(),
        }

        let mut scheduler = self.lock_scheduler();
        if self.is_running() {
            scheduler.start(
                settings.interval(),
                settings.padding(),
                Arc::clone(&self.inner.store),
                self.inner.transports.clone(),
                self.inner.notify.clone(),
            );
        }
        tracing::info!(
            interval_ms = settings.interval().as_millis() as u64,
            padding_bytes = settings.padding(),
            "Settings updated"
        );
        let _ = self.inner.notify.send(EngineEvent::SettingsChanged);
    }

    /// Enable or disable probing on one transport
    pub fn set_enabled(&self, id: TransportId, enabled: bool) {
        let mut settings = self.settings();
        settings.set_enabled(id, enabled);
        match self.inner.settings.write() {
            Ok(mut current) => *current = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
        self.lock_store().set_enabled(id, enabled);
        tracing::info!(transport = %id, enabled, "Transport toggled");
        let _ = self.inner.notify.send(EngineEvent::SettingsChanged);
    }

    /// Send one probe on a single transport right now, outside the tick
    ///
    /// Uses and advances the run's sequence counter. Returns `Ok(None)` when
    /// idle.
    pub fn probe_once(&self, id: TransportId) -> Result<Option<u64>, EngineError> {
        let handle = self
            .inner
            .transports
            .get(id)
            .ok_or(TransportError::Closed(id))?;
        let padding = self.settings().padding();
        let mut store = self.lock_store();
        if !store.is_enabled(id) {
            return Err(EngineError::Disabled(id));
        }
        let Some(probe) = store.next_probe(crate::now_millis(), padding) else {
            return Ok(None);
        };
        let message = probe.encode();
        store.set_last_probe_bytes(message.len());
        let outcome = handle.send(&message);
        store.record_send(id, &outcome);
        outcome?;
        Ok(Some(probe.id))
    }

    /// Recompute rolling statistics for every transport now
    ///
    /// The statistics task calls this every `STATS_INTERVAL_MS` while a run
    /// is active.
    pub fn refresh_stats(&self) {
        refresh(&self.inner.store, &self.inner.notify);
    }

    fn start_stats_task(&self) {
        let store = Arc::clone(&self.inner.store);
        let notify = self.inner.notify.clone();
        let task = tokio::spawn(async move {
            let period = Duration::from_millis(STATS_INTERVAL_MS);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !refresh(&store, &notify) {
                    break;
                }
            }
        });
        if let Some(previous) = self.lock_stats_task().replace(task) {
            previous.abort();
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, StatsStore> {
        self.inner
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, ProbeScheduler> {
        self.inner
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_stats_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .stats_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Refresh rolling statistics; returns `false` once the run has ended
fn refresh(store: &Mutex<StatsStore>, notify: &broadcast::Sender<EngineEvent>) -> bool {
    {
        let mut store = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !store.is_running() {
            return false;
        }
        store.refresh_rolling(crate::now_millis());
        for id in TransportId::ALL {
            let state = store.transport(id);
            if let Some(summary) = state.summary {
                tracing::debug!(
                    transport = %id,
                    average = summary.average,
                    median = summary.median,
                    samples = summary.count,
                    "Rolling stats"
                );
            }
        }
    }
    let _ = notify.send(EngineEvent::StatsRefreshed);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackOptions, LoopbackTransport};

    fn fast_settings() -> ProbeSettings {
        ProbeSettings {
            interval_ms: 10,
            ..ProbeSettings::default()
        }
    }

    #[tokio::test]
    async fn test_start_stop_state_machine() {
        let engine = ProbeEngine::new(fast_settings());
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.stop());
        assert!(engine.start());
        assert!(!engine.start());
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.stop());
        assert!(!engine.stop());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_loopback_run_collects_samples() {
        let engine = ProbeEngine::new(fast_settings());
        for id in TransportId::ALL {
            engine.connect(id, "loopback:").await.unwrap();
        }
        assert!(engine.start());
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.refresh_stats();
        assert!(engine.stop());

        let snapshot = engine.snapshot();
        assert!(snapshot.sequence_counter > 0);
        assert!(snapshot.last_probe_bytes > 0);
        for id in TransportId::ALL {
            let t = snapshot.transport(id).unwrap();
            assert!(t.open);
            assert!(t.sent > 0, "{} sent nothing", id);
            assert!(t.received > 0, "{} received nothing", id);
            assert!(t.average.is_some());
            assert!(!t.series.is_empty());
        }
    }

    #[tokio::test]
    async fn test_restart_resets_sequence() {
        let engine = ProbeEngine::new(fast_settings());
        engine.connect(TransportId::Stream, "loopback:").await.unwrap();
        engine.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop();
        assert!(engine.snapshot().sequence_counter > 1);

        // Slow ticks so only the manual probe advances the counter
        engine.update_settings(ProbeSettings {
            interval_ms: 60_000,
            ..ProbeSettings::default()
        });
        engine.start();
        assert_eq!(engine.probe_once(TransportId::Stream).unwrap(), Some(1));
        engine.stop();
    }

    #[tokio::test]
    async fn test_disabled_transport_gets_no_probes() {
        let mut settings = fast_settings();
        settings.set_enabled(TransportId::Reliable, false);
        let engine = ProbeEngine::new(settings);
        engine.connect(TransportId::Stream, "loopback:").await.unwrap();
        engine.connect(TransportId::Reliable, "loopback:").await.unwrap();

        engine.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop();

        let snapshot = engine.snapshot();
        let reliable = snapshot.transport(TransportId::Reliable).unwrap();
        assert!(!reliable.enabled);
        assert_eq!(reliable.sent, 0);
        assert!(snapshot.transport(TransportId::Stream).unwrap().sent > 0);
        assert!(matches!(
            engine.probe_once(TransportId::Reliable),
            Err(EngineError::Disabled(TransportId::Reliable))
        ));
    }

    #[tokio::test]
    async fn test_closed_transport_reported_and_skipped() {
        let engine = ProbeEngine::new(fast_settings());
        let mut notifications = engine.subscribe();
        let loopback = Arc::new(LoopbackTransport::spawn(
            TransportId::Unreliable,
            LoopbackOptions::default(),
            engine.event_sender(),
        ));
        engine.attach(loopback.clone());
        loopback.close();

        loop {
            if let EngineEvent::TransportStatus { open: false, .. } =
                notifications.recv().await.unwrap()
            {
                break;
            }
        }
        engine.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop();

        let snapshot = engine.snapshot();
        let unreliable = snapshot.transport(TransportId::Unreliable).unwrap();
        assert!(!unreliable.open);
        assert_eq!(unreliable.sent, 0);
        assert_eq!(unreliable.dropped, 0);
    }

    #[tokio::test]
    async fn test_update_settings_applies_padding() {
        let engine = ProbeEngine::new(ProbeSettings {
            interval_ms: 60_000,
            ..ProbeSettings::default()
        });
        engine.connect(TransportId::Stream, "loopback:").await.unwrap();
        engine.start();
        engine.probe_once(TransportId::Stream).unwrap();
        let plain = engine.snapshot().last_probe_bytes;

        engine.update_settings(ProbeSettings {
            interval_ms: 60_000,
            padding_bytes: 500,
            ..ProbeSettings::default()
        });
        engine.probe_once(TransportId::Stream).unwrap();
        assert!(engine.snapshot().last_probe_bytes >= plain + 500);
        assert!(engine.is_running());
        engine.stop();
    }
}
