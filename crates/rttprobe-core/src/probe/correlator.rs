//! Reply correlator
//!
//! Turns inbound messages into [`Sample`]s. The RTT is taken from the
//! `client_ts` the responder echoes back, so no table of outstanding probes
//! is kept: late, reordered, and even duplicated replies all produce
//! samples.

use super::message::{decode_reply, Sample};
use crate::engine::EngineEvent;
use crate::stats::store::StatsStore;
use crate::transport::{TransportEvent, TransportId};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};

/// Correlate one inbound message received at `now`
///
/// Non-reply messages and malformed replies yield `None` and are otherwise
/// ignored.
pub fn correlate(transport: TransportId, bytes: &[u8], now: i64) -> Option<Sample> {
    match decode_reply(bytes) {
        Ok(Some(reply)) => {
            let Some(rtt_ms) = now.checked_sub(reply.client_ts) else {
                tracing::trace!(
                    transport = %transport,
                    client_ts = reply.client_ts,
                    "reply_dropped: timestamp out of range"
                );
                return None;
            };
            Some(Sample {
                transport,
                sequence_id: reply.id,
                rtt_ms,
                arrival_ms: now,
            })
        }
        Ok(None) => None,
        Err(e) => {
            tracing::trace!(transport = %transport, error = %e, "reply_dropped");
            None
        }
    }
}

fn lock(store: &Mutex<StatsStore>) -> MutexGuard<'_, StatsStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consume transport events until every sender is gone
///
/// Messages become samples in the store; open/close notifications update
/// the transport's status. Each change is announced on `notify`.
pub async fn run_correlator(
    mut events: mpsc::Receiver<TransportEvent>,
    store: Arc<Mutex<StatsStore>>,
    notify: broadcast::Sender<EngineEvent>,
) {
    while let Some(event) = events.recv().await {
        let announcement = match event {
            TransportEvent::Message(transport, bytes) => {
                let Some(sample) = correlate(transport, &bytes, crate::now_millis()) else {
                    continue;
                };
                lock(&store).record_sample(&sample);
                tracing::trace!(
                    transport = %sample.transport,
                    sequence_id = sample.sequence_id,
                    rtt_ms = sample.rtt_ms,
                    "sample"
                );
                EngineEvent::Sample(sample)
            }
            TransportEvent::Opened(transport) => {
                lock(&store).set_open(transport, true);
                EngineEvent::TransportStatus {
                    transport,
                    open: true,
                }
            }
            TransportEvent::Closed(transport) => {
                lock(&store).set_open(transport, false);
                EngineEvent::TransportStatus {
                    transport,
                    open: false,
                }
            }
        };
        let _ = notify.send(announcement);
    }
    tracing::debug!("Correlator finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::message::{answer_ping, Probe};

    #[test]
    fn test_rtt_from_echoed_timestamp() {
        let pong = answer_ping(&Probe::new(9, 1_000, 0).encode(), 1_020).unwrap();
        let sample = correlate(TransportId::Reliable, &pong, 1_045).unwrap();
        assert_eq!(sample.sequence_id, 9);
        assert_eq!(sample.rtt_ms, 45);
        assert_eq!(sample.arrival_ms, 1_045);
        assert_eq!(sample.transport, TransportId::Reliable);
    }

    #[test]
    fn test_string_id_normalized() {
        let text = correlate(
            TransportId::Stream,
            br#"{"type":"pong","id":"7","client_ts":10}"#,
            15,
        );
        let numeric = correlate(
            TransportId::Stream,
            br#"{"type":"pong","id":7,"client_ts":10}"#,
            15,
        );
        assert_eq!(text, numeric);
        assert_eq!(text.unwrap().sequence_id, 7);
    }

    #[test]
    fn test_garbage_is_dropped() {
        assert!(correlate(TransportId::Unreliable, b"\xff\xfe", 0).is_none());
        assert!(correlate(TransportId::Unreliable, br#"{"type":"pong"}"#, 0).is_none());
        assert!(correlate(TransportId::Unreliable, br#"{"type":"hello"}"#, 0).is_none());
    }

    #[test]
    fn test_out_of_range_timestamp_is_dropped() {
        let hostile = format!(r#"{{"type":"pong","id":1,"client_ts":{}}}"#, i64::MIN);
        assert!(correlate(TransportId::Stream, hostile.as_bytes(), 1_000).is_none());
        let future = format!(r#"{{"type":"pong","id":1,"client_ts":{}}}"#, i64::MAX);
        assert!(correlate(TransportId::Stream, future.as_bytes(), -10).is_none());
    }

    #[tokio::test]
    async fn test_bad_reply_does_not_stop_other_transports() {
        let store = Arc::new(Mutex::new(StatsStore::new()));
        store.lock().unwrap().begin_run();
        let (tx, rx) = mpsc::channel(16);
        let (notify, _) = broadcast::channel(16);
        let task = tokio::spawn(run_correlator(rx, Arc::clone(&store), notify));

        let hostile = format!(r#"{{"type":"pong","id":1,"client_ts":{}}}"#, i64::MIN);
        tx.send(TransportEvent::Message(
            TransportId::Unreliable,
            hostile.into_bytes(),
        ))
        .await
        .unwrap();
        let now = crate::now_millis();
        let pong = answer_ping(&Probe::new(2, now, 0).encode(), now).unwrap();
        tx.send(TransportEvent::Message(TransportId::Stream, pong))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        let store = store.lock().unwrap();
        assert_eq!(store.transport(TransportId::Stream).received, 1);
        assert_eq!(store.transport(TransportId::Unreliable).received, 0);
    }

    #[tokio::test]
    async fn test_poisoned_store_still_records() {
        let store = Arc::new(Mutex::new(StatsStore::new()));
        store.lock().unwrap().begin_run();
        let poisoner = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the store");
        })
        .join();
        assert!(store.is_poisoned());

        let (tx, rx) = mpsc::channel(16);
        let (notify, _) = broadcast::channel(16);
        let task = tokio::spawn(run_correlator(rx, Arc::clone(&store), notify));
        let now = crate::now_millis();
        let pong = answer_ping(&Probe::new(1, now, 0).encode(), now).unwrap();
        tx.send(TransportEvent::Message(TransportId::Reliable, pong))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        let store = store.lock().unwrap_or_else(|p| p.into_inner());
        assert_eq!(store.transport(TransportId::Reliable).received, 1);
    }

    #[tokio::test]
    async fn test_events_update_store() {
        let store = Arc::new(Mutex::new(StatsStore::new()));
        store.lock().unwrap().begin_run();
        let (tx, rx) = mpsc::channel(16);
        let (notify, mut notifications) = broadcast::channel(16);
        let task = tokio::spawn(run_correlator(rx, Arc::clone(&store), notify));

        let now = crate::now_millis();
        let pong = answer_ping(&Probe::new(1, now, 0).encode(), now).unwrap();
        tx.send(TransportEvent::Opened(TransportId::Stream)).await.unwrap();
        tx.send(TransportEvent::Message(TransportId::Stream, b"junk".to_vec()))
            .await
            .unwrap();
        tx.send(TransportEvent::Message(TransportId::Stream, pong))
            .await
            .unwrap();
        tx.send(TransportEvent::Closed(TransportId::Stream)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(matches!(
            notifications.recv().await.unwrap(),
            EngineEvent::TransportStatus { open: true, .. }
        ));
        assert!(matches!(
            notifications.recv().await.unwrap(),
            EngineEvent::Sample(_)
        ));
        assert!(matches!(
            notifications.recv().await.unwrap(),
            EngineEvent::TransportStatus { open: false, .. }
        ));

        let store = store.lock().unwrap();
        let stream = store.transport(TransportId::Stream);
        assert_eq!(stream.received, 1);
        assert_eq!(stream.window.len(), 1);
        assert!(!stream.open);
    }
}
