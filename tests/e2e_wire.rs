//! E2E tests for the probe wire format as seen by both peers

use rttprobe::probe::correlator::correlate;
use rttprobe::probe::message::{answer_ping, decode_reply, Probe};
use rttprobe::TransportId;

#[test]
fn test_probe_shape() {
    let plain: serde_json::Value = serde_json::from_slice(&Probe::new(1, 42, 0).encode()).unwrap();
    assert_eq!(plain["type"], "ping");
    assert_eq!(plain["id"], 1);
    assert_eq!(plain["ts"], 42);
    assert!(plain.get("payload").is_none());

    let padded: serde_json::Value =
        serde_json::from_slice(&Probe::new(2, 42, 300).encode()).unwrap();
    let payload = padded["payload"].as_str().unwrap();
    assert_eq!(payload.len(), 300);
    assert!(payload.chars().all(|c| c == 'X'));
}

#[test]
fn test_padding_grows_message_by_exact_amount() {
    let base = Probe::new(7, 1_000, 1).encode().len();
    let bigger = Probe::new(7, 1_000, 1_001).encode().len();
    assert_eq!(bigger - base, 1_000);
}

#[test]
fn test_round_trip_through_responder() {
    let ping = Probe::new(55, 10_000, 16).encode();
    let pong = answer_ping(&ping, 10_004).unwrap();
    let sample = correlate(TransportId::Unreliable, &pong, 10_009).unwrap();
    assert_eq!(sample.sequence_id, 55);
    assert_eq!(sample.rtt_ms, 9);
}

#[test]
fn test_foreign_responder_with_string_ids() {
    // Some responders stringify the id and omit server_ts
    let reply = decode_reply(br#"{"type":"pong","id":"123","client_ts":5}"#)
        .unwrap()
        .unwrap();
    assert_eq!(reply.id, 123);
    assert_eq!(reply.server_ts, None);
}

#[test]
fn test_duplicate_replies_both_count() {
    let pong = answer_ping(&Probe::new(3, 0, 0).encode(), 1).unwrap();
    let first = correlate(TransportId::Stream, &pong, 10).unwrap();
    let second = correlate(TransportId::Stream, &pong, 20).unwrap();
    assert_eq!(first.sequence_id, second.sequence_id);
    assert_eq!(second.rtt_ms, 20);
}

#[test]
fn test_responder_ignores_everything_but_pings() {
    assert!(answer_ping(b"", 0).is_none());
    assert!(answer_ping(b"null", 0).is_none());
    assert!(answer_ping(br#"{"type":"stats"}"#, 0).is_none());
}
