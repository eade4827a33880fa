//! Probe and reply wire messages
//!
//! Probes go out as `{"type":"ping","id":N,"ts":T[,"payload":"XXX"]}`.
//! Responders answer with the same object retyped to `"pong"`, carrying the
//! original `ts` back as `client_ts` (and their own clock as `server_ts`).

use crate::transport::{TransportId, MAX_DATAGRAM_PAYLOAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Filler character used for padding payloads
pub const PADDING_CHAR: char = 'X';

/// Bytes kept free for the JSON around the payload of the largest reply
const ENVELOPE_RESERVE: usize = 512;

/// Largest padding whose reply still fits one datagram or one line
pub const MAX_PADDING_BYTES: usize = MAX_DATAGRAM_PAYLOAD - ENVELOPE_RESERVE;

/// Errors raised while decoding a reply
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Reply is missing field `{0}`")]
    MissingField(&'static str),

    #[error("Reply id is not a non-negative integer: {0}")]
    InvalidId(String),
}

/// A ping probe, built once per tick and sent verbatim on every transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    /// Sequence id, starting at 1 for each run
    pub id: u64,
    /// Send time in epoch milliseconds
    pub ts: i64,
    /// Optional filler that inflates the message size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Tagged form used on the wire so `type` is always emitted first
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Outgoing<'a> {
    Ping(&'a Probe),
}

impl Probe {
    /// Build a probe; `padding_bytes == 0` leaves the payload out entirely
    pub fn new(id: u64, ts: i64, padding_bytes: usize) -> Self {
        let payload = (padding_bytes > 0).then(|| PADDING_CHAR.to_string().repeat(padding_bytes));
        Self { id, ts, payload }
    }

    /// Serialize to the JSON wire form
    pub fn encode(&self) -> Vec<u8> {
        // A struct of integers and a plain string cannot fail to serialize
        serde_json::to_vec(&Outgoing::Ping(self)).unwrap_or_default()
    }
}

/// Reply id as found on the wire (some responders stringify it)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(u64),
    Text(String),
}

impl WireId {
    fn normalize(self) -> Result<u64, CodecError> {
        match self {
            WireId::Number(n) => Ok(n),
            WireId::Text(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| CodecError::InvalidId(s)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<WireId>,
    client_ts: Option<i64>,
    server_ts: Option<i64>,
}

/// A decoded pong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Sequence id of the probe this answers
    pub id: u64,
    /// Original send time echoed by the responder
    pub client_ts: i64,
    /// Responder clock at reply time, when provided
    pub server_ts: Option<i64>,
}

/// Decode an inbound message
///
/// Returns `Ok(None)` for well-formed messages that are not replies.
pub fn decode_reply(bytes: &[u8]) -> Result<Option<Reply>, CodecError> {
    let raw: RawReply = serde_json::from_slice(bytes)?;
    if raw.kind.as_deref() != Some("pong") {
        return Ok(None);
    }
    let id = raw.id.ok_or(CodecError::MissingField("id"))?.normalize()?;
    let client_ts = raw.client_ts.ok_or(CodecError::MissingField("client_ts"))?;
    Ok(Some(Reply {
        id,
        client_ts,
        server_ts: raw.server_ts,
    }))
}

/// One accepted reply, turned into a latency measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Transport the reply arrived on
    pub transport: TransportId,
    /// Sequence id of the answered probe
    pub sequence_id: u64,
    /// Round-trip time in milliseconds
    pub rtt_ms: i64,
    /// Arrival time in epoch milliseconds
    pub arrival_ms: i64,
}

/// Responder side: turn a ping into its pong
///
/// The reply keeps every field of the ping (id, padding) and adds
/// `client_ts` (copied from `ts`) and `server_ts`. Anything that is not a
/// JSON object with `"type":"ping"` yields `None`.
pub fn answer_ping(bytes: &[u8], server_ts: i64) -> Option<Vec<u8>> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let object = value.as_object_mut()?;
    if object.get("type").and_then(|t| t.as_str()) != Some("ping") {
        return None;
    }
    let ts = object.get("ts").cloned().unwrap_or(serde_json::Value::Null);
    object.insert("type".to_string(), "pong".into());
    object.insert("client_ts".to_string(), ts);
    object.insert("server_ts".to_string(), server_ts.into());
    serde_json::to_vec(&value).ok()
}
