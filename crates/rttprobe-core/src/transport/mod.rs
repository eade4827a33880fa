//! Transport handles
//!
//! A transport handle wraps one live connection and exposes a non-blocking
//! `send` plus an `is_open` probe. Inbound messages and lifecycle changes are
//! not returned from the handle; they are pushed as [`TransportEvent`]s into
//! the queue the handle was connected with, so that a slow read on one
//! connection never stalls another.
//!
//! Providers ([`websocket`], [`tcp`], [`udp`], [`loopback`]) are picked from
//! the endpoint URL scheme by [`connect`].

pub mod loopback;
pub mod tcp;
pub mod udp;
pub mod websocket;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of each provider's outbound queue (messages)
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the shared inbound event queue
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Largest datagram or line a provider will accept
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Largest UDP payload that fits one IPv4 datagram
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507;

/// Logical transport slot measured by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportId {
    /// Ordered, reliable byte stream (WebSocket by default)
    Stream,
    /// Ordered, reliable message channel (line-framed TCP by default)
    Reliable,
    /// Unordered message channel without retransmission (UDP by default)
    Unreliable,
}

impl TransportId {
    /// Every transport slot, in display order
    pub const ALL: [TransportId; 3] = [
        TransportId::Stream,
        TransportId::Reliable,
        TransportId::Unreliable,
    ];

    /// Stable lowercase label used in JSON, logs, and the CLI
    pub fn label(self) -> &'static str {
        match self {
            TransportId::Stream => "stream",
            TransportId::Reliable => "reliable",
            TransportId::Unreliable => "unreliable",
        }
    }

    /// Endpoint used when none is configured
    pub fn default_endpoint(self) -> &'static str {
        match self {
            TransportId::Stream => "ws://127.0.0.1:8920/echo",
            TransportId::Reliable => "tcp://127.0.0.1:8921",
            TransportId::Unreliable => "udp://127.0.0.1:8922",
        }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TransportId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "ws" | "websocket" => Ok(TransportId::Stream),
            "reliable" | "rel" => Ok(TransportId::Reliable),
            "unreliable" | "unrel" => Ok(TransportId::Unreliable),
            other => Err(TransportError::UnknownTransport(other.to_string())),
        }
    }
}

/// Errors raised by transport handles and connection providers
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport {0} is closed")]
    Closed(TransportId),

    #[error("Outbound queue full on {0}")]
    Backpressure(TransportId),

    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("Unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Notification pushed by a transport into the engine's event queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection became usable
    Opened(TransportId),
    /// One inbound message (a single frame, line, or datagram)
    Message(TransportId, Vec<u8>),
    /// The connection went away; sends are skipped until it reopens
    Closed(TransportId),
}

/// One live connection the scheduler can push probes through
///
/// `send` must not block: implementations enqueue and return, reporting
/// [`TransportError::Backpressure`] when the queue is full.
pub trait TransportHandle: Send + Sync {
    /// Slot this handle measures
    fn id(&self) -> TransportId;

    /// Whether the connection can currently carry probes
    fn is_open(&self) -> bool;

    /// Queue one message for transmission
    fn send(&self, message: &[u8]) -> Result<(), TransportError>;
}

/// Shared registry of the handles the scheduler fans out to
///
/// Cloning yields another view of the same registry.
#[derive(Clone, Default)]
pub struct TransportSet {
    handles: Arc<RwLock<BTreeMap<TransportId, Arc<dyn TransportHandle>>>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle, replacing (and returning) any handle for the same slot
    pub fn insert(&self, handle: Arc<dyn TransportHandle>) -> Option<Arc<dyn TransportHandle>> {
        let mut handles = self.handles.write().ok()?;
        handles.insert(handle.id(), handle)
    }

    /// Unregister the handle for a slot
    pub fn remove(&self, id: TransportId) -> Option<Arc<dyn TransportHandle>> {
        self.handles.write().ok()?.remove(&id)
    }

    /// Handle registered for a slot
    pub fn get(&self, id: TransportId) -> Option<Arc<dyn TransportHandle>> {
        self.handles.read().ok()?.get(&id).cloned()
    }

    /// All registered handles, in slot order
    pub fn handles(&self) -> Vec<Arc<dyn TransportHandle>> {
        self.handles
            .read()
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().map(|h| h.is_empty()).unwrap_or(true)
    }
}

impl fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<TransportId> = self.handles().iter().map(|h| h.id()).collect();
        f.debug_struct("TransportSet").field("handles", &ids).finish()
    }
}

/// Sender half of the engine's inbound event queue
pub type EventSender = mpsc::Sender<TransportEvent>;

/// Forward an inbound event, dropping it if the engine is saturated
///
/// Reader tasks must keep draining their sockets even when the correlator
/// lags, so a full queue loses the event rather than applying backpressure
/// to the connection.
pub(crate) fn deliver(events: &EventSender, event: TransportEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            tracing::debug!(?event, "Event queue full, dropping inbound event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Outbound half shared by the socket-backed providers
///
/// Holds the bounded queue drained by the provider's writer task and the
/// open flag that reader and writer tasks clear when the connection ends.
#[derive(Debug)]
pub(crate) struct Outbound {
    id: TransportId,
    tx: mpsc::Sender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

impl Outbound {
    /// Create the queue; the receiver goes to the writer task
    pub(crate) fn new(id: TransportId) -> (Self, mpsc::Receiver<Vec<u8>>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));
        (
            Self {
                id,
                tx,
                open: Arc::clone(&open),
            },
            rx,
            open,
        )
    }

    pub(crate) fn id(&self) -> TransportId {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    pub(crate) fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed(self.id));
        }
        self.tx.try_send(message.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure(self.id),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(self.id),
        })
    }
}

/// Mark a connection closed and tell the engine, once
pub(crate) fn mark_closed(id: TransportId, open: &AtomicBool, events: &EventSender) {
    if open.swap(false, Ordering::AcqRel) {
        tracing::info!(transport = %id, "Transport closed");
        deliver(events, TransportEvent::Closed(id));
    }
}

/// Connect a transport slot to an endpoint, picking the provider by scheme
///
/// Supported schemes: `ws://`, `wss://`, `tcp://`, `udp://`, and `loopback:`.
pub async fn connect(
    id: TransportId,
    endpoint: &str,
    events: EventSender,
) -> Result<Arc<dyn TransportHandle>, TransportError> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        let handle = websocket::WebSocketTransport::connect(id, endpoint, events).await?;
        Ok(Arc::new(handle))
    } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
        let handle = tcp::TcpLineTransport::connect(id, addr, events).await?;
        Ok(Arc::new(handle))
    } else if let Some(addr) = endpoint.strip_prefix("udp://") {
        let handle = udp::UdpTransport::connect(id, addr, events).await?;
        Ok(Arc::new(handle))
    } else if endpoint.starts_with("loopback:") {
        let options = loopback::LoopbackOptions::from_endpoint(endpoint)?;
        Ok(Arc::new(loopback::LoopbackTransport::spawn(id, options, events)))
    } else {
        Err(TransportError::UnsupportedEndpoint(endpoint.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_round_trip_through_from_str() {
        for id in TransportId::ALL {
            assert_eq!(id.label().parse::<TransportId>().unwrap(), id);
        }
    }

    #[test]
    fn test_from_str_aliases() {
        assert_eq!("WS".parse::<TransportId>().unwrap(), TransportId::Stream);
        assert_eq!("unrel".parse::<TransportId>().unwrap(), TransportId::Unreliable);
        assert!("carrier-pigeon".parse::<TransportId>().is_err());
    }

    #[test]
    fn test_serde_uses_lowercase_labels() {
        let json = serde_json::to_string(&TransportId::Unreliable).unwrap();
        assert_eq!(json, "\"unreliable\"");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let (tx, _rx) = mpsc::channel(4);
        let result = connect(TransportId::Stream, "quic://example:443", tx).await;
        assert!(matches!(
            result,
            Err(TransportError::UnsupportedEndpoint(_))
        ));
    }
}
