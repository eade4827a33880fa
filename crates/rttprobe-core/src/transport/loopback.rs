//! In-process loopback transport
//!
//! Answers every ping locally, as a responder would, after an optional
//! artificial delay. Used by tests and for running the engine without a
//! responder. Endpoint form: `loopback:` or
//! `loopback:?delay_ms=5&drop_every=3`.

use super::{deliver, mark_closed, EventSender, Outbound, TransportError, TransportEvent};
use super::{TransportHandle, TransportId};
use crate::probe::message::answer_ping;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Behavior knobs parsed from a `loopback:` endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackOptions {
    /// Delay before each reply is delivered (ms)
    pub delay_ms: u64,
    /// Swallow every Nth message without replying (0 = never)
    pub drop_every: u64,
}

impl LoopbackOptions {
    /// Parse the query part of a `loopback:` endpoint
    pub fn from_endpoint(endpoint: &str) -> Result<Self, TransportError> {
        let unsupported = || TransportError::UnsupportedEndpoint(endpoint.to_string());
        let rest = endpoint.strip_prefix("loopback:").ok_or_else(unsupported)?;
        let query = rest.trim_start_matches('/').trim_start_matches('?');

        let mut options = Self::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(unsupported)?;
            let value: u64 = value.parse().map_err(|_| unsupported())?;
            match key {
                "delay_ms" => options.delay_ms = value,
                "drop_every" => options.drop_every = value,
                _ => return Err(unsupported()),
            }
        }
        Ok(options)
    }
}

/// Loopback handle
#[derive(Debug)]
pub struct LoopbackTransport {
    outbound: Outbound,
    open: Arc<AtomicBool>,
    events: EventSender,
}

impl LoopbackTransport {
    /// Start the reply task and report the transport open
    pub fn spawn(id: TransportId, options: LoopbackOptions, events: EventSender) -> Self {
        let (outbound, mut rx, open) = Outbound::new(id);
        tracing::info!(
            transport = %id,
            delay_ms = options.delay_ms,
            drop_every = options.drop_every,
            "Loopback transport started"
        );
        deliver(&events, TransportEvent::Opened(id));

        let replies = events.clone();
        tokio::spawn(async move {
            let mut received: u64 = 0;
            while let Some(bytes) = rx.recv().await {
                received += 1;
                if options.drop_every > 0 && received % options.drop_every == 0 {
                    tracing::trace!(transport = %id, received, "Loopback dropping message");
                    continue;
                }
                let Some(pong) = answer_ping(&bytes, crate::now_millis()) else {
                    continue;
                };
                if options.delay_ms == 0 {
                    deliver(&replies, TransportEvent::Message(id, pong));
                } else {
                    let replies = replies.clone();
                    let delay = Duration::from_millis(options.delay_ms);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        deliver(&replies, TransportEvent::Message(id, pong));
                    });
                }
            }
        });

        Self {
            outbound,
            open,
            events,
        }
    }

    /// Simulate the connection going away
    pub fn close(&self) {
        mark_closed(self.outbound.id(), &self.open, &self.events);
    }
}

impl TransportHandle for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.outbound.id()
    }

    fn is_open(&self) -> bool {
        self.outbound.is_open()
    }

    fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        self.outbound.send(message)
    }
}
