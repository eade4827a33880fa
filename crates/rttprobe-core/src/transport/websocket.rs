//! WebSocket transport (ordered, reliable stream)
//!
//! Each probe travels as one text frame. Reads and writes run on separate
//! tasks so a congested write side cannot delay reply delivery.

use super::{deliver, mark_closed, EventSender, Outbound, TransportError, TransportEvent};
use super::{TransportHandle, TransportId};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

/// WebSocket client connection
#[derive(Debug)]
pub struct WebSocketTransport {
    outbound: Outbound,
}

impl WebSocketTransport {
    /// Open a WebSocket to `url` and start its reader/writer tasks
    pub async fn connect(
        id: TransportId,
        url: &str,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let (socket, _response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    endpoint: url.to_string(),
                    reason: e.to_string(),
                })?;
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut rx, open) = Outbound::new(id);

        tracing::info!(transport = %id, %url, "WebSocket connected");
        deliver(&events, TransportEvent::Opened(id));

        let writer_open = open.clone();
        let writer_events = events.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                if let Err(e) = sink.send(Message::text(text)).await {
                    tracing::debug!(transport = %id, error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            mark_closed(id, &writer_open, &writer_events);
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        deliver(
                            &events,
                            TransportEvent::Message(id, text.as_bytes().to_vec()),
                        );
                    }
                    Ok(Message::Binary(bytes)) => {
                        deliver(&events, TransportEvent::Message(id, bytes.to_vec()));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(transport = %id, error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
            mark_closed(id, &open, &events);
        });

        Ok(Self { outbound })
    }
}

impl TransportHandle for WebSocketTransport {
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
