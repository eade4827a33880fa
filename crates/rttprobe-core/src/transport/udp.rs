//! UDP transport (unordered, no retransmission)
//!
//! One message per datagram over a connected socket. UDP has no session, so
//! the handle stays open for its whole lifetime; ICMP errors surfaced by the
//! kernel are logged and treated as lost probes.

use super::{deliver, EventSender, Outbound, TransportError, TransportEvent};
use super::{TransportHandle, TransportId, MAX_MESSAGE_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Connected UDP socket
#[derive(Debug)]
pub struct UdpTransport {
    outbound: Outbound,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect it to `addr` (`host:port`)
    pub async fn connect(
        id: TransportId,
        addr: &str,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            endpoint: format!("udp://{}", addr),
            reason,
        };
        let remote = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("address did not resolve".to_string()))?;
        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket
            .connect(remote)
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let (outbound, mut rx, _open) = Outbound::new(id);

        tracing::info!(transport = %id, %remote, %local_addr, "UDP socket connected");
        deliver(&events, TransportEvent::Opened(id));

        let reader_socket = Arc::clone(&socket);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
            loop {
                match reader_socket.recv(&mut buf).await {
                    Ok(len) => deliver(&events, TransportEvent::Message(id, buf[..len].to_vec())),
                    Err(e) => {
                        tracing::debug!(transport = %id, error = %e, "UDP receive error");
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = socket.send(&bytes).await {
                    tracing::debug!(transport = %id, error = %e, "UDP send error");
                }
            }
            // Handle dropped: stop listening for replies too
            reader.abort();
        });

        Ok(Self {
            outbound,
            local_addr,
        })
    }

    /// Local address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl TransportHandle for UdpTransport {
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
