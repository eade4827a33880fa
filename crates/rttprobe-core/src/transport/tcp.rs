//! Line-framed TCP transport (ordered, reliable message channel)
//!
//! Every message is one line of JSON terminated by `\n`.

use super::{deliver, mark_closed, EventSender, Outbound, TransportError, TransportEvent};
use super::{TransportHandle, TransportId, MAX_MESSAGE_SIZE};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Result of one [`read_line`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// A line (terminators stripped) is in the buffer; it may be empty
    Line,
    /// The peer closed the connection
    Eof,
    /// More than the allowed bytes arrived without a newline
    TooLong,
}

/// Read one newline-terminated line of at most `max` bytes into `line`
///
/// Never buffers more than `max + 1` bytes, so a peer that stops sending
/// newlines cannot grow memory. After [`LineRead::TooLong`] the stream is
/// mid-line and the connection should be dropped.
pub async fn read_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', line)
        .await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    let terminated = line.last() == Some(&b'\n');
    if !terminated && line.len() > max {
        return Ok(LineRead::TooLong);
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    Ok(LineRead::Line)
}

/// TCP client connection carrying newline-delimited messages
#[derive(Debug)]
pub struct TcpLineTransport {
    outbound: Outbound,
}

impl TcpLineTransport {
    /// Connect to `addr` (`host:port`) and start the reader/writer tasks
    pub async fn connect(
        id: TransportId,
        addr: &str,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect {
                endpoint: format!("tcp://{}", addr),
                reason: e.to_string(),
            })?;
        // Probes are tiny and latency-sensitive
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let (outbound, mut rx, open) = Outbound::new(id);

        tracing::info!(transport = %id, %addr, "TCP connected");
        deliver(&events, TransportEvent::Opened(id));

        let writer_open = open.clone();
        let writer_events = events.clone();
        tokio::spawn(async move {
            while let Some(mut bytes) = rx.recv().await {
                bytes.push(b'\n');
                if let Err(e) = write_half.write_all(&bytes).await {
                    tracing::debug!(transport = %id, error = %e, "TCP write failed");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
            mark_closed(id, &writer_open, &writer_events);
        });

        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = Vec::new();
            loop {
                match read_line(&mut reader, &mut line, MAX_MESSAGE_SIZE).await {
                    Ok(LineRead::Eof) => break,
                    Ok(LineRead::TooLong) => {
                        tracing::debug!(transport = %id, "Oversized line, closing connection");
                        break;
                    }
                    Ok(LineRead::Line) => {
                        if !line.is_empty() {
                            deliver(&events, TransportEvent::Message(id, line.clone()));
                        }
                    }
                    Err(e) => {
                        tracing::debug!(transport = %id, error = %e, "TCP read failed");
                        break;
                    }
                }
            }
            mark_closed(id, &open, &events);
        });

        Ok(Self { outbound })
    }
}

impl TransportHandle for TcpLineTransport {
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
