//! Ping responder
//!
//! Answers probes on three listeners so every engine transport has a peer:
//! WebSocket frames at `/echo` on the HTTP port, newline-framed JSON over
//! TCP, and one JSON message per UDP datagram. Each ping comes back as a
//! pong carrying the ping's `ts` as `client_ts` plus the responder clock as
//! `server_ts`; anything else is ignored.
//!
//! With backpressure enabled, a stream connection whose unsent replies
//! exceed [`BACKPRESSURE_THRESHOLD`] drops new pings instead of queueing
//! more data behind a slow reader.

use crate::ServerConfig;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use rttprobe_core::probe::message::answer_ping;
use rttprobe_core::transport::tcp::{read_line, LineRead};
use rttprobe_core::transport::MAX_MESSAGE_SIZE;
use rttprobe_core::TransportId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Unsent reply bytes above which a connection starts dropping pings
pub const BACKPRESSURE_THRESHOLD: usize = 32 * 1024;

/// Cadence of the buffer report log
const REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Counters for one responder listener
#[derive(Debug, Default)]
pub struct LinkStats {
    active: AtomicUsize,
    buffered: AtomicUsize,
    answered: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    /// Open connections (always 0 for UDP)
    pub active: usize,
    /// Reply bytes queued but not yet written
    pub buffered: usize,
    pub answered: u64,
    /// Pings dropped by backpressure
    pub dropped: u64,
}

impl LinkStats {
    fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            active: self.active.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            answered: self.answered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Counters for every listener, shared with the connection tasks
#[derive(Debug, Clone, Default)]
pub struct EchoStats {
    inner: Arc<[LinkStats; 3]>,
}

/// Responder counters keyed by the transport each listener serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoSnapshot {
    pub stream: LinkSnapshot,
    pub reliable: LinkSnapshot,
    pub unreliable: LinkSnapshot,
}

impl EchoStats {
    pub fn link(&self, id: TransportId) -> &LinkStats {
        match id {
            TransportId::Stream => &self.inner[0],
            TransportId::Reliable => &self.inner[1],
            TransportId::Unreliable => &self.inner[2],
        }
    }

    pub fn snapshot(&self) -> EchoSnapshot {
        EchoSnapshot {
            stream: self.link(TransportId::Stream).snapshot(),
            reliable: self.link(TransportId::Reliable).snapshot(),
            unreliable: self.link(TransportId::Unreliable).snapshot(),
        }
    }
}

/// State shared by the responder's connection handlers
#[derive(Debug, Clone)]
pub struct EchoState {
    pub stats: EchoStats,
    pub backpressure: bool,
}

/// Reply queue of one stream connection
///
/// Tracks unsent bytes both for the connection (backpressure decision) and
/// for the listener as a whole (buffer report).
struct ReplyQueue {
    id: TransportId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    state: EchoState,
}

impl ReplyQueue {
    fn new(id: TransportId, state: EchoState) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            id,
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            state,
        };
        (queue, rx)
    }

    /// Answer one inbound message; returns `false` once the writer is gone
    fn handle(&self, message: &[u8]) -> bool {
        let Some(pong) = answer_ping(message, rttprobe_core::now_millis()) else {
            return true;
        };
        let link = self.state.stats.link(self.id);
        if self.state.backpressure && self.pending.load(Ordering::Acquire) > BACKPRESSURE_THRESHOLD
        {
            link.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                transport = %self.id,
                pending = self.pending.load(Ordering::Relaxed),
                "Backpressure, dropping ping"
            );
            return true;
        }
        let len = pong.len();
        self.pending.fetch_add(len, Ordering::AcqRel);
        link.buffered.fetch_add(len, Ordering::Relaxed);
        if self.tx.send(pong).is_err() {
            Self::written(&self.pending, link, len);
            return false;
        }
        link.answered.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Called by the writer after `len` bytes left the queue
    fn written(pending: &AtomicUsize, link: &LinkStats, len: usize) {
        pending.fetch_sub(len, Ordering::AcqRel);
        link.buffered.fetch_sub(len, Ordering::Relaxed);
    }

    /// Writer exit: discard unsent replies so they stop counting as buffered
    fn discard(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, pending: &AtomicUsize, link: &LinkStats) {
        rx.close();
        while let Ok(pong) = rx.try_recv() {
            Self::written(pending, link, pong.len());
        }
    }
}

/// Router serving the WebSocket echo and the responder counters
pub fn echo_router(state: EchoState) -> Router {
    Router::new()
        .route("/echo", axum::routing::get(echo_ws_handler))
        .route("/api/v1/echo", axum::routing::get(get_echo_stats))
        .with_state(state)
}

/// GET /api/v1/echo
async fn get_echo_stats(State(state): State<EchoState>) -> Json<EchoSnapshot> {
    Json(state.stats.snapshot())
}

async fn echo_ws_handler(ws: WebSocketUpgrade, State(state): State<EchoState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_echo_ws(socket, state))
}

async fn handle_echo_ws(socket: WebSocket, state: EchoState) {
    let link_id = TransportId::Stream;
    state.stats.link(link_id).active.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("WebSocket echo client connected");

    let (mut sink, mut stream) = socket.split();
    let (queue, mut rx) = ReplyQueue::new(link_id, state.clone());

    let pending = Arc::clone(&queue.pending);
    let writer_state = state.clone();
    let mut writer = tokio::spawn(async move {
        let link = writer_state.stats.link(link_id);
        while let Some(pong) = rx.recv().await {
            let len = pong.len();
            let text = String::from_utf8_lossy(&pong).into_owned();
            let result = sink.send(Message::Text(text.into())).await;
            ReplyQueue::written(&pending, link, len);
            if result.is_err() {
                break;
            }
        }
        ReplyQueue::discard(&mut rx, &pending, link);
    });

    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            let keep_going = match msg {
                Message::Text(text) => queue.handle(text.as_str().as_bytes()),
                Message::Binary(bytes) => queue.handle(&bytes),
                Message::Close(_) => false,
                _ => true,
            };
            if !keep_going {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {
            // Flush what is already queued before closing
            let _ = (&mut writer).await;
        }
    }

    state.stats.link(link_id).active.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!("WebSocket echo client disconnected");
}

/// Serve one newline-framed TCP connection
async fn handle_tcp(socket: TcpStream, peer: SocketAddr, state: EchoState) {
    let link_id = TransportId::Reliable;
    let _ = socket.set_nodelay(true);
    state.stats.link(link_id).active.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(%peer, "TCP echo client connected");

    let (read_half, mut write_half) = socket.into_split();
    let (queue, mut rx) = ReplyQueue::new(link_id, state.clone());

    let pending = Arc::clone(&queue.pending);
    let writer_state = state.clone();
    let writer = tokio::spawn(async move {
        let link = writer_state.stats.link(link_id);
        while let Some(mut pong) = rx.recv().await {
            let len = pong.len();
            pong.push(b'\n');
            let result = write_half.write_all(&pong).await;
            ReplyQueue::written(&pending, link, len);
            if result.is_err() {
                break;
            }
        }
        ReplyQueue::discard(&mut rx, &pending, link);
    });

    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        match read_line(&mut reader, &mut line, MAX_MESSAGE_SIZE).await {
            Ok(LineRead::Eof) => break,
            Ok(LineRead::TooLong) => {
                tracing::debug!(%peer, "Oversized line, closing TCP echo client");
                break;
            }
            Ok(LineRead::Line) => {
                if line.is_empty() {
                    continue;
                }
                if !queue.handle(&line) {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "TCP echo read failed");
                break;
            }
        }
    }

    drop(queue);
    let _ = writer.await;
    state.stats.link(link_id).active.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!(%peer, "TCP echo client disconnected");
}

async fn run_tcp(listener: TcpListener, state: EchoState) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                tokio::spawn(handle_tcp(socket, peer, state.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn run_udp(socket: UdpSocket, stats: EchoStats) {
    let link = stats.link(TransportId::Unreliable);
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!(error = %e, "UDP receive error");
                continue;
            }
        };
        let Some(pong) = answer_ping(&buf[..len], rttprobe_core::now_millis()) else {
            continue;
        };
        match socket.send_to(&pong, peer).await {
            Ok(_) => {
                link.answered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::debug!(%peer, error = %e, "UDP send error"),
        }
    }
}

/// Log buffered bytes while any stream connection is open
async fn run_report(stats: EchoStats) {
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        let s = stats.snapshot();
        if s.stream.active + s.reliable.active == 0 {
            continue;
        }
        tracing::debug!(
            ws_connections = s.stream.active,
            ws_buffered = s.stream.buffered,
            tcp_connections = s.reliable.active,
            tcp_buffered = s.reliable.buffered,
            udp_answered = s.unreliable.answered,
            "Responder buffers"
        );
    }
}

/// A running responder
///
/// Dropping it stops every listener.
pub struct Responder {
    http_addr: SocketAddr,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    stats: EchoStats,
    tasks: Vec<JoinHandle<()>>,
}

impl Responder {
    /// Bind all three listeners and start answering
    pub async fn bind(config: &ServerConfig) -> anyhow::Result<Self> {
        let host = config.bind_addr.as_str();
        let http = TcpListener::bind((host, config.port)).await?;
        let tcp = TcpListener::bind((host, config.tcp_port)).await?;
        let udp = UdpSocket::bind((host, config.udp_port)).await?;

        let stats = EchoStats::default();
        let state = EchoState {
            stats: stats.clone(),
            backpressure: config.backpressure,
        };
        let http_addr = http.local_addr()?;
        let tcp_addr = tcp.local_addr()?;
        let udp_addr = udp.local_addr()?;

        let app = echo_router(state.clone());
        let tasks = vec![
            tokio::spawn(async move {
                if let Err(e) = axum::serve(http, app).await {
                    tracing::error!(error = %e, "WebSocket echo server failed");
                }
            }),
            tokio::spawn(run_tcp(tcp, state)),
            tokio::spawn(run_udp(udp, stats.clone())),
            tokio::spawn(run_report(stats.clone())),
        ];

        tracing::info!(
            %http_addr,
            %tcp_addr,
            %udp_addr,
            backpressure = config.backpressure,
            "Responder listening"
        );
        Ok(Self {
            http_addr,
            tcp_addr,
            udp_addr,
            stats,
            tasks,
        })
    }

    /// Endpoint URL each engine transport should connect to
    pub fn endpoint(&self, id: TransportId) -> String {
        match id {
            TransportId::Stream => format!("ws://{}/echo", self.http_addr),
            TransportId::Reliable => format!("tcp://{}", self.tcp_addr),
            TransportId::Unreliable => format!("udp://{}", self.udp_addr),
        }
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn stats(&self) -> EchoSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
