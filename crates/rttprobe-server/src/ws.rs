//! WebSocket handler for real-time snapshot push
//!
//! Clients connect to /api/v1/ws and receive a full [`EngineSnapshot`] JSON
//! on connect and again whenever the engine reports a change.
//!
//! [`EngineSnapshot`]: rttprobe_core::EngineSnapshot

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use rttprobe_core::EngineEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

fn build_snapshot_json(state: &AppState) -> Option<String> {
    serde_json::to_string(&state.engine.snapshot()).ok()
}

/// Handle an individual WebSocket connection
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    if let Some(json) = build_snapshot_json(&state) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }

    let mut rx = state.ws_tx.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                // A newer snapshot follows; the skipped ones are stale anyway
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::debug!("WebSocket client disconnected");
}

/// Broadcast a snapshot to all connected WebSocket clients
pub fn broadcast_snapshot(state: &AppState) {
    if state.ws_tx.receiver_count() == 0 {
        return;
    }
    if let Some(json) = build_snapshot_json(state) {
        let _ = state.ws_tx.send(json);
    }
}

/// Forward engine notifications to WebSocket clients as snapshots
///
/// Probe emission alone does not trigger a push; replies, refreshes, and
/// status changes do.
pub fn spawn_snapshot_pusher(state: &AppState) -> JoinHandle<()> {
    let state = state.clone();
    let mut events = state.engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::ProbeSent { .. }) => {}
                Ok(_) => broadcast_snapshot(&state),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Snapshot pusher lagging");
                    broadcast_snapshot(&state);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
