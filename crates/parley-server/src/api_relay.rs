//! The client-facing realtime WebSocket endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use parley_relay::{ClientMessage, OutboundFrame};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::AppState;

/// Size of the per-connection inbound/outbound queues.
const SOCKET_QUEUE: usize = 256;

/// WebSocket handler: `GET /realtime`.
///
/// Each upgrade becomes one relay session with a fresh session id.
pub async fn realtime_ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session_id = Uuid::new_v4().to_string();
    tracing::info!(session_id = %session_id, "realtime client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

/// Adapts the axum socket onto the relay's channel transport.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let (in_tx, in_rx) = mpsc::channel(SOCKET_QUEUE);
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(SOCKET_QUEUE);
    let epoch = Arc::new(AtomicU64::new(0));

    // Writer task: forward relay frames, dropping audio that belongs to an
    // interrupted turn.
    let writer_epoch = epoch.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if frame.is_stale(writer_epoch.load(Ordering::SeqCst)) {
                continue;
            }
            if sender
                .send(AxumMessage::Text(frame.text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Reader task: convert socket messages into relay client messages.
    let read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let converted = match msg {
                AxumMessage::Text(text) => ClientMessage::Text(text.to_string()),
                AxumMessage::Binary(data) => ClientMessage::Binary(data.to_vec()),
                AxumMessage::Close(_) => ClientMessage::Close,
                _ => continue,
            };
            let is_close = matches!(converted, ClientMessage::Close);
            if in_tx.send(converted).await.is_err() || is_close {
                break;
            }
        }
    });

    if let Err(e) = state
        .relay
        .clone()
        .run_session(session_id.clone(), in_rx, out_tx, epoch)
        .await
    {
        tracing::warn!(session_id = %session_id, "relay session ended with error: {}", e);
    }

    send_task.abort();
    read_task.abort();
}
