use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use tokio::sync::mpsc;

use crate::live;
use crate::server::AppState;

const FRAME_BUFFER: usize = 32;

/// `/ws/nodes`: one immediate snapshot, then coalesced snapshots on change.
/// Server-to-client only.
pub async fn ws_nodes(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<AppState>, mut socket: WebSocket) {
    match live::snapshot_frame(state.store.as_ref()) {
        Ok(frame) => {
            if socket.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        // Keep the socket; it will catch up on the next broadcast.
        Err(e) => tracing::warn!("initial roster snapshot failed: {e}"),
    }

    let (frames_tx, mut frames_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let id = state.roster.subscribe(frames_tx).await;

    loop {
        tokio::select! {
            frame = frames_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                // Client frames are never interpreted; only closure matters.
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.roster.unsubscribe(id).await;
}
