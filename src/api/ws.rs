// =============================================================================
// WebSocket Handler - live trade push
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive every `LiveEvent` published
// after they connected, one JSON text frame each. Delivery is best-effort: a
// client that falls behind the broadcast buffer skips the events it missed
// and carries on.
//
// The handler also answers Ping frames and cleans up on disconnect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broadcaster::LiveEvent;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted, upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Runs two branches via `tokio::select!`:
///   1. **Push** - forward each broadcast event to the client.
///   2. **Recv** - process incoming client frames (Ping, Close).
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut events = state.broadcaster.subscribe();
    let (mut sender, mut receiver) = socket.split();
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    sequence += 1;
                    if let Err(e) = send_event(&mut sender, &event).await {
                        debug!(error = %e, seq = sequence, "WebSocket send failed, disconnecting");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket client lagging, events dropped");
                }
                Err(RecvError::Closed) => {
                    info!("broadcast channel closed, disconnecting client");
                    break;
                }
            },

            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sender.send(Message::Pong(data)).await {
                        debug!(error = %e, "Failed to send Pong, disconnecting");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("WebSocket Close frame received, disconnecting");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket receive error, disconnecting");
                    break;
                }
                None => break,
            },
        }
    }

    info!(sent = sequence, "WebSocket connection closed");
}

async fn send_event<S>(sender: &mut S, event: &LiveEvent) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "Failed to serialize live event");
            Ok(())
        }
    }
}
