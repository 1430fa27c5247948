//! WebSocket transport adapter for the hub.
//!
//! One connection gets exactly two tasks. The write pump is the only task
//! that touches the socket's send half: it drains the client's outbound
//! queue and emits periodic liveness pings. The read pump only consumes
//! inbound frames and hands them to the hub; direct replies it triggers
//! travel back through the client's own queue. When either pump finishes,
//! the session is torn down and the client unregistered.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::protocol::ClientMessage;

/// Router exposing the hub's WebSocket endpoint at `/ws`.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new().route("/ws", get(event_ws)).with_state(hub)
}

/// `GET /ws` upgrade handler.
pub async fn event_ws(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let handle = hub.register().await;
    let client_id = handle.id;
    let mut queue_rx = handle.queue;
    let cancel = handle.cancel;

    let ping_interval = hub.config().ping_interval;
    let idle_timeout = hub.config().idle_timeout;
    info!(client = %client_id, "WebSocket session opened");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Write pump: sole writer on this socket.
    let write_id = client_id.clone();
    let write_cancel = cancel.clone();
    let mut write = tokio::spawn(async move {
        let mut ping = interval(ping_interval);
        // The first tick completes immediately; consume it so pings start
        // one interval from now.
        ping.tick().await;
        loop {
            tokio::select! {
                () = write_cancel.cancelled() => {
                    // Force-dropped by the hub (queue overflow). Best-effort
                    // close frame, then stop.
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                queued = queue_rx.recv() => match queued {
                    Some(outbound) => match outbound.to_json() {
                        Ok(json) => {
                            if ws_sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(client = %write_id, error = %e, "Failed to serialize outbound frame");
                        }
                    },
                    None => break,
                },
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read pump: consumes inbound frames, never writes to the socket.
    let read_id = client_id.clone();
    let read_hub = Arc::clone(&hub);
    let read_cancel = cancel;
    let mut read = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                () = read_cancel.cancelled() => break,
                frame = timeout(idle_timeout, ws_receiver.next()) => frame,
            };
            let message = match frame {
                Err(_) => {
                    info!(client = %read_id, "No inbound traffic within idle timeout; closing");
                    break;
                }
                Ok(None | Some(Err(_))) => break,
                Ok(Some(Ok(message))) => message,
            };
            match message {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(parsed) => read_hub.handle_message(&read_id, parsed).await,
                    Err(e) => {
                        debug!(client = %read_id, error = %e, "Ignoring malformed client frame");
                    }
                },
                Message::Close(_) => break,
                // Pongs to our pings (and stray pings) only count as
                // liveness traffic; binary frames are not part of the
                // protocol.
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
            }
        }
    });

    // Either pump finishing ends the session.
    tokio::select! {
        _ = &mut write => read.abort(),
        _ = &mut read => write.abort(),
    }

    hub.unregister(&client_id).await;
    info!(client = %client_id, "WebSocket session closed");
}
