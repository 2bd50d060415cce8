use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use hostlink_core::{Outgoing, RelayError, RouterHandle, ServerMessage};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shared state for WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub relay: RouterHandle,
    /// Ping interval. A connection that misses one pong is dropped.
    pub heartbeat: Duration,
}

/// WebSocket upgrade handler
pub async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump one socket: inbound frames to the router, queued frames to the peer.
///
/// Authentication happens in-band, so every upgrade gets a connection.
async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (connection, mut outgoing) = state.relay.open_connection();
    let id = connection.id();
    info!("WebSocket connected: {}", id);

    let mut heartbeat = tokio::time::interval(state.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    heartbeat.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !state.relay.frame(id, text.as_str()) {
                            warn!("Router gone, closing {}", id);
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            if !state.relay.frame(id, text) {
                                break;
                            }
                        }
                        Err(_) => {
                            connection.send(&ServerMessage::error(
                                &RelayError::protocol("Invalid JSON"),
                                None,
                            ));
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!("Failed to send pong to {}: {}", id, e);
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Client requested close");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error on {}: {}", id, e);
                        break;
                    }
                    None => break,
                }
            }
            frame = outgoing.recv() => {
                match frame {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = ws_tx.send(Message::Text(text.as_ref().into())).await {
                            debug!("Failed to send to {}: {}", id, e);
                            break;
                        }
                    }
                    Some(Outgoing::Close { code, reason }) => {
                        info!("Closing {}: {} ({})", id, reason, code);
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    warn!("No pong from {} within {:?}, dropping", id, state.heartbeat);
                    break;
                }
                awaiting_pong = true;
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.relay.disconnect(id);
    info!("WebSocket disconnected: {}", id);
}
