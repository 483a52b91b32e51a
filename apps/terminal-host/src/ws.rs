//! Websocket endpoint bridging remote terminals onto the in-process hub.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use terminal_protocol::hub::HostHub;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct HostState {
    hub: HostHub,
    token: Option<String>,
}

impl HostState {
    pub fn new(hub: HostHub, token: Option<String>) -> Self {
        Self { hub, token }
    }
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(terminal_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<HostState>,
) -> Response {
    if let Some(expected) = &state.token {
        if params.get("token") != Some(expected) {
            warn!(%terminal_id, "websocket rejected: bad token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    if terminal_id.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, terminal_id))
}

/// Pump frames between the websocket and the hub link until either side
/// closes. The hub handles supersede semantics when the same terminal id
/// attaches twice.
async fn handle_socket(socket: WebSocket, hub: HostHub, terminal_id: String) {
    let wire = match hub.attach(&terminal_id) {
        Ok(wire) => wire,
        Err(e) => {
            warn!(%terminal_id, error = %e, "hub attach failed");
            return;
        }
    };
    info!(%terminal_id, "terminal connected");

    let (mut sink, mut stream) = socket.split();
    let mut to_terminal = wire.rx;
    let to_hub = wire.tx;

    let mut send_task = tokio::spawn(async move {
        while let Some(raw) = to_terminal.recv().await {
            if sink.send(Message::Text(raw)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            match next {
                Ok(Message::Text(raw)) => {
                    if to_hub.send(raw).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!(%terminal_id, "terminal socket closed");
}
