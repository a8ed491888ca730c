//! # Tunnel WebSocket Handler
//!
//! Upgrades `GET /api/tunnels/ws/tunnel?token=...` and manages the life of
//! each tunnel connection:
//! - token validation, with close codes 4401 (missing), 4403 (invalid),
//!   and 4404 (route gone)
//! - a writer task that is the only owner of the WebSocket sink, draining
//!   the connection's outbound queue
//! - the inbound loop feeding decoded frames to the registry
//! - detach on disconnect, which drains the session's pending requests

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::TunnelError;
use crate::protocol::Frame;
use crate::session::{ConnHandle, Outbound};
use crate::state::AppState;

/// Close codes for attach rejections.
const CLOSE_MISSING_TOKEN: u16 = 4401;
const CLOSE_INVALID_TOKEN: u16 = 4403;
const CLOSE_UNKNOWN_ROUTE: u16 = 4404;
const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct TunnelWsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// `GET /api/tunnels/ws/tunnel` — upgrades to the tunnel channel.
pub async fn tunnel_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<TunnelWsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tunnel_socket(socket, state, query.token))
}

/// Manages one tunnel connection from upgrade to detach.
async fn handle_tunnel_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        warn!("tunnel attach rejected: missing token");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_MISSING_TOKEN,
                reason: "missing token".into(),
            })))
            .await;
        return;
    };

    let conn_id = Uuid::new_v4();
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Outbound queue. The writer task is the sole owner of the sink, so
    // frames hit the wire in hand-off order.
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Outbound::Frame(frame) => {
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(err) => {
                            error!("frame encode failed: {err}");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let conn = ConnHandle::new(conn_id, tx.clone());
    let session = match state.registry.attach(&token, conn).await {
        Ok(session) => session,
        Err(err) => {
            let code = match err {
                TunnelError::InvalidToken => CLOSE_INVALID_TOKEN,
                TunnelError::RouteGone => CLOSE_UNKNOWN_ROUTE,
                _ => CLOSE_INTERNAL,
            };
            warn!(code, "tunnel attach rejected: {err}");
            let _ = tx.send(Outbound::Close {
                code,
                reason: err.to_string(),
            });
            let _ = writer.await;
            return;
        }
    };

    // Inbound loop. Only text frames carrying valid protocol JSON are
    // dispatched; everything else is dropped without disconnecting.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                if let Some(frame) = Frame::decode(&text) {
                    state.registry.dispatch_client_frame(conn_id, frame);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(route = %session.route(), "tunnel connection closed");
    state.registry.detach(conn_id);
    writer.abort();
}
