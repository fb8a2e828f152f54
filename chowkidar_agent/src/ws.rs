//! WebSocket upgrade and per-connection reader/writer.
//!
//! The writer drains the client's hub queue onto the socket. The reader handles
//! control frames and, when it stops for any reason, unregisters the client, which
//! closes the queue and in turn ends the writer.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::TokenAuthority;
use crate::error::AgentError;
use crate::hub::{Frame, Registration};
use crate::state::AppState;
use crate::types::{AuthAccepted, AuthRejected, WsMessage};

pub async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let remote = peer
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".into());

    let token = q.get("token").map(String::as_str).unwrap_or_default();
    if token.is_empty() {
        warn!(%remote, "websocket without token");
        return AgentError::MissingToken.into_response();
    }
    let claims = match state.auth.validate(token) {
        Ok(c) => c,
        Err(e) => {
            warn!(%remote, "websocket rejected: {e}");
            return e.into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let client_id = format!("{remote}-{}", claims.server_name);
    info!(client = %client_id, "websocket accepted");
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: String) {
    let Some((reg, queue)) = state.hub.register(client_id.clone()).await else {
        warn!(client = %client_id, "hub is shut down, dropping connection");
        return;
    };
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(sink, queue, client_id.clone()));

    loop {
        tokio::select! {
            // Writer gone means the socket is unusable; stop reading too.
            _ = &mut writer => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !handle_text(&text, &reg, &state.auth) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client = %client_id, "websocket read error: {e}");
                    break;
                }
            },
        }
    }

    state.hub.unregister(&reg).await;
    info!(client = %client_id, "websocket closed");
}

async fn write_frames<S>(mut sink: S, mut queue: mpsc::Receiver<Frame>, client_id: String)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
            debug!(client = %client_id, "websocket write error: {e}");
            return;
        }
    }
    // Queue closed by the hub.
    let _ = sink.send(Message::Close(None)).await;
}

/// Handles one inbound text frame. Returns false when the connection should end.
fn handle_text(text: &str, reg: &Registration, auth: &TokenAuthority) -> bool {
    let msg = match serde_json::from_str::<WsMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(client = %reg.id, "unparseable frame: {e}");
            reply(
                reg,
                &WsMessage::Error {
                    error: "malformed message".into(),
                },
            );
            return true;
        }
    };
    match msg {
        WsMessage::Ping => reply(reg, &WsMessage::Pong),
        WsMessage::Auth { token } => match auth.validate(&token) {
            Ok(claims) => {
                info!(client = %reg.id, server = %claims.server_name, "re-authenticated");
                reply(
                    reg,
                    &WsMessage::AuthSuccess {
                        timestamp: Utc::now(),
                        data: AuthAccepted {
                            server: claims.server_name,
                        },
                    },
                );
            }
            Err(e) => {
                warn!(client = %reg.id, "in-band auth failed: {e}");
                reply(
                    reg,
                    &WsMessage::AuthError {
                        timestamp: Utc::now(),
                        data: AuthRejected {
                            error: "invalid token".into(),
                        },
                    },
                );
            }
        },
        WsMessage::Subscribe => debug!(client = %reg.id, "subscribed"),
        WsMessage::Unsubscribe => {
            debug!(client = %reg.id, "unsubscribed");
            return false;
        }
        other => debug!(client = %reg.id, "ignoring client frame {other:?}"),
    }
    true
}

fn reply(reg: &Registration, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(js) => {
            if !reg.reply(js.into()) {
                debug!(client = %reg.id, "reply dropped");
            }
        }
        Err(e) => warn!("cannot serialise reply: {e}"),
    }
}
