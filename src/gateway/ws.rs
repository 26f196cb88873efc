//! Per-connection socket state machine.
//!
//! A connection starts **unauthenticated**: the server sends `auth_required`
//! and only `auth` is processed. A correct PIN mints a client id, registers it
//! with the session, and moves the connection to **authenticated**, where
//! `call`, `subscribe` and `unsubscribe` are accepted.
//!
//! Malformed frames and per-message failures are answered with `error` frames;
//! none of them close the socket. On close the connection is removed from the
//! session's client set, from every shared stream, and from the connection
//! registry in one place ([`disconnect`]).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::fanout::{ConnectionId, SocketSubscriber};
use super::protocol::{ClientMessage, RequestType, ServerMessage};
use super::{AppState, ClientConnection, GatewayState, OUTBOUND_CAPACITY};
use crate::error::RemoteAccessError;
use crate::util::short_id;

type Outbound = mpsc::Sender<ServerMessage>;

/// `GET /ws` - upgrade to the gateway socket. Authentication happens inside
/// the socket, so the upgrade itself is unconditional.
pub(super) async fn ws_upgrade(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, app.gateway, app.shutdown))
}

async fn handle_ws(socket: WebSocket, gw: GatewayState, mut shutdown: watch::Receiver<bool>) {
    let conn = gw.next_connection.fetch_add(1, Ordering::Relaxed);
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    gw.connections
        .write()
        .await
        .insert(conn, ClientConnection::new(tx.clone()));
    debug!(conn, "Socket connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.try_send(ServerMessage::auth_required());

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    Message::Text(text) => {
                        if let Some(reply) = dispatch(&gw, conn, &tx, text.as_str()).await {
                            if !enqueue(&tx, conn, reply) {
                                break;
                            }
                        }
                    }
                    Message::Binary(_) => {
                        if !enqueue(&tx, conn, ServerMessage::error(None, "Invalid message format")) {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(conn, "Gateway stopping, closing socket");
                    break;
                }
            }
        }
    }

    disconnect(&gw, conn).await;
    send_task.abort();
}

/// Queue a direct reply. `false` means the peer stopped reading and the
/// connection should be closed.
fn enqueue(tx: &Outbound, conn: ConnectionId, msg: ServerMessage) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(conn, "Outbound queue full, closing socket");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Handle one text frame. Returns the direct reply, if any.
async fn dispatch(
    gw: &GatewayState,
    conn: ConnectionId,
    tx: &Outbound,
    text: &str,
) -> Option<ServerMessage> {
    let Some(msg) = ClientMessage::parse(text) else {
        debug!(conn, "Malformed frame");
        return Some(ServerMessage::error(None, "Invalid message format"));
    };

    if msg.kind == RequestType::Auth {
        return Some(authenticate(gw, conn, msg).await);
    }
    if !gw.is_authenticated(conn).await {
        return Some(ServerMessage::error(msg.id, "Not authenticated"));
    }
    match msg.kind {
        RequestType::Call => call(gw, conn, tx, msg).await,
        RequestType::Subscribe => Some(subscribe(gw, conn, msg).await),
        RequestType::Unsubscribe => Some(unsubscribe(gw, conn, msg).await),
        RequestType::Auth => None,
    }
}

async fn authenticate(gw: &GatewayState, conn: ConnectionId, msg: ClientMessage) -> ServerMessage {
    let pin = msg.pin.as_deref().unwrap_or_default();
    // Re-auth keeps the existing client id but still has to pass the PIN check.
    if gw.is_authenticated(conn).await {
        if gw.session.validate_pin(pin) {
            return ServerMessage::auth_success(msg.id);
        }
        warn!(conn, "Re-authentication failed");
        return ServerMessage::auth_failed(msg.id, &RemoteAccessError::Authentication.to_string());
    }
    match gw.session.authenticate(pin) {
        Ok(client_id) => {
            info!(conn, client_id = %short_id(&client_id), "Client authenticated");
            if let Some(c) = gw.connections.write().await.get_mut(&conn) {
                c.client_id = Some(client_id);
            }
            ServerMessage::auth_success(msg.id)
        }
        Err(e) => {
            warn!(conn, "Authentication failed");
            ServerMessage::auth_failed(msg.id, &e.to_string())
        }
    }
}

async fn call(
    gw: &GatewayState,
    conn: ConnectionId,
    tx: &Outbound,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    let id = msg.id;
    let Some(method) = msg.method else {
        return Some(ServerMessage::error(id, "Missing method"));
    };
    let params = msg.params.unwrap_or_else(|| json!({}));
    let procedure = match gw.router.resolve(&method) {
        Ok(p) => p,
        Err(e) => {
            debug!(conn, method = %method, "Call rejected: {e}");
            return Some(ServerMessage::error(id, e.to_string()));
        }
    };

    if procedure.is_stream() {
        let Some(stream_id) = procedure.stream_key(&params) else {
            return Some(ServerMessage::error(
                id,
                format!("{method} requires a stream identifier in params"),
            ));
        };
        return join_stream(gw, conn, tx, id, &method, stream_id, params).await;
    }

    // Calls run detached so a slow procedure does not stall this socket.
    let router = Arc::clone(&gw.router);
    let tx = tx.clone();
    tokio::spawn(async move {
        let reply = match router.invoke(&method, params).await {
            Ok(data) => ServerMessage::result(id, data),
            Err(e) => {
                debug!(method = %method, "Call failed: {e}");
                ServerMessage::error(id, e.to_string())
            }
        };
        if tx.try_send(reply).is_err() {
            debug!(method = %method, "Dropped call reply for a socket that stopped reading");
        }
    });
    None
}

async fn join_stream(
    gw: &GatewayState,
    conn: ConnectionId,
    tx: &Outbound,
    id: Option<String>,
    method: &str,
    stream_id: String,
    params: Value,
) -> Option<ServerMessage> {
    let subscriber = Arc::new(SocketSubscriber::new(id.clone(), tx.clone()));
    let ack = ServerMessage::result(id.clone(), json!({ "stream": stream_id }));
    let ack_tx = tx.clone();
    // The ack is queued under the registry lock so it precedes every event.
    let joined = gw
        .streams
        .join_socket(conn, &stream_id, method, params, subscriber, move || {
            let _ = ack_tx.try_send(ack);
        })
        .await;
    if let Err(e) = joined {
        return Some(ServerMessage::error(id, e.to_string()));
    }
    if let Some(c) = gw.connections.write().await.get_mut(&conn) {
        c.streams.insert(stream_id);
    }
    None
}

async fn subscribe(gw: &GatewayState, conn: ConnectionId, msg: ClientMessage) -> ServerMessage {
    let Some(channel) = msg.channel else {
        return ServerMessage::error(msg.id, "Missing channel");
    };
    if let Some(c) = gw.connections.write().await.get_mut(&conn) {
        c.channels.insert(channel.clone());
    }
    debug!(conn, channel = %channel, "Subscribed");
    ServerMessage::result(msg.id, json!({ "channel": channel }))
}

async fn unsubscribe(gw: &GatewayState, conn: ConnectionId, msg: ClientMessage) -> ServerMessage {
    let Some(channel) = msg.channel else {
        return ServerMessage::error(msg.id, "Missing channel");
    };
    let joined_stream = match gw.connections.write().await.get_mut(&conn) {
        Some(c) => {
            c.channels.remove(&channel);
            c.streams.remove(&channel)
        }
        None => false,
    };
    if joined_stream {
        gw.streams.leave_socket(conn, &channel).await;
    }
    debug!(conn, channel = %channel, "Unsubscribed");
    ServerMessage::result(msg.id, json!({ "channel": channel }))
}

/// Drop every trace of a closed connection.
async fn disconnect(gw: &GatewayState, conn: ConnectionId) {
    let removed = gw.connections.write().await.remove(&conn);
    if let Some(client_id) = removed.and_then(|c| c.client_id) {
        gw.session.remove_client(&client_id);
        info!(conn, client_id = %short_id(&client_id), "Client disconnected");
    } else {
        debug!(conn, "Socket closed before authenticating");
    }
    gw.streams.remove_connection(conn).await;
}
