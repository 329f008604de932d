use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use skiff_proto::{ClientMessage, PeerInfo, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectionId, Outbound};
use crate::RelayState;

/// Per-socket view of the registry: which id, if any, this socket joined as.
struct Connection {
    id: ConnectionId,
    joined_as: Option<String>,
    tx: mpsc::UnboundedSender<Outbound>,
    remote_addr: SocketAddr,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: RelayState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let mut conn = Connection {
        id: state.registry.next_connection_id(),
        joined_as: None,
        tx,
        remote_addr,
    };
    debug!(remote = %remote_addr, "websocket connected");

    // The writer ends on Close or on a socket error; either way the reader stops too.
    let mut writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let frame = match item {
                Outbound::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => Message::Text(json),
                    Err(err) => {
                        error!(error = %err, "failed to encode server message");
                        continue;
                    }
                },
                Outbound::Ping => Message::Ping(Vec::new()),
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = &mut writer => break,
        };
        let Some(frame) = frame else { break };
        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                debug!(remote = %conn.remote_addr, error = %e, "websocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => handle_text(&text, &mut conn, &state),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_text(&text, &mut conn, &state),
                Err(_) => debug!(remote = %conn.remote_addr, "ignoring non-UTF8 binary frame"),
            },
            Message::Pong(_) => {
                if let Some(id) = conn.joined_as.as_deref() {
                    state.registry.mark_alive(id, conn.id);
                }
            }
            Message::Close(_) => {
                debug!(remote = %conn.remote_addr, "received close frame");
                break;
            }
            Message::Ping(_) => {}
        }
    }

    writer.abort();
    if let Some(id) = conn.joined_as.take() {
        state.registry.leave(&id, conn.id);
    }
    debug!(remote = %remote_addr, "websocket disconnected");
}

fn handle_text(text: &str, conn: &mut Connection, state: &RelayState) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(remote = %conn.remote_addr, error = %e, "dropping unparseable client message");
            return;
        }
    };

    match message {
        ClientMessage::Join { sender, device } => {
            if let Some(existing) = conn.joined_as.as_deref() {
                warn!(joined_as = existing, requested = %sender, "ignoring second join on one connection");
                return;
            }
            if sender.is_empty() {
                warn!(remote = %conn.remote_addr, "ignoring join without sender id");
                return;
            }
            let info = PeerInfo {
                id: sender.clone(),
                model: device.model,
                class: device.class,
            };
            match state.registry.join(conn.id, info, conn.tx.clone()) {
                Ok(_) => {
                    info!(peer_id = %sender, remote = %conn.remote_addr, "join accepted");
                    conn.joined_as = Some(sender);
                }
                Err(err) => {
                    let _ = conn.tx.send(Outbound::Message(ServerMessage::Error {
                        message: err.to_string(),
                    }));
                    let _ = conn.tx.send(Outbound::Close);
                }
            }
        }
        ClientMessage::Signal { to, data } => match conn.joined_as.as_deref() {
            Some(sender) => {
                state.registry.relay(sender, &to, data);
            }
            None => warn!(remote = %conn.remote_addr, target = %to, "dropping signal before join"),
        },
        ClientMessage::Ping => {
            if let Some(id) = conn.joined_as.as_deref() {
                state.registry.mark_alive(id, conn.id);
            }
            let _ = conn.tx.send(Outbound::Message(ServerMessage::Pong));
        }
        ClientMessage::Pong => {
            if let Some(id) = conn.joined_as.as_deref() {
                state.registry.mark_alive(id, conn.id);
            }
        }
    }
}
