//! WebSocket transport and client session handling.
//!
//! Implements the realtime crate's `Transport` trait over tokio-tungstenite:
//! outgoing sinks live in a concurrent map keyed by connection id, and each
//! accepted socket gets a session task that registers with the registry,
//! replays pending messages and pumps inbound frames through activity and
//! rate-limit bookkeeping.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use realtime::{
    ConnectionId, ConnectionRegistry, PlayerId, RoomId, SessionId, Transport, TransportError,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, Message>;
type WsReceiver = SplitStream<WsStream>;

/// How long a new socket gets to send its hello frame.
const HELLO_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// First frame a client sends after the upgrade.
#[derive(Debug, Deserialize)]
struct HelloMessage {
    #[serde(default)]
    player_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Any frame after the hello.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    action: String,
    #[serde(default)]
    room: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// WebSocket-backed implementation of the realtime `Transport` trait.
pub struct WsTransport {
    sinks: DashMap<ConnectionId, WsSink>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            sinks: DashMap::new(),
        }
    }

    fn register(&self, connection_id: ConnectionId, sink: WsSink) {
        self.sinks.insert(connection_id, sink);
    }

    fn deregister(&self, connection_id: ConnectionId) {
        self.sinks.remove(&connection_id);
    }

    async fn pong(&self, connection_id: ConnectionId, data: tokio_tungstenite::tungstenite::Bytes) {
        if let Some(mut sink) = self.sinks.get_mut(&connection_id) {
            let _ = sink.value_mut().send(Message::Pong(data)).await;
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(
        &self,
        connection_id: ConnectionId,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let text = payload.to_string();
        match self.sinks.get_mut(&connection_id) {
            Some(mut sink) => sink
                .value_mut()
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| TransportError::SendFailed {
                    connection_id,
                    reason: e.to_string(),
                }),
            None => Err(TransportError::Closed(connection_id)),
        }
    }

    async fn is_open(&self, connection_id: ConnectionId) -> bool {
        self.sinks.contains_key(&connection_id)
    }

    async fn close(&self, connection_id: ConnectionId, code: u16, reason: &str) {
        if let Some((_, mut sink)) = self.sinks.remove(&connection_id) {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
        }
    }
}

/// Accepts sockets until shutdown, spawning a session task per client.
pub async fn run_accept_loop(
    listener: TcpListener,
    transport: Arc<WsTransport>,
    registry: Arc<ConnectionRegistry>,
    max_connections: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("Accepting connections (cap {})", max_connections);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        if registry.connection_count().await >= max_connections {
                            warn!("Connection cap reached; refusing {}", addr);
                            continue;
                        }
                        let transport = transport.clone();
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            handle_session(stream, addr, transport, registry).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Accept loop stopping");
                break;
            }
        }
    }
}

/// Full lifecycle of one client socket.
async fn handle_session(
    stream: TcpStream,
    addr: SocketAddr,
    transport: Arc<WsTransport>,
    registry: Arc<ConnectionRegistry>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    let (ws_sink, mut ws_receiver) = ws_stream.split();

    let Some(hello) = read_hello(&mut ws_receiver).await else {
        debug!("No hello from {}; dropping socket", addr);
        return;
    };

    let player_id = hello
        .player_id
        .as_deref()
        .and_then(|s| PlayerId::from_str(s).ok())
        .unwrap_or_default();
    let session_id = SessionId::new();

    let connection_id = match registry
        .register_connection(player_id, session_id, hello.token)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!("Registration refused for {} from {}: {}", player_id, addr, e);
            return;
        }
    };
    transport.register(connection_id, ws_sink);
    info!("Player {} connected from {} on {}", player_id, addr, connection_id);

    let welcome = json!({
        "type": "welcome",
        "player_id": player_id,
        "session_id": session_id,
    });
    let _ = transport.send(connection_id, &welcome).await;
    registry.flush_pending(player_id).await;

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                registry.record_activity(connection_id).await;
                if !registry.check_message_rate(connection_id).await {
                    let _ = transport
                        .send(
                            connection_id,
                            &json!({
                                "type": "error",
                                "error_type": "rate_limited",
                                "message": "Message rate limit exceeded",
                            }),
                        )
                        .await;
                    continue;
                }
                handle_client_message(&text, player_id, connection_id, &transport, &registry)
                    .await;
            }
            Ok(Message::Ping(data)) => {
                registry.record_activity(connection_id).await;
                transport.pong(connection_id, data).await;
            }
            Ok(Message::Pong(_)) => {
                registry.record_activity(connection_id).await;
            }
            Ok(Message::Close(_)) => {
                debug!("Connection {} requested close", connection_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    transport.deregister(connection_id);
    registry.disconnect(connection_id, "client disconnected").await;
    info!("Player {} from {} disconnected", player_id, addr);
}

async fn read_hello(receiver: &mut WsReceiver) -> Option<HelloMessage> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, receiver.next())
        .await
        .ok()??;
    match frame {
        Ok(Message::Text(text)) => serde_json::from_str(&text).ok(),
        _ => None,
    }
}

/// Routes one parsed client frame to the registry surface it targets.
///
/// Command parsing proper (movement, combat, emotes) belongs to the game
/// front end; the realtime binary handles only the presence and chat
/// plumbing.
async fn handle_client_message(
    raw: &str,
    player_id: PlayerId,
    connection_id: ConnectionId,
    transport: &Arc<WsTransport>,
    registry: &Arc<ConnectionRegistry>,
) {
    let message: ClientMessage = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(e) => {
            debug!("Unparsable frame from {}: {}", connection_id, e);
            let _ = transport
                .send(
                    connection_id,
                    &json!({
                        "type": "error",
                        "error_type": "bad_message",
                        "message": "Expected a JSON object with an 'action' field",
                    }),
                )
                .await;
            return;
        }
    };

    match (message.action.as_str(), message.room) {
        ("say", Some(room)) => {
            let room = RoomId::new(room);
            let event = json!({
                "type": "say",
                "from": player_id,
                "room": room,
                "text": message.text.unwrap_or_default(),
            });
            registry.broadcast_to_room(&room, &event, Some(player_id)).await;
        }
        ("join", Some(room)) => {
            let room = RoomId::new(room);
            registry.subscribe_room(player_id, &room).await;
            registry.enter_room(player_id, &room).await;
            let event = json!({"type": "joined", "player": player_id, "room": room});
            registry.broadcast_to_room(&room, &event, Some(player_id)).await;
        }
        ("leave", Some(room)) => {
            let room = RoomId::new(room);
            registry.unsubscribe_room(player_id, &room).await;
            registry.leave_room(player_id, &room).await;
        }
        ("ping", _) => {
            let _ = transport
                .send(connection_id, &json!({"type": "pong"}))
                .await;
        }
        (action, _) => {
            debug!("Unroutable action '{}' from {}", action, connection_id);
            let _ = transport
                .send(
                    connection_id,
                    &json!({
                        "type": "error",
                        "error_type": "unknown_action",
                        "message": format!("Unknown or incomplete action '{}'", action),
                    }),
                )
                .await;
        }
    }
}
