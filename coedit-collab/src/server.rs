//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── DocumentSession (engine, roster)
//!             ├── handshake ── room ──┤
//! Client B ──┘   ?docId&userId        └── BroadcastGroup
//!                                             │
//!                                  ┌──────────┼───────────┐
//!                                  ▼          ▼           ▼
//!                               Client A   Client B    Client C
//! ```
//!
//! Every message touching a document is handled while holding that
//! document's session lock, and its fan-out is sent before the lock is
//! released, so every subscriber sees the room in processing order.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame, RoomManager};
use crate::config::CollabConfig;
use crate::protocol::{ClientMessage, HandshakeParams, ProtocolError, ServerMessage};
use crate::registry::{DocumentRegistry, RegistryError};
use crate::session::{SharedSession, User};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub total_messages: u64,
    pub dropped_inserts: u64,
}

/// One joined WebSocket connection.
struct Connection {
    conn_id: Uuid,
    addr: SocketAddr,
    params: HandshakeParams,
    session: SharedSession,
    room: Arc<BroadcastGroup>,
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: CollabConfig,
    registry: Arc<DocumentRegistry>,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: CollabConfig) -> Self {
        let registry = Arc::new(DocumentRegistry::new(&config));
        Self::with_registry(config, registry)
    }

    /// Serve documents from an existing registry.
    pub fn with_registry(config: CollabConfig, registry: Arc<DocumentRegistry>) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            registry,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "Sync server listening on {} ({} engine)",
            listener.local_addr()?,
            self.config.engine
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single connection from upgrade to cleanup.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let mut params = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match HandshakeParams::from_query(req.uri().query().unwrap_or_default()) {
                Ok(p) => {
                    params = Some(p);
                    Ok(resp)
                }
                Err(e) => {
                    log::warn!("Refusing upgrade from {addr}: {e}");
                    Err(bad_request(e.to_string()))
                }
            }
        })
        .await;

        let ws_stream = match ws_stream {
            Ok(ws) => ws,
            Err(e) => {
                self.stats.write().await.refused_connections += 1;
                return Err(e.into());
            }
        };
        let Some(params) = params else {
            return Ok(());
        };
        let (mut sink, mut stream) = ws_stream.split();

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self.serve_socket(&mut sink, &mut stream, addr, params).await;

        self.stats.write().await.active_connections -= 1;
        result
    }

    async fn serve_socket(
        &self,
        sink: &mut WsSink,
        stream: &mut WsStream,
        addr: SocketAddr,
        params: HandshakeParams,
    ) -> Result<(), ServerError> {
        let session = match self.registry.get_or_create(&params.doc_id).await {
            Ok(session) => session,
            Err(RegistryError::DocumentLimit { max }) => {
                self.stats.write().await.refused_connections += 1;
                let refusal = ServerMessage::document_limit(max).encode()?;
                sink.send(Message::text(refusal)).await?;
                sink.send(close_frame(CloseCode::Policy, "Document limit reached")).await?;
                return Ok(());
            }
        };

        let conn_id = Uuid::new_v4();
        let (conn, mut rx, init) = match self.join(conn_id, addr, params, session).await {
            Ok(joined) => joined,
            Err(e) => {
                log::error!("Failed to set up connection from {addr}: {e}");
                sink.send(close_frame(CloseCode::Error, "Internal error")).await?;
                return Ok(());
            }
        };

        let result = match sink.send(Message::text(init)).await {
            Ok(()) => self.pump(&conn, sink, stream, &mut rx).await,
            Err(e) => Err(e.into()),
        };

        self.leave(&conn).await;
        result
    }

    /// Subscribe, add the user, capture init state and announce the join in
    /// one critical section. Undoes its changes on failure.
    async fn join(
        &self,
        conn_id: Uuid,
        addr: SocketAddr,
        params: HandshakeParams,
        session: SharedSession,
    ) -> Result<(Connection, broadcast::Receiver<Frame>, String), ProtocolError> {
        let mut guard = session.lock().await;
        let room = self.rooms.get_or_create(&params.doc_id).await;
        let rx = room.add_peer(conn_id).await;

        let user = User::new(&params.user_id, &params.username);
        guard.add_user(user.clone());

        let announced = ServerMessage::init(guard.init_state())
            .encode()
            .and_then(|init| room.broadcast(Some(conn_id), &ServerMessage::user_join(user)).map(|_| init));

        let init = match announced {
            Ok(init) => init,
            Err(e) => {
                guard.remove_user(&params.user_id);
                room.remove_peer(&conn_id).await;
                self.rooms.remove_if_empty(&params.doc_id).await;
                return Err(e);
            }
        };

        log::info!(
            "User {} ({}) joined document {} from {addr}, {} online",
            params.username,
            params.user_id,
            params.doc_id,
            guard.user_count()
        );
        drop(guard);

        let conn = Connection {
            conn_id,
            addr,
            params,
            session,
            room,
        };
        Ok((conn, rx, init))
    }

    /// Relay between the socket and the room until either side closes.
    async fn pump(
        &self,
        conn: &Connection,
        sink: &mut WsSink,
        stream: &mut WsStream,
        rx: &mut broadcast::Receiver<Frame>,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.write().await.total_messages += 1;
                            self.dispatch(conn, text.as_str()).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {}", conn.addr);
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {}: {e}", conn.addr);
                            break;
                        }
                        Some(Ok(_)) => {
                            log::warn!("Ignoring non-text frame from {}", conn.addr);
                        }
                    }
                }

                // Outgoing room traffic
                frame = rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.is_from(&conn.conn_id) {
                                continue;
                            }
                            sink.send(Message::text(frame.text.to_string())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Skipped operations cannot be replayed; the client
                            // reconnects and starts over from a fresh init.
                            log::warn!(
                                "Connection {} in document {} lagged by {n} messages, closing",
                                conn.conn_id,
                                conn.params.doc_id
                            );
                            sink.send(close_frame(CloseCode::Error, "Fell behind document updates"))
                                .await?;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one client message to the session and fan out the result.
    async fn dispatch(&self, conn: &Connection, text: &str) {
        let msg = match ClientMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Ignoring malformed message from {}: {e}", conn.params.user_id);
                return;
            }
        };
        let user_id = conn.params.user_id.as_str();
        let doc_id = conn.params.doc_id.as_str();

        let mut session = conn.session.lock().await;
        session.touch();

        let outgoing = match msg {
            ClientMessage::CrdtInsert { payload } => {
                if !self.registry.admits_insert(&session, &payload) {
                    log::warn!("Document {doc_id} is at its size limit, dropping insert from {user_id}");
                    self.stats.write().await.dropped_inserts += 1;
                    return;
                }
                let applied = session.engine_mut().remote_insert(&payload);
                log::debug!("crdt-insert from {user_id} in {doc_id}: {applied:?}");
                conn.room.broadcast_raw(Some(conn.conn_id), Arc::from(text));
                return;
            }
            ClientMessage::CrdtDelete { payload } => {
                let applied = session.engine_mut().remote_delete(&payload);
                log::debug!("crdt-delete from {user_id} in {doc_id}: {applied:?}");
                conn.room.broadcast_raw(Some(conn.conn_id), Arc::from(text));
                return;
            }
            ClientMessage::ClientRename { payload } => match session.rename_user(user_id, payload.name) {
                Some(user) => {
                    log::debug!("User {user_id} renamed to {} in {doc_id}", user.name);
                    // The sender hears its own rename too.
                    (None, ServerMessage::user_rename(user))
                }
                None => return,
            },
            ClientMessage::ClientCursor { payload } => {
                if !session.update_cursor(user_id, payload) {
                    return;
                }
                log::trace!("Cursor of {user_id} at {}:{}", payload.line_number, payload.column);
                (Some(conn.conn_id), ServerMessage::cursor_update(user_id, payload))
            }
            ClientMessage::ClientLanguage { payload } => {
                log::debug!("Language of {doc_id} set to {} by {user_id}", payload.language);
                session.set_language(payload.language.clone());
                (Some(conn.conn_id), ServerMessage::language_change(payload.language))
            }
        };

        let (origin, msg) = outgoing;
        if let Err(e) = conn.room.broadcast(origin, &msg) {
            log::error!("Failed to broadcast to document {doc_id}: {e}");
        }
    }

    /// Remove the user, announce the departure and drop an empty room.
    async fn leave(&self, conn: &Connection) {
        let mut session = conn.session.lock().await;
        if session.remove_user(&conn.params.user_id).is_some() {
            let _ = conn
                .room
                .broadcast(Some(conn.conn_id), &ServerMessage::user_leave(&conn.params.user_id));
        }
        conn.room.remove_peer(&conn.conn_id).await;
        if self.rooms.remove_if_empty(&conn.params.doc_id).await {
            log::debug!("Room {} removed (empty)", conn.params.doc_id);
        }
        log::info!(
            "User {} left document {}, {} online",
            conn.params.user_id,
            conn.params.doc_id,
            session.user_count()
        );
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

fn close_frame(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coedit_core::EngineKind;

    #[test]
    fn test_server_creation() {
        let server = SyncServer::new(CollabConfig::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:3000");
        assert_eq!(server.registry().engine(), EngineKind::Custom);
    }

    #[tokio::test]
    async fn test_server_shares_registry() {
        let registry = Arc::new(DocumentRegistry::new(&CollabConfig::default()));
        let server = SyncServer::with_registry(CollabConfig::default(), registry.clone());

        registry.get_or_create("doc").await.unwrap();
        assert_eq!(server.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(CollabConfig::default());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(server.room_manager().room_count().await, 0);
    }

    #[test]
    fn test_bad_request_response() {
        let response = bad_request("missing query parameter 'docId'".to_string());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.body().as_deref().unwrap().contains("docId"));
    }

    #[test]
    fn test_close_frame_codes() {
        match close_frame(CloseCode::Policy, "Document limit reached") {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), crate::protocol::CLOSE_POLICY_VIOLATION);
            }
            other => panic!("unexpected {other:?}"),
        }
        match close_frame(CloseCode::Error, "Internal error") {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), crate::protocol::CLOSE_INTERNAL_ERROR);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
