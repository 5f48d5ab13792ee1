//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - [`ConnectionMachine`]: reconnect policy as an explicit state machine
//! - [`ClientDocument`]: local replica fed by server messages
//! - [`SyncClient`]: tokio-tungstenite driver tying the two together

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use coedit_core::{CrdtEngine, EngineError, EngineKind};

use crate::protocol::{
    ClientMessage, ErrorPayload, HandshakeParams, ProtocolError, ServerMessage,
    CLOSE_POLICY_VIOLATION,
};
use crate::session::{CursorPosition, User, DEFAULT_LANGUAGE};

// ───────────────────────────────────────────────────────────────────
// Connection state machine
// ───────────────────────────────────────────────────────────────────

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The socket opened.
    Opened,
    /// The socket closed or could not be opened. `code` is the close code
    /// sent by the server, if any.
    Closed { code: Option<u16> },
    /// A scheduled retry is due.
    RetryDue,
    /// The application asked to disconnect for good.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The server refused the connection on policy grounds (document limit).
    PolicyViolation,
    RetriesExhausted,
}

/// What the driver should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Nothing,
    Connected,
    Retry { attempt: u32, delay: Duration },
    Reconnect,
    GiveUp(GiveUpReason),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
    shutdown: bool,
}

impl ConnectionMachine {
    /// Starts in `Connecting`: the first attempt is already under way.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Connecting,
            attempt: 0,
            policy,
            shutdown: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries scheduled since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn on_event(&mut self, event: ConnectionEvent) -> Transition {
        use ConnectionState::*;

        if self.shutdown || self.state == Failed {
            return Transition::Stopped;
        }

        match (self.state, event) {
            (_, ConnectionEvent::Shutdown) => {
                self.shutdown = true;
                self.state = Disconnected;
                Transition::Stopped
            }
            (Connecting, ConnectionEvent::Opened) => {
                self.state = Connected;
                self.attempt = 0;
                Transition::Connected
            }
            (Connecting | Connected, ConnectionEvent::Closed { code }) => {
                if code == Some(CLOSE_POLICY_VIOLATION) {
                    self.state = Failed;
                    return Transition::GiveUp(GiveUpReason::PolicyViolation);
                }
                if self.attempt >= self.policy.max_retries {
                    self.state = Failed;
                    return Transition::GiveUp(GiveUpReason::RetriesExhausted);
                }
                let delay = self.policy.delay_for(self.attempt);
                self.attempt += 1;
                self.state = Disconnected;
                Transition::Retry {
                    attempt: self.attempt,
                    delay,
                }
            }
            (Disconnected, ConnectionEvent::RetryDue) => {
                self.state = Connecting;
                Transition::Reconnect
            }
            _ => Transition::Nothing,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Local replica
// ───────────────────────────────────────────────────────────────────

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected { retry_in: Option<Duration> },
    Failed(GiveUpReason),
    /// A fresh replica was built from `init`.
    Initialized { text: String, engine: EngineKind },
    RemoteInsert { index: usize, value: Option<char> },
    RemoteDelete { index: usize },
    UserJoined(User),
    UserLeft(String),
    UserRenamed(User),
    CursorMoved { user_id: String, cursor: CursorPosition },
    LanguageChanged(String),
    ServerError(ErrorPayload),
}

/// Site id for a new replica. Two replicas never share one, even when they
/// belong to the same user.
pub fn random_site_id() -> String {
    Uuid::new_v4().to_string()
}

/// Per-client replica of one document.
///
/// Until `init` arrives there is nothing to apply operations to, so every
/// other message is buffered and replayed in arrival order afterwards.
pub struct ClientDocument {
    site_id: String,
    engine: Option<Box<dyn CrdtEngine>>,
    users: HashMap<String, User>,
    language: String,
    pending: Vec<ServerMessage>,
}

impl ClientDocument {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            engine: None,
            users: HashMap::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            pending: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    /// Forget the replica; the next connection starts from a new `init`
    /// under a new site id.
    pub fn reset(&mut self) {
        self.site_id = random_site_id();
        self.engine = None;
        self.users.clear();
        self.pending.clear();
    }

    pub fn handle(&mut self, msg: ServerMessage) -> Result<Vec<ClientEvent>, EngineError> {
        let mut events = Vec::new();
        match msg {
            ServerMessage::Init {
                payload,
                users,
                language,
                crdt_engine,
            } => {
                let mut engine = crdt_engine.create(&self.site_id);
                engine.restore(&payload)?;
                events.push(ClientEvent::Initialized {
                    text: engine.to_text(),
                    engine: crdt_engine,
                });
                self.engine = Some(engine);
                self.users = users.into_iter().map(|u| (u.id.clone(), u)).collect();
                self.language = language;

                let pending = std::mem::take(&mut self.pending);
                if !pending.is_empty() {
                    log::debug!("Replaying {} messages buffered before init", pending.len());
                }
                for msg in pending {
                    events.extend(self.apply(msg));
                }
            }
            // Errors can arrive before init and must not wait for it.
            ServerMessage::Error { payload } => events.push(ClientEvent::ServerError(payload)),
            other if !self.is_initialized() => self.pending.push(other),
            other => events.extend(self.apply(other)),
        }
        Ok(events)
    }

    fn apply(&mut self, msg: ServerMessage) -> Option<ClientEvent> {
        match msg {
            ServerMessage::CrdtInsert { payload } => {
                let applied = self.engine.as_mut()?.remote_insert(&payload)?;
                Some(ClientEvent::RemoteInsert {
                    index: applied.visible_index,
                    value: applied.value,
                })
            }
            ServerMessage::CrdtDelete { payload } => {
                let applied = self.engine.as_mut()?.remote_delete(&payload)?;
                Some(ClientEvent::RemoteDelete {
                    index: applied.visible_index,
                })
            }
            ServerMessage::UserJoin { payload } => {
                self.users.insert(payload.id.clone(), payload.clone());
                Some(ClientEvent::UserJoined(payload))
            }
            ServerMessage::UserLeave { payload } => {
                self.users.remove(&payload.id);
                Some(ClientEvent::UserLeft(payload.id))
            }
            ServerMessage::UserRename { payload } => {
                self.users.insert(payload.id.clone(), payload.clone());
                Some(ClientEvent::UserRenamed(payload))
            }
            ServerMessage::CursorUpdate { payload } => {
                if let Some(user) = self.users.get_mut(&payload.user_id) {
                    user.cursor = Some(payload.cursor);
                }
                Some(ClientEvent::CursorMoved {
                    user_id: payload.user_id,
                    cursor: payload.cursor,
                })
            }
            ServerMessage::LanguageChange { payload } => {
                self.language = payload.language.clone();
                Some(ClientEvent::LanguageChanged(payload.language))
            }
            ServerMessage::Error { payload } => Some(ClientEvent::ServerError(payload)),
            ServerMessage::Init { .. } => None,
        }
    }

    /// Insert locally. Returns the message to send, or `None` before init
    /// or once the replica's clock is exhausted.
    pub fn insert(&mut self, value: char, index: usize) -> Option<ClientMessage> {
        let edit = self.engine.as_mut()?.local_insert(value, index)?;
        Some(ClientMessage::insert(edit.op))
    }

    /// Delete locally. `None` before init or when `index` is out of range.
    pub fn delete(&mut self, index: usize) -> Option<ClientMessage> {
        let edit = self.engine.as_mut()?.local_delete(index)?;
        Some(ClientMessage::delete(edit.op))
    }

    pub fn text(&self) -> String {
        self.engine.as_ref().map(|e| e.to_text()).unwrap_or_default()
    }

    pub fn engine_kind(&self) -> Option<EngineKind> {
        self.engine.as_ref().map(|e| e.kind())
    }

    pub fn users(&self) -> Vec<User> {
        self.users.values().cloned().collect()
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

enum SocketEnd {
    Closed(Option<u16>),
    Shutdown,
}

/// Handle to a running client connection.
///
/// Created by [`SyncClient::spawn`]; the connection task runs until
/// [`SyncClient::shutdown`] or until the reconnect policy gives up.
pub struct SyncClient {
    params: HandshakeParams,
    document: Arc<Mutex<ClientDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<ClientMessage>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to `server_url` (e.g. `ws://127.0.0.1:3000/ws`) and keep the
    /// connection alive according to `policy`.
    pub fn spawn(
        server_url: impl Into<String>,
        params: HandshakeParams,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let document = Arc::new(Mutex::new(ClientDocument::new(random_site_id())));
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let url = format!("{}?{}", server_url.into(), params.to_query());

        let task = tokio::spawn(drive(
            url,
            ConnectionMachine::new(policy),
            document.clone(),
            state.clone(),
            outgoing_rx,
            event_tx,
            shutdown_rx,
        ));

        let client = Self {
            params,
            document,
            state,
            outgoing_tx,
            shutdown_tx,
            task,
        };
        (client, event_rx)
    }

    pub async fn insert(&self, value: char, index: usize) -> Result<(), ProtocolError> {
        let msg = self.document.lock().await.insert(value, index);
        self.send(msg.ok_or(ProtocolError::ConnectionClosed)?).await
    }

    /// Delete the character at `index`. Out-of-range deletes are ignored.
    pub async fn delete(&self, index: usize) -> Result<(), ProtocolError> {
        let mut document = self.document.lock().await;
        if !document.is_initialized() {
            return Err(ProtocolError::ConnectionClosed);
        }
        match document.delete(index) {
            Some(msg) => {
                drop(document);
                self.send(msg).await
            }
            None => Ok(()),
        }
    }

    pub async fn rename(&self, name: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::rename(name)).await
    }

    pub async fn move_cursor(&self, line_number: u32, column: u32) -> Result<(), ProtocolError> {
        self.send(ClientMessage::cursor(line_number, column)).await
    }

    pub async fn set_language(&self, language: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::language(language)).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outgoing_tx
            .send(msg)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn text(&self) -> String {
        self.document.lock().await.text()
    }

    pub async fn users(&self) -> Vec<User> {
        self.document.lock().await.users()
    }

    pub async fn language(&self) -> String {
        self.document.lock().await.language().to_string()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn params(&self) -> &HandshakeParams {
        &self.params
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn drive(
    url: String,
    mut machine: ConnectionMachine,
    document: Arc<Mutex<ClientDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    mut outgoing_rx: mpsc::Receiver<ClientMessage>,
    event_tx: mpsc::Sender<ClientEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        *state.write().await = machine.state();

        let end = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                machine.on_event(ConnectionEvent::Opened);
                *state.write().await = machine.state();
                let _ = event_tx.send(ClientEvent::Connected).await;
                log::info!("Connected to {url}");

                // Anything queued against the previous replica is stale.
                while outgoing_rx.try_recv().is_ok() {}

                let end = run_socket(ws, &document, &mut outgoing_rx, &event_tx, &mut shutdown_rx).await;
                document.lock().await.reset();
                end
            }
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                SocketEnd::Closed(None)
            }
        };

        let event = match end {
            SocketEnd::Shutdown => ConnectionEvent::Shutdown,
            SocketEnd::Closed(code) => ConnectionEvent::Closed { code },
        };

        match machine.on_event(event) {
            Transition::Retry { attempt, delay } => {
                *state.write().await = machine.state();
                log::info!("Connection lost, retry {attempt} in {delay:?}");
                let _ = event_tx
                    .send(ClientEvent::Disconnected {
                        retry_in: Some(delay),
                    })
                    .await;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        machine.on_event(ConnectionEvent::Shutdown);
                        break;
                    }
                }
                machine.on_event(ConnectionEvent::RetryDue);
            }
            Transition::GiveUp(reason) => {
                log::warn!("Giving up on {url}: {reason:?}");
                let _ = event_tx.send(ClientEvent::Failed(reason)).await;
                break;
            }
            _ => {
                let _ = event_tx.send(ClientEvent::Disconnected { retry_in: None }).await;
                break;
            }
        }
    }
    *state.write().await = machine.state();
}

async fn run_socket<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    document: &Mutex<ClientDocument>,
    outgoing_rx: &mut mpsc::Receiver<ClientMessage>,
    event_tx: &mpsc::Sender<ClientEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SocketEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_writer, mut ws_reader) = ws.split();

    loop {
        tokio::select! {
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let msg = match ServerMessage::decode(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Ignoring malformed server message: {e}");
                                continue;
                            }
                        };
                        let events = document.lock().await.handle(msg);
                        match events {
                            Ok(events) => {
                                for event in events {
                                    let _ = event_tx.send(event).await;
                                }
                            }
                            Err(e) => log::error!("Failed to apply init snapshot: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SocketEnd::Closed(frame.map(|f| u16::from(f.code)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return SocketEnd::Closed(None);
                    }
                    None => return SocketEnd::Closed(None),
                }
            }

            outgoing = outgoing_rx.recv() => {
                let Some(msg) = outgoing else {
                    return SocketEnd::Shutdown;
                };
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode {}: {e}", msg.kind());
                        continue;
                    }
                };
                if let Err(e) = ws_writer.send(Message::text(text)).await {
                    log::warn!("Failed to send {}: {e}", msg.kind());
                    return SocketEnd::Closed(None);
                }
            }

            _ = shutdown_rx.changed() => {
                let _ = ws_writer
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client shutdown".to_string().into(),
                    })))
                    .await;
                return SocketEnd::Shutdown;
            }
        }
    }
}
