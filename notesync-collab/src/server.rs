//! Transport Adapter: WebSocket server routing connections to documents.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/notes/doc-A
//!             ├── upgrade ── parse name ── Session ── DocumentRegistry
//! Client B ──┘                                 │            │
//!                                              │      DocumentEntry
//!                                              │      ├── ReplicatedDocument
//!                                              │      ├── BroadcastGroup
//!                                              │      └── AwarenessStates
//!                                              ▼
//!                               select! { socket | relay | idle timer }
//! ```
//!
//! Each connection gets exactly one [`Session`]. The upgrade is refused
//! with HTTP 400 when the path does not name a document. Malformed frames
//! close the socket with code 1002; abrupt disconnects are a normal close.

use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Relayed;
use crate::config::ServerConfig;
use crate::error::{CollabError, Result};
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};
use crate::registry::{DocumentRegistry, RegistryConfig};
use crate::session::Session;
use crate::store::DocumentStore;

/// Request header carrying the caller's identity.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity used when the request carries none.
pub const ANONYMOUS: &str = "anonymous";

/// Stand-in deadline for timeouts too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
}

#[derive(Default)]
struct ServerCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl ServerCounters {
    fn opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn received(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// The sync server. Cheap to clone; clones share the registry and stats.
#[derive(Clone)]
pub struct SyncServer {
    config: Arc<ServerConfig>,
    registry: DocumentRegistry,
    counters: Arc<ServerCounters>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = DocumentRegistry::new(RegistryConfig::from(&config));
        Self::build(config, registry)
    }

    /// Server whose registry seeds from and saves to `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let registry = DocumentRegistry::with_store(RegistryConfig::from(&config), store);
        Self::build(config, registry)
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    fn build(config: ServerConfig, registry: DocumentRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            counters: Arc::new(ServerCounters::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_documents: self.registry.document_count().await,
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Sync server listening on {} (prefix {})",
            self.config.bind_addr,
            self.config.path_prefix
        );
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut target: Option<(String, String)> = None;
        let prefix = self.config.path_prefix.as_str();
        let callback = |request: &Request, response: Response| {
            match parse_document_name(request.uri().path(), prefix) {
                Some(name) => {
                    target = Some((name, user_id_from(request)));
                    Ok(response)
                }
                None => Err(bad_request(CollabError::MissingDocumentName.to_string())),
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                if target.is_none() {
                    self.counters.rejected();
                    log::warn!("Rejected connection from {addr}: {}", CollabError::MissingDocumentName);
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        let Some((name, user_id)) = target else {
            return Err(CollabError::MissingDocumentName);
        };

        self.counters.opened();
        log::info!("WebSocket connection from {addr} ({user_id}) for '{name}'");
        let result = self.run_session(ws, &name, user_id).await;
        self.counters.closed();
        result
    }

    async fn run_session(
        &self,
        ws: WebSocketStream<TcpStream>,
        name: &str,
        user_id: String,
    ) -> Result<()> {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let info = PeerInfo::new(Uuid::new_v4(), user_id);

        let (entry, relay_rx) = match self.registry.join(name, info.clone()).await {
            Ok(joined) => joined,
            Err(e) => {
                let code = match e {
                    CollabError::DocumentFull { .. } => CloseCode::Again,
                    _ => CloseCode::Error,
                };
                let _ = send_close(&mut ws_sender, code, &e.to_string()).await;
                return Err(e);
            }
        };

        let mut session = Session::new(info, entry);
        let result = self
            .drive(&mut session, &mut ws_sender, &mut ws_receiver, relay_rx)
            .await;

        if let Err(e) = session.close() {
            log::warn!("Session {} did not close cleanly: {e}", session.id());
        }
        self.registry.detach(name, &session.id()).await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_protocol_violation() => {
                log::warn!("Closing session {} on '{name}': {e}", session.id());
                let _ = send_close(&mut ws_sender, CloseCode::Protocol, &e.to_string()).await;
                Ok(())
            }
            Err(CollabError::Transport(e)) => {
                log::debug!("Session {} transport closed: {e}", session.id());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn drive<S, R>(
        &self,
        session: &mut Session,
        ws_sender: &mut S,
        ws_receiver: &mut R,
        mut relay_rx: tokio::sync::broadcast::Receiver<Relayed>,
    ) -> Result<()>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
    {
        for msg in session.start()? {
            send_message(ws_sender, &msg).await?;
        }

        let idle_timeout = self.config.idle_timeout();
        loop {
            let deadline = idle_deadline(session.last_activity(), idle_timeout);
            let outgoing = tokio::select! {
                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        self.counters.received(data.len());
                        let msg = SyncMessage::decode(&data)?;
                        session.handle_incoming(msg)?
                    }
                    Some(Ok(Message::Ping(data))) => {
                        session.touch();
                        ws_sender.send(Message::Pong(data)).await?;
                        Vec::new()
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                        session.touch();
                        Vec::new()
                    }
                    Some(Ok(Message::Text(_))) => {
                        return Err(ProtocolError::InvalidMessageType.into());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Session {} closed by peer", session.id());
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        log::debug!("Session {} socket error: {e}", session.id());
                        return Ok(());
                    }
                },

                relayed = relay_rx.recv() => match relayed {
                    Ok(msg) => session.handle_relay(msg)?,
                    Err(RecvError::Lagged(skipped)) => session.resync(skipped)?,
                    Err(RecvError::Closed) => return Ok(()),
                },

                _ = tokio::time::sleep_until(deadline) => {
                    if session.is_idle(idle_timeout) {
                        log::info!("Session {} idle for {idle_timeout:?}, closing", session.id());
                        return Ok(());
                    }
                    Vec::new()
                }
            };

            for msg in outgoing {
                send_message(ws_sender, &msg).await?;
            }
        }
    }
}

/// Extract the document name from an upgrade path.
///
/// The name is everything after `prefix`, minus any query string or
/// fragment and trailing slashes. Returns `None` when nothing is left.
pub fn parse_document_name(path: &str, prefix: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let rest = path.strip_prefix(prefix)?;
    let name = rest.trim_end_matches('/');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// When a session last active at `last_activity` times out. Saturates to a
/// far-future instant rather than overflowing.
fn idle_deadline(last_activity: std::time::Instant, timeout: Duration) -> tokio::time::Instant {
    match last_activity.checked_add(timeout) {
        Some(deadline) => tokio::time::Instant::from_std(deadline),
        None => tokio::time::Instant::now() + FAR_FUTURE,
    }
}

fn user_id_from(request: &Request) -> String {
    request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

async fn send_message<S>(sink: &mut S, msg: &SyncMessage) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

async fn send_close<S>(sink: &mut S, code: CloseCode, reason: &str) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    sink.send(Message::Close(Some(frame))).await?;
    Ok(())
}
