//! WebSocket sync client.
//!
//! Provides:
//! - Connection and handshake against a [`SyncServer`](crate::server::SyncServer)
//! - A local [`ReplicatedDocument`] kept in sync with the server's replica
//! - Presence publishing and a view of peers' presence
//! - An event stream for the application
//!
//! Edits made while the connection is down stay in the local replica; a new
//! connection's state-vector exchange carries them over.

use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::awareness::{AwarenessEntry, AwarenessEvent, AwarenessUpdate, PresenceRecord, PresenceView};
use crate::document::{Mutation, ReplicatedDocument};
use crate::error::{CollabError, Result};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::server::USER_ID_HEADER;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, waiting for the server's state
    Syncing,
    /// Local replica has caught up with the server
    Synced,
    Disconnected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Initial state received from the server
    Synced,
    /// A remote change was merged into the local replica
    RemoteUpdate { origin: Uuid },
    /// A peer's presence changed
    PeerState { peer_id: Uuid, record: PresenceRecord },
    /// A peer left or cleared its presence
    PeerRemoved { peer_id: Uuid },
    /// Connection lost
    Disconnected,
}

impl From<AwarenessEvent> for SyncEvent {
    fn from(event: AwarenessEvent) -> Self {
        match event {
            AwarenessEvent::PeerState { peer_id, record } => Self::PeerState { peer_id, record },
            AwarenessEvent::PeerRemoved { peer_id } => Self::PeerRemoved { peer_id },
        }
    }
}

/// Join a base URL such as `ws://host:1234/notes` with a document name.
pub fn document_url(server_url: &str, name: &str) -> String {
    format!("{}/{}", server_url.trim_end_matches('/'), name)
}

/// The sync client.
pub struct SyncClient {
    info: PeerInfo,
    document: Arc<ReplicatedDocument>,
    presence: Arc<Mutex<PresenceView>>,
    state_rx: watch::Receiver<ConnectionState>,
    outgoing_tx: mpsc::Sender<Message>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    presence_clock: AtomicU64,
}

impl SyncClient {
    /// Connect anonymously to document `name` under `server_url`.
    pub async fn connect(server_url: &str, name: &str) -> Result<Self> {
        Self::connect_as(server_url, name, None).await
    }

    /// Connect, identifying as `user_id` when given.
    ///
    /// Returns once the server has greeted the session; the document
    /// handshake continues in the background (see [`SyncClient::wait_synced`]).
    pub async fn connect_as(server_url: &str, name: &str, user_id: Option<&str>) -> Result<Self> {
        let mut request = document_url(server_url, name).into_client_request()?;
        if let Some(user) = user_id {
            let value = HeaderValue::from_str(user)
                .map_err(|e| tungstenite::Error::HttpFormat(e.into()))?;
            request.headers_mut().insert(USER_ID_HEADER, value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let info = read_welcome(&mut ws_reader).await?;
        log::info!("Joined '{name}' as session {}", info.session_id);

        let document = Arc::new(ReplicatedDocument::new(name));
        let mut view = PresenceView::new();
        view.set_local_id(info.session_id);
        let presence = Arc::new(Mutex::new(view));

        let (state_tx, state_rx) = watch::channel(ConnectionState::Syncing);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let (event_tx, event_rx) = mpsc::channel(256);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let client = Self {
            info,
            document: document.clone(),
            presence: presence.clone(),
            state_rx,
            outgoing_tx: outgoing_tx.clone(),
            event_rx: Some(event_rx),
            presence_clock: AtomicU64::new(0),
        };
        client
            .send(SyncMessage::sync_step1(client.id(), document.state_vector()))
            .await?;

        let reader = ClientReader {
            local_id: client.id(),
            document,
            presence,
            outgoing_tx,
            event_tx,
            state_tx,
        };
        tokio::spawn(reader.run(ws_reader));

        Ok(client)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Wait until the initial state has arrived.
    pub async fn wait_synced(&self) -> Result<()> {
        let mut state_rx = self.state_rx.clone();
        let state = *state_rx
            .wait_for(|state| *state != ConnectionState::Syncing)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        match state {
            ConnectionState::Synced => Ok(()),
            _ => Err(ProtocolError::ConnectionClosed.into()),
        }
    }

    /// Apply a local edit and send it to the server. Returns the update.
    ///
    /// The edit lands in the local replica even if sending fails.
    pub async fn apply_local_change(&self, mutation: &Mutation) -> Result<Vec<u8>> {
        let update = self.document.apply_local_change(mutation);
        self.send(SyncMessage::update(self.id(), update.clone())).await?;
        Ok(update)
    }

    /// Publish (or with `None`, clear) this session's presence.
    pub async fn set_presence(&self, record: Option<PresenceRecord>) -> Result<()> {
        let clock = self.presence_clock.fetch_add(1, Ordering::Relaxed) + 1;
        let update = AwarenessUpdate::single(AwarenessEntry {
            client_id: self.id(),
            clock,
            state: record,
        });
        self.send(SyncMessage::awareness(self.id(), &update)?).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(SyncMessage::ping(self.id())).await
    }

    /// Close the connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.outgoing_tx
            .send(Message::Close(None))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed.into())
    }

    /// Send a raw frame, bypassing the local replica.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<()> {
        self.outgoing_tx
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed.into())
    }

    async fn send(&self, msg: SyncMessage) -> Result<()> {
        self.send_raw(msg.encode()?).await
    }

    pub fn id(&self) -> Uuid {
        self.info.session_id
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.document
    }

    pub fn content(&self) -> String {
        self.document.content()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<PresenceRecord> {
        self.presence.lock().peer(peer_id).cloned()
    }

    pub fn peer_ids(&self) -> Vec<Uuid> {
        self.presence.lock().peer_ids()
    }
}

/// First frame from the server must be the session's greeting.
async fn read_welcome<R>(ws_reader: &mut R) -> Result<PeerInfo>
where
    R: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match ws_reader.next().await {
            Some(Ok(Message::Binary(data))) => {
                return Ok(SyncMessage::decode(&data)?.peer_info()?);
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ProtocolError::ConnectionClosed.into());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Background task applying server traffic to the local replica.
struct ClientReader {
    local_id: Uuid,
    document: Arc<ReplicatedDocument>,
    presence: Arc<Mutex<PresenceView>>,
    outgoing_tx: mpsc::Sender<Message>,
    event_tx: mpsc::Sender<SyncEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ClientReader {
    async fn run<R>(self, mut ws_reader: R)
    where
        R: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(Message::Binary(data)) => {
                    if let Err(e) = self.handle(&data).await {
                        log::warn!("Session {}: ignoring server frame: {e}", self.local_id);
                    }
                }
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        log::info!(
                            "Server closed session {}: {} {}",
                            self.local_id,
                            u16::from(frame.code),
                            frame.reason.as_str()
                        );
                    }
                    break;
                }
                Err(e) => {
                    log::debug!("Session {} socket error: {e}", self.local_id);
                    break;
                }
                Ok(_) => {}
            }
        }

        // Connection lost
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.emit(SyncEvent::Disconnected);
    }

    async fn handle(&self, data: &[u8]) -> Result<()> {
        let msg = SyncMessage::decode(data)?;
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = self.document.encode_state_as_update(&msg.payload)?;
                self.reply(SyncMessage::sync_step2(self.local_id, diff)).await?;
            }
            MessageType::SyncStep2 => {
                self.document.apply_remote_update(&msg.payload)?;
                let was_syncing = self.state_tx.send_replace(ConnectionState::Synced)
                    == ConnectionState::Syncing;
                if was_syncing {
                    self.emit(SyncEvent::Synced);
                }
            }
            MessageType::Update => {
                self.document.apply_remote_update(&msg.payload)?;
                self.emit(SyncEvent::RemoteUpdate { origin: msg.origin });
            }
            MessageType::Awareness => {
                let update = msg.awareness_update()?;
                let events = self.presence.lock().apply(&update);
                for event in events {
                    self.emit(event.into());
                }
            }
            MessageType::Ping => self.reply(SyncMessage::pong(self.local_id)).await?,
            MessageType::Pong | MessageType::Welcome => {}
        }
        Ok(())
    }

    async fn reply(&self, msg: SyncMessage) -> Result<()> {
        self.outgoing_tx
            .send(Message::Binary(msg.encode()?.into()))
            .await
            .map_err(|_| CollabError::from(ProtocolError::ConnectionClosed))
    }

    /// Events are dropped rather than stalling the reader when nobody drains them.
    fn emit(&self, event: SyncEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::trace!("Session {}: event dropped", self.local_id);
        }
    }
}
