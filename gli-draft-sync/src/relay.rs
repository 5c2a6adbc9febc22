//! WebSocket relay with room-based fan-out.
//!
//! ```text
//! Client A ──┐                       ┌──► Client B
//!             ├── Room (contract_id) ─┤
//! Client C ──┘    broadcast channel   └──► Client C
//! ```
//!
//! The relay holds no draft state. It authenticates (any non-empty token),
//! answers `join_room` with the member list, announces `user_joined` /
//! `user_left`, and forwards collaboration messages to every other member
//! of the room. Heartbeats are swallowed.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use gli_draft_core::DraftId;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{CollaborationMessage, ControlMessage, Envelope, Frame, Participant};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Messages buffered per member before it starts lagging.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 4,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// A frame fanned out to a room, tagged with the connection that sent it.
#[derive(Debug)]
struct RoomFrame {
    from: u64,
    text: String,
}

struct Room {
    sender: broadcast::Sender<Arc<RoomFrame>>,
    members: HashMap<u64, Participant>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: HashMap::new(),
        }
    }

    fn publish(&self, from: u64, text: String) {
        // No receivers just means the room is momentarily empty.
        let _ = self.sender.send(Arc::new(RoomFrame { from, text }));
    }
}

type Rooms = Arc<RwLock<HashMap<DraftId, Room>>>;

pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
    next_connection: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Relay shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let connection = Connection {
                        id: self.next_connection.fetch_add(1, Ordering::SeqCst),
                        addr,
                        rooms: self.rooms.clone(),
                        stats: self.stats.clone(),
                        config: self.config.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = connection.handle(stream).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }
}

struct Connection {
    id: u64,
    addr: SocketAddr,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
    config: RelayConfig,
}

/// What a connection has established so far.
#[derive(Default)]
struct Membership {
    member: Option<Participant>,
    room_id: Option<DraftId>,
}

impl Connection {
    async fn handle(self, stream: TcpStream) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership = Membership::default();
        let result = self.pump(ws_stream, &mut membership).await;

        if let (Some(contract_id), Some(me)) = (membership.room_id, membership.member) {
            self.leave(contract_id, me).await;
        }
        self.stats.write().await.active_connections -= 1;
        result
    }

    /// Serve one client until it closes, fails or is refused.
    async fn pump(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        membership: &mut Membership,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut room_rx: Option<broadcast::Receiver<Arc<RoomFrame>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => continue,
                    };
                    self.stats.write().await.total_messages += 1;

                    let frame = match Frame::decode(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Bad frame from {}: {e}", self.addr);
                            continue;
                        }
                    };
                    match frame {
                        Frame::Control(ControlMessage::Auth { token, user_name }) => {
                            if token.trim().is_empty() {
                                send(&mut ws_sender, ControlMessage::AuthError {
                                    reason: "missing token".into(),
                                }).await?;
                                return Ok(());
                            }
                            let user_id = uuid::Uuid::new_v4().to_string();
                            membership.member = Some(Participant::new(user_id.clone(), user_name));
                            send(&mut ws_sender, ControlMessage::Authenticated { user_id }).await?;
                        }
                        Frame::Control(ControlMessage::JoinRoom { contract_id }) => {
                            let Some(me) = membership.member.clone() else {
                                send(&mut ws_sender, ControlMessage::AuthError {
                                    reason: "join before auth".into(),
                                }).await?;
                                return Ok(());
                            };
                            if membership.room_id.is_some() {
                                log::debug!("Ignoring second join from {}", self.addr);
                                continue;
                            }
                            let Some((rx, participants)) = self.join(contract_id, me).await else {
                                send(&mut ws_sender, ControlMessage::AuthError {
                                    reason: "room full".into(),
                                }).await?;
                                return Ok(());
                            };
                            room_rx = Some(rx);
                            membership.room_id = Some(contract_id);
                            send(&mut ws_sender, ControlMessage::RoomJoined {
                                contract_id,
                                participants,
                            }).await?;
                        }
                        Frame::Control(ControlMessage::Heartbeat { .. }) => {}
                        Frame::Control(other) => {
                            log::debug!("Unexpected control message from {}: {other:?}", self.addr);
                        }
                        Frame::Collaboration(msg) => {
                            if membership.room_id != Some(msg.contract_id()) {
                                log::debug!("Dropping {} outside joined room", msg.kind());
                                continue;
                            }
                            if let Some(room) = self.rooms.read().await.get(&msg.contract_id()) {
                                room.publish(self.id, text);
                            }
                        }
                    }
                }

                frame = async {
                    match room_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            // Skip echo to sender
                            if frame.from != self.id {
                                ws_sender.send(Message::Text(frame.text.clone().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {} lagged by {n} messages", self.id);
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Add `me` to the room; `None` when it is full.
    async fn join(
        &self,
        contract_id: DraftId,
        me: Participant,
    ) -> Option<(broadcast::Receiver<Arc<RoomFrame>>, Vec<Participant>)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(contract_id)
            .or_insert_with(|| Room::new(self.config.broadcast_capacity));
        if room.members.len() >= self.config.max_peers_per_room {
            return None;
        }
        let rx = room.sender.subscribe();
        room.members.insert(self.id, me.clone());
        let mut participants: Vec<Participant> = room.members.values().cloned().collect();
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let joined = CollaborationMessage::UserJoined(Envelope::new(
            contract_id,
            &me,
            chrono::Utc::now().timestamp_millis(),
            (),
        ));
        if let Ok(text) = Frame::from(joined).encode() {
            room.publish(self.id, text);
        }
        let active_rooms = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = active_rooms;
        log::info!("{} ({}) joined room {contract_id}", me.user_name, me.user_id);
        Some((rx, participants))
    }

    async fn leave(&self, contract_id: DraftId, me: Participant) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(&contract_id) {
            room.members.remove(&self.id);
            let left = CollaborationMessage::UserLeft(Envelope::new(
                contract_id,
                &me,
                chrono::Utc::now().timestamp_millis(),
                (),
            ));
            if let Ok(text) = Frame::from(left).encode() {
                room.publish(self.id, text);
            }
            if room.members.is_empty() {
                rooms.remove(&contract_id);
                log::info!("Room {contract_id} removed (empty)");
            }
        }
        let active_rooms = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = active_rooms;
    }
}

async fn send<S>(sink: &mut S, msg: ControlMessage) -> Result<(), BoxError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = Frame::from(msg).encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::new(RelayConfig::for_testing());
        assert_eq!(relay.stats().await, RelayStats::default());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let relay = RelayServer::new(RelayConfig::for_testing());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        relay.serve(listener, async {}).await.unwrap();
    }

    #[test]
    fn test_room_publish_without_members_is_harmless() {
        let room = Room::new(4);
        room.publish(1, "{}".into());
        assert!(room.members.is_empty());
    }
}
