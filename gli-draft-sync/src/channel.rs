//! Real-time collaboration channel.
//!
//! Connection lifecycle:
//! ```text
//! Disconnected ─► Connecting ─► Authenticated ─► RoomJoined ─► Synced
//!      ▲               auth/authenticated   join_room/room_joined   sync_response
//!      └──────────────── transport lost (from any state) ◄───────────┘
//! ```
//!
//! - Local edits are applied to the [`DraftStore`](gli_draft_core::DraftStore)
//!   first, then published as `contract_update` stamped with the sender's
//!   wall clock. While not joined they wait in the offline queue.
//! - Remote `contract_update` is last-writer-wins on that timestamp: it is
//!   applied only when newer than `last_sync_timestamp`.
//! - Transport loss schedules a reconnect with linearly growing delay, up
//!   to `max_reconnect_attempts`; after that only an explicit `connect`
//!   starts again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gli_draft_core::{Clock, ContractDraft, DraftError, DraftId, DraftPatch};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::duration_ms;
use crate::protocol::{
    CollaborationMessage, ControlMessage, Envelope, Frame, Participant, ProtocolError, TypingData,
};
use crate::schedule::{Debouncer, PeriodicTask, RetryPolicy};
use crate::transport::{Connection, Connector, TransportError};
use crate::SharedDraftStore;

const EVENT_BUFFER: usize = 256;

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticated,
    RoomJoined,
    Synced,
}

impl ChannelState {
    /// Whether collaboration messages flow in this state.
    pub fn is_joined(&self) -> bool {
        matches!(self, ChannelState::RoomJoined | ChannelState::Synced)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Bound on each handshake step.
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// How long a remote typing indicator stays visible.
    #[serde(rename = "typing_timeout_ms", with = "duration_ms")]
    pub typing_timeout: Duration,
    pub max_reconnect_attempts: u32,
    /// Reconnect `n` waits `reconnect_step * n`, capped at `reconnect_max_delay`.
    #[serde(rename = "reconnect_step_ms", with = "duration_ms")]
    pub reconnect_step: Duration,
    #[serde(rename = "reconnect_max_delay_ms", with = "duration_ms")]
    pub reconnect_max_delay: Duration,
    pub offline_queue_limit: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            handshake_timeout: Duration::from_secs(10),
            typing_timeout: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            reconnect_step: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(10),
            offline_queue_limit: 1000,
        }
    }
}

impl ChannelConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            max_reconnect_attempts: 3,
            reconnect_step: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_millis(500),
            offline_queue_limit: 100,
            ..Self::default()
        }
    }

    fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(
            self.max_reconnect_attempts,
            self.reconnect_step,
            self.reconnect_max_delay,
        )
    }
}

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    RemoteUpdateApplied {
        contract_id: DraftId,
        user_id: String,
        timestamp: i64,
    },
    /// A remote update was older than the last synced state.
    UpdateDiscarded {
        contract_id: DraftId,
        user_id: String,
        timestamp: i64,
        last_sync: i64,
    },
    ParticipantJoined(Participant),
    ParticipantLeft(Participant),
    Typing {
        participant: Participant,
        is_typing: bool,
    },
    Synced {
        contract_id: DraftId,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    ReconnectExhausted {
        attempts: u32,
    },
}

/// Outcome of [`CollaborationChannel::send_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Applied locally and waiting for the next join.
    Queued,
}

/// Collaboration view captured by recovery snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationState {
    pub connected: bool,
    pub participants: Vec<Participant>,
    pub last_sync_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub updates_sent: u64,
    pub updates_queued: u64,
    pub remote_applied: u64,
    pub remote_discarded: u64,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error("offline queue full ({0} updates)")]
    QueueFull(usize),
}

/// Updates made while not joined, replayed after the next join.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedUpdate {
    pub contract_id: DraftId,
    pub timestamp: i64,
    pub patch: DraftPatch,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update; `false` when full.
    pub fn enqueue(&mut self, update: QueuedUpdate) -> bool {
        if self.is_full() {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn drain(&mut self) -> Vec<QueuedUpdate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[derive(Debug, Clone)]
struct Session {
    contract_id: DraftId,
    token: String,
    user_name: String,
    /// Assigned by the server on `authenticated`.
    user_id: Option<String>,
}

impl Session {
    fn participant(&self) -> Participant {
        Participant::new(self.user_id.clone().unwrap_or_default(), self.user_name.clone())
    }
}

struct Link {
    outgoing: mpsc::Sender<String>,
    reader: JoinHandle<()>,
    _heartbeat: PeriodicTask,
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    drafts: SharedDraftStore,
    clock: Arc<dyn Clock>,

    state: RwLock<ChannelState>,
    session: RwLock<Option<Session>>,
    link: Mutex<Option<Link>>,
    /// Identifies the current link; a reader from a replaced link must not
    /// report its closure.
    epoch: AtomicU64,

    participants: RwLock<Vec<Participant>>,
    /// user_id → (participant, expiry in ms)
    typing: Mutex<HashMap<String, (Participant, i64)>>,
    last_sync: Mutex<Option<i64>>,
    offline_queue: Mutex<OfflineQueue>,

    reconnect: Debouncer,
    reconnect_attempts: AtomicU32,
    manual_disconnect: AtomicBool,

    event_tx: mpsc::Sender<ChannelEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<ChannelEvent>>>,

    updates_sent: AtomicU64,
    updates_queued: AtomicU64,
    remote_applied: AtomicU64,
    remote_discarded: AtomicU64,
}

/// Collaboration channel for one contract room at a time. Cheap to clone.
#[derive(Clone)]
pub struct CollaborationChannel {
    inner: Arc<Inner>,
}

impl CollaborationChannel {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        drafts: SharedDraftStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let offline_queue = OfflineQueue::new(config.offline_queue_limit);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                drafts,
                clock,
                state: RwLock::new(ChannelState::Disconnected),
                session: RwLock::new(None),
                link: Mutex::new(None),
                epoch: AtomicU64::new(0),
                participants: RwLock::new(Vec::new()),
                typing: Mutex::new(HashMap::new()),
                last_sync: Mutex::new(None),
                offline_queue: Mutex::new(offline_queue),
                reconnect: Debouncer::new(),
                reconnect_attempts: AtomicU32::new(0),
                manual_disconnect: AtomicBool::new(false),
                event_tx,
                event_rx: std::sync::Mutex::new(Some(event_rx)),
                updates_sent: AtomicU64::new(0),
                updates_queued: AtomicU64::new(0),
                remote_applied: AtomicU64::new(0),
                remote_discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Take the event receiver (only the first call gets it).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.inner
            .event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Authenticate, join the room for `contract_id` and request a sync.
    pub async fn connect(
        &self,
        contract_id: DraftId,
        token: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Result<(), ChannelError> {
        self.inner.manual_disconnect.store(false, Ordering::SeqCst);
        self.inner.reconnect.cancel();
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.inner.session.write().await = Some(Session {
            contract_id,
            token: token.into(),
            user_name: user_name.into(),
            user_id: None,
        });
        self.inner.establish().await
    }

    /// Leave the room and close the transport. No reconnect follows.
    pub async fn disconnect(&self) {
        self.inner.manual_disconnect.store(true, Ordering::SeqCst);
        self.inner.reconnect.cancel();
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);

        if let Some(link) = self.inner.detach_link().await {
            let session = self.inner.session.read().await.clone();
            if let Some(session) = session {
                let left = CollaborationMessage::UserLeft(Envelope::new(
                    session.contract_id,
                    &session.participant(),
                    self.inner.clock.now_millis(),
                    (),
                ));
                if let Ok(text) = Frame::from(left).encode() {
                    let _ = link.outgoing.send(text).await;
                }
            }
            link.reader.abort();
        }
        self.inner.participants.write().await.clear();
        self.inner.typing.lock().await.clear();
        *self.inner.session.write().await = None;
        self.inner.set_state(ChannelState::Disconnected).await;
        log::info!("Collaboration channel disconnected");
    }

    /// Apply `patch` locally and publish it, or queue it while offline.
    /// A rejected update leaves the draft untouched.
    pub async fn send_update(
        &self,
        contract_id: DraftId,
        patch: DraftPatch,
    ) -> Result<Delivery, ChannelError> {
        let timestamp = self.inner.clock.now_millis();
        let session = self.inner.session.read().await.clone();
        if let (true, Some(session)) = (self.state().await.is_joined(), session) {
            let previous = self.inner.apply_local(contract_id, &patch).await?;
            let msg = CollaborationMessage::ContractUpdate(Envelope::new(
                contract_id,
                &session.participant(),
                timestamp,
                patch.clone(),
            ));
            if self.inner.send(msg.into()).await.is_ok() {
                self.inner.advance_last_sync(timestamp).await;
                self.inner.updates_sent.fetch_add(1, Ordering::Relaxed);
                return Ok(Delivery::Sent);
            }

            // Link went away mid-send
            let mut queue = self.inner.offline_queue.lock().await;
            if !queue.enqueue(QueuedUpdate {
                contract_id,
                timestamp,
                patch,
            }) {
                let len = queue.len();
                drop(queue);
                self.inner.drafts.write().await.update(contract_id, previous)?;
                return Err(ChannelError::QueueFull(len));
            }
            drop(queue);
            return Ok(self.inner.queued(contract_id, timestamp).await);
        }

        let mut queue = self.inner.offline_queue.lock().await;
        if queue.is_full() {
            return Err(ChannelError::QueueFull(queue.len()));
        }
        self.inner.drafts.write().await.apply_patch(contract_id, &patch)?;
        queue.enqueue(QueuedUpdate {
            contract_id,
            timestamp,
            patch,
        });
        drop(queue);
        Ok(self.inner.queued(contract_id, timestamp).await)
    }

    /// Publish a typing indicator. Dropped silently when not joined.
    pub async fn send_typing(&self, contract_id: DraftId, is_typing: bool) {
        if !self.state().await.is_joined() {
            return;
        }
        let Some(session) = self.inner.session.read().await.clone() else {
            return;
        };
        let msg = CollaborationMessage::Typing(Envelope::new(
            contract_id,
            &session.participant(),
            self.inner.clock.now_millis(),
            TypingData { is_typing },
        ));
        if let Err(e) = self.inner.send(msg.into()).await {
            log::debug!("Typing indicator not sent: {e}");
        }
    }

    /// Ask the room for the full draft state.
    pub async fn request_sync(&self) -> Result<(), ChannelError> {
        let session = self
            .inner
            .session
            .read()
            .await
            .clone()
            .ok_or(ChannelError::Transport(TransportError::Closed))?;
        let msg = CollaborationMessage::SyncRequest(Envelope::new(
            session.contract_id,
            &session.participant(),
            self.inner.clock.now_millis(),
            (),
        ));
        self.inner.send(msg.into()).await
    }

    /// Treat the room as synced without waiting for a `sync_response`.
    pub async fn mark_synced(&self) {
        if *self.inner.state.read().await == ChannelState::RoomJoined {
            self.inner.set_state(ChannelState::Synced).await;
        }
    }

    pub async fn state(&self) -> ChannelState {
        *self.inner.state.read().await
    }

    pub async fn contract_id(&self) -> Option<DraftId> {
        self.inner.session.read().await.as_ref().map(|s| s.contract_id)
    }

    /// Our own identity once authenticated.
    pub async fn local_participant(&self) -> Option<Participant> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .filter(|s| s.user_id.is_some())
            .map(Session::participant)
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.inner.participants.read().await.clone()
    }

    pub async fn last_sync_timestamp(&self) -> Option<i64> {
        *self.inner.last_sync.lock().await
    }

    pub async fn collaboration_state(&self) -> CollaborationState {
        CollaborationState {
            connected: self.state().await.is_joined(),
            participants: self.participants().await,
            last_sync_timestamp: self.last_sync_timestamp().await,
        }
    }

    /// Remote users whose typing indicator has not expired.
    pub async fn typing_users(&self) -> Vec<Participant> {
        let now = self.inner.clock.now_millis();
        let mut typing = self.inner.typing.lock().await;
        typing.retain(|_, (_, expires)| *expires > now);
        let mut users: Vec<Participant> = typing.values().map(|(p, _)| p.clone()).collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.inner.offline_queue.lock().await.len()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            updates_sent: self.inner.updates_sent.load(Ordering::Relaxed),
            updates_queued: self.inner.updates_queued.load(Ordering::Relaxed),
            remote_applied: self.inner.remote_applied.load(Ordering::Relaxed),
            remote_discarded: self.inner.remote_discarded.load(Ordering::Relaxed),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::SeqCst),
        }
    }
}

impl Inner {
    fn emit(&self, event: ChannelEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::debug!("Channel event dropped: {e}");
        }
    }

    async fn set_state(&self, next: ChannelState) {
        let mut state = self.state.write().await;
        if *state != next {
            log::debug!("Channel state {:?} -> {:?}", *state, next);
            *state = next;
            drop(state);
            self.emit(ChannelEvent::StateChanged(next));
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let text = frame.encode()?;
        let outgoing = self
            .link
            .lock()
            .await
            .as_ref()
            .map(|l| l.outgoing.clone())
            .ok_or(TransportError::Closed)?;
        outgoing.send(text).await.map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    /// Apply a local patch, returning the draft as it was before.
    async fn apply_local(
        &self,
        contract_id: DraftId,
        patch: &DraftPatch,
    ) -> Result<ContractDraft, DraftError> {
        let mut drafts = self.drafts.write().await;
        let previous = drafts
            .get_by_id(contract_id)
            .cloned()
            .ok_or(DraftError::NotFound(contract_id))?;
        drafts.apply_patch(contract_id, patch)?;
        Ok(previous)
    }

    async fn queued(&self, contract_id: DraftId, timestamp: i64) -> Delivery {
        self.advance_last_sync(timestamp).await;
        self.updates_queued.fetch_add(1, Ordering::Relaxed);
        let waiting = self.offline_queue.lock().await.len();
        log::debug!("Queued update for {contract_id} ({waiting} waiting)");
        Delivery::Queued
    }

    async fn detach_link(&self) -> Option<Link> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.link.lock().await.take()
    }

    async fn advance_last_sync(&self, timestamp: i64) {
        let mut last = self.last_sync.lock().await;
        if last.map_or(true, |ls| timestamp > ls) {
            *last = Some(timestamp);
        }
    }

    /// Open the transport, run the handshake and start the link tasks.
    async fn establish(self: &Arc<Self>) -> Result<(), ChannelError> {
        if let Some(old) = self.detach_link().await {
            old.reader.abort();
        }
        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or(ChannelError::Handshake("no session".into()))?;

        self.set_state(ChannelState::Connecting).await;
        let result = self.handshake(&session).await;
        let (conn, participants) = match result {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Connecting to room {} failed: {e}", session.contract_id);
                self.set_state(ChannelState::Disconnected).await;
                return Err(e);
            }
        };

        *self.participants.write().await = participants;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ChannelState::RoomJoined).await;

        // Hold the slot while the tasks start so the reader cannot observe
        // a missing link.
        let Connection { outgoing, mut incoming } = conn;
        let mut link = self.link.lock().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = {
            let inner = self.clone();
            tokio::spawn(async move {
                while let Some(text) = incoming.recv().await {
                    match Frame::decode(&text) {
                        Ok(frame) => inner.handle_frame(frame).await,
                        Err(e) => log::warn!("Ignoring undecodable frame: {e}"),
                    }
                }
                inner.on_transport_lost(epoch).await;
            })
        };
        let heartbeat = {
            let outgoing = outgoing.clone();
            let clock = self.clock.clone();
            PeriodicTask::spawn(self.config.heartbeat_interval, move || {
                let outgoing = outgoing.clone();
                let timestamp = clock.now_millis();
                async move {
                    if let Ok(text) = Frame::from(ControlMessage::Heartbeat { timestamp }).encode() {
                        let _ = outgoing.send(text).await;
                    }
                }
            })
        };
        *link = Some(Link {
            outgoing,
            reader,
            _heartbeat: heartbeat,
        });
        drop(link);

        let me = self
            .session
            .read()
            .await
            .as_ref()
            .map(Session::participant)
            .unwrap_or_else(|| session.participant());
        log::info!("Joined room {} as {}", session.contract_id, me.user_id);

        self.replay_offline_queue().await;
        let request = CollaborationMessage::SyncRequest(Envelope::new(
            session.contract_id,
            &me,
            self.clock.now_millis(),
            (),
        ));
        self.send(request.into()).await
    }

    async fn handshake(
        &self,
        session: &Session,
    ) -> Result<(Connection, Vec<Participant>), ChannelError> {
        let mut conn = self.connector.connect(session.contract_id).await?;
        let timeout = self.config.handshake_timeout;

        send_on(
            &conn,
            ControlMessage::Auth {
                token: session.token.clone(),
                user_name: session.user_name.clone(),
            },
        )
        .await?;
        let user_id = await_control(&mut conn, timeout, "authenticated", |msg| match msg {
            ControlMessage::Authenticated { user_id } => Some(Ok(user_id)),
            ControlMessage::AuthError { reason } => Some(Err(ChannelError::AuthRejected(reason))),
            _ => None,
        })
        .await?;
        if let Some(s) = self.session.write().await.as_mut() {
            s.user_id = Some(user_id);
        }
        self.set_state(ChannelState::Authenticated).await;

        send_on(
            &conn,
            ControlMessage::JoinRoom {
                contract_id: session.contract_id,
            },
        )
        .await?;
        let participants = await_control(&mut conn, timeout, "room_joined", |msg| match msg {
            ControlMessage::RoomJoined { participants, .. } => Some(Ok(participants)),
            ControlMessage::AuthError { reason } => Some(Err(ChannelError::AuthRejected(reason))),
            _ => None,
        })
        .await?;
        Ok((conn, participants))
    }

    async fn replay_offline_queue(&self) {
        let queued = self.offline_queue.lock().await.drain();
        if queued.is_empty() {
            return;
        }
        let Some(me) = self.session.read().await.as_ref().map(Session::participant) else {
            return;
        };
        log::info!("Replaying {} queued updates", queued.len());
        for update in queued {
            let msg = CollaborationMessage::ContractUpdate(Envelope::new(
                update.contract_id,
                &me,
                update.timestamp,
                update.patch,
            ));
            match self.send(msg.into()).await {
                Ok(()) => {
                    self.updates_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::warn!("Replay of queued update failed: {e}"),
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        let msg = match frame {
            Frame::Collaboration(msg) => msg,
            Frame::Control(ControlMessage::Heartbeat { .. }) => return,
            Frame::Control(other) => {
                log::debug!("Ignoring control message after join: {other:?}");
                return;
            }
        };
        let Some(session) = self.session.read().await.clone() else {
            return;
        };
        if msg.contract_id() != session.contract_id {
            log::debug!("Ignoring {} for other room {}", msg.kind(), msg.contract_id());
            return;
        }
        if session.user_id.as_deref() == Some(msg.user_id()) {
            return;
        }

        match msg {
            CollaborationMessage::ContractUpdate(envelope) => self.apply_remote_update(envelope).await,
            CollaborationMessage::UserJoined(envelope) => {
                let participant = envelope.sender();
                let mut participants = self.participants.write().await;
                if !participants.iter().any(|p| p.user_id == participant.user_id) {
                    participants.push(participant.clone());
                }
                drop(participants);
                log::info!("{} joined room {}", participant.user_name, session.contract_id);
                self.emit(ChannelEvent::ParticipantJoined(participant));
            }
            CollaborationMessage::UserLeft(envelope) => {
                let participant = envelope.sender();
                self.participants
                    .write()
                    .await
                    .retain(|p| p.user_id != participant.user_id);
                self.typing.lock().await.remove(&participant.user_id);
                log::info!("{} left room {}", participant.user_name, session.contract_id);
                self.emit(ChannelEvent::ParticipantLeft(participant));
            }
            CollaborationMessage::Typing(envelope) => {
                let participant = envelope.sender();
                let is_typing = envelope.data.is_typing;
                let mut typing = self.typing.lock().await;
                if is_typing {
                    let expires =
                        self.clock.now_millis() + self.config.typing_timeout.as_millis() as i64;
                    typing.insert(participant.user_id.clone(), (participant.clone(), expires));
                } else {
                    typing.remove(&participant.user_id);
                }
                drop(typing);
                self.emit(ChannelEvent::Typing {
                    participant,
                    is_typing,
                });
            }
            CollaborationMessage::SyncRequest(_) => {
                let draft = self.drafts.read().await.get_by_id(session.contract_id).cloned();
                let response = CollaborationMessage::SyncResponse(Envelope::new(
                    session.contract_id,
                    &session.participant(),
                    self.clock.now_millis(),
                    draft,
                ));
                if let Err(e) = self.send(response.into()).await {
                    log::warn!("Could not answer sync request: {e}");
                }
            }
            CollaborationMessage::SyncResponse(envelope) => self.apply_sync_response(envelope).await,
        }
    }

    async fn apply_remote_update(&self, envelope: Envelope<DraftPatch>) {
        let mut last = self.last_sync.lock().await;
        if let Some(last_sync) = *last {
            if envelope.timestamp <= last_sync {
                log::debug!(
                    "Discarding stale update from {} ({} <= {last_sync})",
                    envelope.user_id,
                    envelope.timestamp
                );
                self.remote_discarded.fetch_add(1, Ordering::Relaxed);
                self.emit(ChannelEvent::UpdateDiscarded {
                    contract_id: envelope.contract_id,
                    user_id: envelope.user_id,
                    timestamp: envelope.timestamp,
                    last_sync,
                });
                return;
            }
        }
        let applied = self
            .drafts
            .write()
            .await
            .apply_patch(envelope.contract_id, &envelope.data);
        match applied {
            Ok(_) => {
                *last = Some(envelope.timestamp);
                self.remote_applied.fetch_add(1, Ordering::Relaxed);
                self.emit(ChannelEvent::RemoteUpdateApplied {
                    contract_id: envelope.contract_id,
                    user_id: envelope.user_id,
                    timestamp: envelope.timestamp,
                });
            }
            Err(e) => log::warn!("Remote update from {} not applied: {e}", envelope.user_id),
        }
    }

    async fn apply_sync_response(&self, envelope: Envelope<Option<ContractDraft>>) {
        if let Some(draft) = envelope.data {
            let mut last = self.last_sync.lock().await;
            let newer = last.map_or(true, |ls| envelope.timestamp > ls);
            if newer && draft.id == envelope.contract_id {
                let mut drafts = self.drafts.write().await;
                let result = if drafts.get_by_id(draft.id).is_some() {
                    drafts.update(draft.id, draft).map(|_| ())
                } else {
                    drafts.insert_restored(draft);
                    Ok(())
                };
                match result {
                    Ok(()) => *last = Some(envelope.timestamp),
                    Err(e) => log::warn!("Sync response not applied: {e}"),
                }
            }
        }
        if *self.state.read().await == ChannelState::RoomJoined {
            self.set_state(ChannelState::Synced).await;
            self.emit(ChannelEvent::Synced {
                contract_id: envelope.contract_id,
            });
        }
    }

    async fn on_transport_lost(self: &Arc<Self>, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        self.link.lock().await.take();
        self.participants.write().await.clear();
        self.typing.lock().await.clear();
        self.set_state(ChannelState::Disconnected).await;
        if self.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }
        log::warn!("Collaboration transport lost");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let policy = self.config.reconnect_policy();
        let attempt = self.reconnect_attempts.load(Ordering::SeqCst) + 1;
        if !policy.allows_retry(attempt) {
            log::error!("Giving up reconnecting after {} attempts", attempt - 1);
            self.emit(ChannelEvent::ReconnectExhausted {
                attempts: attempt - 1,
            });
            return;
        }
        self.reconnect_attempts.store(attempt, Ordering::SeqCst);
        let delay = policy.delay_for_retry(attempt);
        log::info!("Reconnect attempt {attempt} in {delay:?}");
        self.emit(ChannelEvent::ReconnectScheduled { attempt, delay });

        let inner = self.clone();
        self.reconnect.arm(delay, move || async move {
            if inner.manual_disconnect.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = inner.establish().await {
                log::warn!("Reconnect attempt {attempt} failed: {e}");
                inner.schedule_reconnect();
            }
        });
    }
}

async fn send_on(conn: &Connection, msg: ControlMessage) -> Result<(), ChannelError> {
    let text = Frame::from(msg).encode()?;
    conn.outgoing
        .send(text)
        .await
        .map_err(|_| ChannelError::Transport(TransportError::Closed))
}

/// Read frames until `pick` accepts a control message or the step times out.
async fn await_control<T>(
    conn: &mut Connection,
    timeout: Duration,
    waiting_for: &str,
    mut pick: impl FnMut(ControlMessage) -> Option<Result<T, ChannelError>>,
) -> Result<T, ChannelError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let text = match tokio::time::timeout_at(deadline, conn.incoming.recv()).await {
            Err(_) => {
                return Err(ChannelError::Handshake(format!(
                    "timed out waiting for {waiting_for}"
                )))
            }
            Ok(None) => return Err(ChannelError::Transport(TransportError::Closed)),
            Ok(Some(text)) => text,
        };
        match Frame::decode(&text) {
            Ok(Frame::Control(msg)) => {
                if let Some(result) = pick(msg) {
                    return result;
                }
            }
            Ok(Frame::Collaboration(msg)) => {
                log::debug!("Dropping {} received before join", msg.kind());
            }
            Err(e) => log::warn!("Ignoring undecodable frame: {e}"),
        }
    }
}
