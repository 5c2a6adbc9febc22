//! Real-time transports for the collaboration channel.
//!
//! A [`Connector`] opens a text-frame duplex for one contract room and hands
//! it back as a pair of channels. The channel never touches sockets
//! directly, so the same state machine runs over WebSocket in production and
//! over in-process channels in tests.
//!
//! A closed `incoming` receiver means the transport failed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use gli_draft_core::DraftId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ControlMessage, Frame, Participant};

const FRAME_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// An open duplex of text frames.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, contract_id: DraftId) -> Result<Connection, TransportError>;
}

/// WebSocket transport; each room is reached at `{server_url}/{contract_id}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, contract_id: DraftId) -> Result<Connection, TransportError> {
        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), contract_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            // Sender dropped: orderly close
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: forward WebSocket text frames to the incoming channel
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::debug!("WebSocket reader for {url} finished");
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// In-process transport. Every successful `connect` produces a
/// [`MemoryPeer`] (the server end of the connection) on the accept queue.
#[derive(Debug)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    online: AtomicBool,
    attempts: AtomicU32,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (accepted, accept_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted,
            online: AtomicBool::new(true),
            attempts: AtomicU32::new(0),
        });
        (connector, accept_rx)
    }

    /// While offline every connect attempt is refused.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Connect attempts made so far, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, contract_id: DraftId) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("network unreachable".into()));
        }
        let (client_tx, server_rx) = mpsc::channel(FRAME_BUFFER);
        let (server_tx, client_rx) = mpsc::channel(FRAME_BUFFER);
        self.accepted
            .send(MemoryPeer {
                contract_id,
                incoming: server_rx,
                outgoing: server_tx,
            })
            .map_err(|_| TransportError::Connect("no listener".into()))?;
        Ok(Connection {
            outgoing: client_tx,
            incoming: client_rx,
        })
    }
}

/// Server end of an in-process connection. Dropping it closes the
/// connection from the client's point of view.
#[derive(Debug)]
pub struct MemoryPeer {
    pub contract_id: DraftId,
    pub incoming: mpsc::Receiver<String>,
    pub outgoing: mpsc::Sender<String>,
}

impl MemoryPeer {
    /// Next decodable frame from the client; `None` once it hangs up.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        while let Some(text) = self.incoming.recv().await {
            match Frame::decode(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => log::warn!("Dropping undecodable frame: {e}"),
            }
        }
        None
    }

    /// Next frame that is not a heartbeat.
    pub async fn recv_non_heartbeat(&mut self) -> Option<Frame> {
        loop {
            match self.recv_frame().await? {
                Frame::Control(ControlMessage::Heartbeat { .. }) => continue,
                frame => return Some(frame),
            }
        }
    }

    pub async fn send_frame(&self, frame: impl Into<Frame>) -> Result<(), TransportError> {
        let text = frame
            .into()
            .encode()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.outgoing
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Play the server side of the handshake: accept any `auth`, answer the
    /// `join_room` with `participants` (the joining user is appended).
    pub async fn accept_handshake(
        &mut self,
        user_id: &str,
        mut participants: Vec<Participant>,
    ) -> Result<(), TransportError> {
        let user_name = match self.recv_frame().await {
            Some(Frame::Control(ControlMessage::Auth { user_name, .. })) => user_name,
            Some(other) => return Err(TransportError::Protocol(format!("expected auth, got {other:?}"))),
            None => return Err(TransportError::Closed),
        };
        self.send_frame(ControlMessage::Authenticated {
            user_id: user_id.to_string(),
        })
        .await?;

        let contract_id = match self.recv_frame().await {
            Some(Frame::Control(ControlMessage::JoinRoom { contract_id })) => contract_id,
            Some(other) => {
                return Err(TransportError::Protocol(format!("expected join_room, got {other:?}")))
            }
            None => return Err(TransportError::Closed),
        };
        participants.push(Participant::new(user_id, user_name));
        self.send_frame(ControlMessage::RoomJoined {
            contract_id,
            participants,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract_id() -> DraftId {
        "0190a3c4-5b6d-7e8f-9a0b-1c2d3e4f5a6b".parse().unwrap()
    }

    #[tokio::test]
    async fn test_memory_connector_pairs_channels() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let mut conn = connector.connect(contract_id()).await.unwrap();
        let mut peer = accept_rx.recv().await.unwrap();
        assert_eq!(peer.contract_id, contract_id());

        conn.outgoing
            .send(Frame::from(ControlMessage::Heartbeat { timestamp: 1 }).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(
            peer.recv_frame().await,
            Some(Frame::Control(ControlMessage::Heartbeat { timestamp: 1 }))
        );

        peer.send_frame(ControlMessage::AuthError { reason: "nope".into() })
            .await
            .unwrap();
        let text = conn.incoming.recv().await.unwrap();
        assert!(text.contains("auth_error"));
    }

    #[tokio::test]
    async fn test_offline_refuses_and_counts_attempts() {
        let (connector, _accept_rx) = MemoryConnector::new();
        connector.set_online(false);
        assert!(matches!(
            connector.connect(contract_id()).await,
            Err(TransportError::Connect(_))
        ));
        connector.set_online(true);
        assert!(connector.connect(contract_id()).await.is_ok());
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_dropping_peer_closes_client_incoming() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let mut conn = connector.connect(contract_id()).await.unwrap();
        drop(accept_rx.recv().await.unwrap());
        assert_eq!(conn.incoming.recv().await, None);
    }
}
