//! Collaboration wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminator:
//! ```text
//! control        auth · authenticated · auth_error · join_room · room_joined · heartbeat
//! collaboration  contract_update · user_joined · user_left · typing
//!                sync_request · sync_response
//! ```
//! Collaboration messages share a header (`contractId`, `userId`,
//! `userName`, `timestamp`) and carry an optional `data` payload. The
//! `timestamp` is the sender's wall clock in milliseconds and is the only
//! ordering key between peers.

use gli_draft_core::{ContractDraft, DraftId, DraftPatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A member of a collaboration room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub user_name: String,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Header shared by all collaboration messages, plus the kind-specific
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub contract_id: DraftId,
    pub user_id: String,
    pub user_name: String,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(contract_id: DraftId, sender: &Participant, timestamp: i64, data: T) -> Self {
        Self {
            contract_id,
            user_id: sender.user_id.clone(),
            user_name: sender.user_name.clone(),
            timestamp,
            data,
        }
    }

    pub fn sender(&self) -> Participant {
        Participant::new(self.user_id.clone(), self.user_name.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    pub is_typing: bool,
}

/// Messages exchanged between room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollaborationMessage {
    ContractUpdate(Envelope<DraftPatch>),
    UserJoined(Envelope<()>),
    UserLeft(Envelope<()>),
    Typing(Envelope<TypingData>),
    SyncRequest(Envelope<()>),
    /// Full draft state; `None` when the responder has no copy.
    SyncResponse(Envelope<Option<ContractDraft>>),
}

macro_rules! header {
    ($self:ident, $field:ident) => {
        match $self {
            Self::ContractUpdate(e) => &e.$field,
            Self::UserJoined(e) => &e.$field,
            Self::UserLeft(e) => &e.$field,
            Self::Typing(e) => &e.$field,
            Self::SyncRequest(e) => &e.$field,
            Self::SyncResponse(e) => &e.$field,
        }
    };
}

impl CollaborationMessage {
    pub fn contract_id(&self) -> DraftId {
        *header!(self, contract_id)
    }

    pub fn user_id(&self) -> &str {
        header!(self, user_id)
    }

    pub fn user_name(&self) -> &str {
        header!(self, user_name)
    }

    pub fn timestamp(&self) -> i64 {
        *header!(self, timestamp)
    }

    /// Wire name of this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContractUpdate(_) => "contract_update",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
            Self::Typing(_) => "typing",
            Self::SyncRequest(_) => "sync_request",
            Self::SyncResponse(_) => "sync_response",
        }
    }
}

/// Connection management messages. `auth`, `join_room` and `heartbeat` are
/// sent by clients; the rest are server replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    Auth { token: String, user_name: String },
    Authenticated { user_id: String },
    AuthError { reason: String },
    JoinRoom { contract_id: DraftId },
    RoomJoined { contract_id: DraftId, participants: Vec<Participant> },
    Heartbeat { timestamp: i64 },
}

const CONTROL_KINDS: &[&str] = &[
    "auth",
    "authenticated",
    "auth_error",
    "join_room",
    "room_joined",
    "heartbeat",
];

/// Anything that travels over the transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Control(ControlMessage),
    Collaboration(CollaborationMessage),
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode a text frame, dispatching on its `type`.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if CONTROL_KINDS.contains(&kind.as_str()) {
            serde_json::from_value(value)
                .map(Frame::Control)
                .map_err(|e| ProtocolError::Deserialization(format!("{kind}: {e}")))
        } else {
            serde_json::from_value(value)
                .map(Frame::Collaboration)
                .map_err(|e| match e.to_string() {
                    msg if msg.contains("unknown variant") => ProtocolError::UnknownType(kind),
                    msg => ProtocolError::Deserialization(format!("{kind}: {msg}")),
                })
        }
    }
}

impl From<ControlMessage> for Frame {
    fn from(msg: ControlMessage) -> Self {
        Frame::Control(msg)
    }
}

impl From<CollaborationMessage> for Frame {
    fn from(msg: CollaborationMessage) -> Self {
        Frame::Collaboration(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("frame has no 'type' field")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
}
