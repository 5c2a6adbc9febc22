//! # gli-draft-sync: durability and sync for contract drafts
//!
//! Keeps the drafts held by [`gli_draft_core::DraftStore`] safe across
//! crashes, reloads and multiple editors.
//!
//! ## Architecture
//!
//! ```text
//!   UI edit ──► DraftEngine::edit
//!                 │
//!      ┌──────────┼──────────────────┬──────────────────┐
//!      ▼          ▼                  ▼                  ▼
//! ┌──────────┐ ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │ AutoSave │ │ Collaboration│ │ Recovery     │ │ Backup       │
//! │ debounce │ │ Channel (ws) │ │ snapshots    │ │ archive      │
//! └────┬─────┘ └──────┬───────┘ └──────┬───────┘ └──────┬───────┘
//!      │              │                │                │
//!      ▼              ▼                ▼                ▼
//!   KvStore      RelayServer        KvStore          KvStore
//! ```
//!
//! ## Modules
//!
//! - [`autosave`]: debounced persistence with retry and per-draft history
//! - [`channel`]: WebSocket collaboration client with offline queue
//! - [`recovery`]: periodic crash-recovery snapshots
//! - [`backup`]: named, checksummed backups with import/export
//! - [`engine`]: wires everything to one shared draft store
//! - [`relay`]: room-based WebSocket relay the channel talks to
//! - [`protocol`]: JSON wire messages
//! - [`storage`]: key-value persistence (memory, RocksDB)
//! - [`transport`]: connectors (WebSocket, in-memory)
//! - [`codec`]: pluggable compression / encryption for backups
//! - [`schedule`]: debounce, retry, periodic and single-flight helpers
//! - [`session`]: user preferences and session info
//! - [`config`]: TOML configuration

pub mod autosave;
pub mod backup;
pub mod channel;
pub mod codec;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod recovery;
pub mod relay;
pub mod schedule;
pub mod session;
pub mod storage;
pub mod transport;

use std::sync::Arc;

use gli_draft_core::DraftStore;
use tokio::sync::RwLock;

/// The draft store every component reads and writes.
pub type SharedDraftStore = Arc<RwLock<DraftStore>>;

// Re-exports for convenience
pub use autosave::{AutoSaveConfig, AutoSaveError, AutoSaveScheduler, SaveStatus, SavedDraft};
pub use backup::{
    BackupCodecs, BackupConfig, BackupError, BackupExport, BackupManager, BackupMetadata, BackupPayload,
    BackupProgress, BackupRecord, BackupStage, BackupStats, RestoreSummary,
};
pub use channel::{
    ChannelConfig, ChannelError, ChannelEvent, ChannelState, ChannelStats, CollaborationChannel,
    CollaborationState, Delivery, OfflineQueue, QueuedUpdate,
};
pub use codec::{Codec, CodecError, IdentityCodec, Lz4Codec};
pub use config::{ConfigError, EngineConfig};
pub use engine::{BootReport, DraftEngine, EngineBuilder, EngineError};
pub use protocol::{CollaborationMessage, ControlMessage, Envelope, Frame, Participant, ProtocolError};
pub use recovery::{
    CredentialProvider, Credentials, RecoveryConfig, RecoveryError, RecoveryInfo, RecoveryManager,
    RecoverySnapshot, StaticCredentials,
};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{SessionInfo, SessionState, SharedSession, UserPreferences};
pub use storage::{KvStore, KvStoreExt, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use transport::{Connection, Connector, MemoryConnector, MemoryPeer, TransportError, WsConnector};
