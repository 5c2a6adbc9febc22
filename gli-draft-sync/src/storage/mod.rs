//! Durable key-value storage for drafts, snapshots and backups.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  get/put JSON   ┌──────────────────────────────┐
//! │ AutoSave       │ ──────────────► │ KvStore                       │
//! │ Recovery       │                 │  ├─ MemoryStore (HashMap)     │
//! │ BackupManager  │                 │  └─ RocksStore  (RocksDB, LZ4,│
//! └────────────────┘                 │                 checksummed)  │
//!                                    └──────────────────────────────┘
//! ```
//!
//! The store is single-writer: each component owns its own keys (see
//! [`keys`]) and writes are never interleaved mid-operation.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig, StoredValue};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("checksum mismatch for key '{key}'")]
    ChecksumMismatch { key: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Byte-oriented durable key-value store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, in lexicographic order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// JSON convenience layer over any [`KvStore`].
pub trait KvStoreExt: KvStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put(key, &bytes)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// Durable key layout.
pub mod keys {
    use gli_draft_core::DraftId;

    /// Latest snapshot written by the recovery manager.
    pub const RECOVERY_DATA: &str = "gli_recovery_data";
    /// Rolling list of the last few recovery snapshots, newest first.
    pub const RECOVERY_ROLLING: &str = "gli_backup_data";
    /// Named backup archive.
    pub const BACKUPS: &str = "gli_backups";

    pub const CONTRACT_BACKUP_PREFIX: &str = "contract_backup_";
    pub const CONTRACT_HISTORY_PREFIX: &str = "contract_history_";

    /// Latest autosave of one draft.
    pub fn contract_backup(id: DraftId) -> String {
        format!("{CONTRACT_BACKUP_PREFIX}{id}")
    }

    /// Bounded autosave history of one draft, newest first.
    pub fn contract_history(id: DraftId) -> String {
        format!("{CONTRACT_HISTORY_PREFIX}{id}")
    }
}
