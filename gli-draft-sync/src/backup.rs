//! Named, retention-bounded backup archive.
//!
//! ```text
//! create_backup:  prepare ─► compress ─► encrypt ─► save ─► complete
//!                 (JSON payload, SHA-256)   codec hooks   gli_backups
//! restore:        base64 ─► decrypt ─► decompress ─► verify checksum
//!                 ─► replace all drafts ─► restore preferences
//! ```
//!
//! The archive is newest first and never holds more than `max_backups`
//! records; a periodic sweep drops records older than `retention_days`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use gli_draft_core::{Clock, ContractDraft};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::channel::{CollaborationChannel, CollaborationState};
use crate::codec::{Codec, CodecError, IdentityCodec};
use crate::config::{duration_ms, opt_duration_ms};
use crate::recovery::RecoverySnapshot;
use crate::schedule::{PeriodicTask, SingleFlight};
use crate::session::{SharedSession, UserPreferences};
use crate::storage::{keys, KvStore, KvStoreExt, StoreError};
use crate::SharedDraftStore;

pub const BACKUP_FORMAT_VERSION: &str = "1.0";

const REQUIRED_FIELDS: [&str; 5] = ["id", "name", "timestamp", "data", "version"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub max_backups: usize,
    pub retention_days: u32,
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Unset disables automatic backups.
    #[serde(rename = "auto_backup_interval_ms", with = "opt_duration_ms")]
    pub auto_backup_interval: Option<Duration>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_backups: 10,
            retention_days: 30,
            sweep_interval: Duration::from_secs(60 * 60),
            auto_backup_interval: None,
        }
    }
}

impl BackupConfig {
    pub fn for_testing() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub draft_count: usize,
    /// Size of the prepared payload before compression.
    pub total_size: u64,
    pub compression_ratio: f64,
    /// SHA-256 of the prepared payload, hex.
    pub checksum: String,
    #[serde(default = "identity_name")]
    pub compression: String,
    #[serde(default = "identity_name")]
    pub encryption: String,
}

fn identity_name() -> String {
    IdentityCodec.name().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Stored payload size in bytes.
    #[serde(default)]
    pub size: u64,
    pub version: String,
    /// Encoded payload, base64.
    pub data: String,
    pub metadata: BackupMetadata,
}

/// Everything a backup captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    pub drafts: Vec<ContractDraft>,
    pub recovery: Option<RecoverySnapshot>,
    pub preferences: UserPreferences,
    pub collaboration: CollaborationState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStage {
    Preparing,
    Compressing,
    Encrypting,
    Saving,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupProgress {
    pub stage: BackupStage,
    /// 0–100
    pub percent: u8,
}

pub type ProgressCallback = Arc<dyn Fn(BackupProgress) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub count: usize,
    pub total_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub average_size: u64,
}

/// A backup rendered for download.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupExport {
    pub file_name: String,
    pub contents: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub draft_count: usize,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup already in progress")]
    InProgress,
    #[error("backup '{0}' not found")]
    NotFound(String),
    #[error("backup integrity check failed: {0}")]
    Integrity(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compression and encryption hooks applied to every archived payload.
#[derive(Clone)]
pub struct BackupCodecs {
    pub compressor: Arc<dyn Codec>,
    pub encryptor: Arc<dyn Codec>,
}

impl BackupCodecs {
    pub fn new(compressor: Arc<dyn Codec>, encryptor: Arc<dyn Codec>) -> Self {
        Self { compressor, encryptor }
    }
}

impl Default for BackupCodecs {
    fn default() -> Self {
        Self::new(Arc::new(IdentityCodec), Arc::new(IdentityCodec))
    }
}

struct Inner {
    config: BackupConfig,
    store: Arc<dyn KvStore>,
    drafts: SharedDraftStore,
    channel: CollaborationChannel,
    session: SharedSession,
    clock: Arc<dyn Clock>,
    compressor: Arc<dyn Codec>,
    encryptor: Arc<dyn Codec>,
    progress: Mutex<Option<ProgressCallback>>,
    flight: SingleFlight,
    timers: Mutex<Vec<PeriodicTask>>,
}

#[derive(Clone)]
pub struct BackupManager {
    inner: Arc<Inner>,
}

impl BackupManager {
    pub fn new(
        config: BackupConfig,
        store: Arc<dyn KvStore>,
        drafts: SharedDraftStore,
        channel: CollaborationChannel,
        session: SharedSession,
        clock: Arc<dyn Clock>,
        codecs: BackupCodecs,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                drafts,
                channel,
                session,
                clock,
                compressor: codecs.compressor,
                encryptor: codecs.encryptor,
                progress: Mutex::new(None),
                flight: SingleFlight::new(),
                timers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn on_progress(&self, callback: impl Fn(BackupProgress) + Send + Sync + 'static) {
        *self.inner.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    pub async fn create_backup(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<BackupRecord, BackupError> {
        self.inner.create_backup(name, description).await
    }

    pub fn is_backing_up(&self) -> bool {
        self.inner.flight.is_busy()
    }

    /// Wipe the draft store, load the backup's drafts and preferences.
    pub async fn restore_from_backup(&self, id: &str) -> Result<RestoreSummary, BackupError> {
        let record = self
            .get_backup(id)?
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;
        let payload = self.inner.decode_payload(&record)?;
        let draft_count = payload.drafts.len();

        self.inner.drafts.write().await.replace_all(payload.drafts);
        self.inner.session.write().await.preferences = payload.preferences;
        log::info!("Restored {draft_count} drafts from backup '{}'", record.name);
        Ok(RestoreSummary { draft_count })
    }

    /// Newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>, BackupError> {
        self.inner.load_archive()
    }

    pub fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>, BackupError> {
        Ok(self.inner.load_archive()?.into_iter().find(|r| r.id == id))
    }

    /// Returns whether a record was removed.
    pub fn delete_backup(&self, id: &str) -> Result<bool, BackupError> {
        let mut archive = self.inner.load_archive()?;
        let before = archive.len();
        archive.retain(|r| r.id != id);
        if archive.len() == before {
            return Ok(false);
        }
        self.inner.save_archive(&archive)?;
        Ok(true)
    }

    pub fn export_backup(&self, id: &str) -> Result<BackupExport, BackupError> {
        let record = self
            .get_backup(id)?
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;
        let contents = serde_json::to_string_pretty(&record)
            .map_err(|e| BackupError::Serialization(e.to_string()))?;
        Ok(BackupExport {
            file_name: export_file_name(&record),
            contents,
        })
    }

    /// Write the export file into `dir` and return its path.
    pub fn export_backup_to_dir(&self, id: &str, dir: &Path) -> Result<PathBuf, BackupError> {
        let export = self.export_backup(id)?;
        let path = dir.join(&export.file_name);
        std::fs::write(&path, export.contents)?;
        log::info!("Exported backup {id} to {}", path.display());
        Ok(path)
    }

    /// Validate an exported backup and add it to the archive under a fresh
    /// id and timestamp.
    pub fn import_backup(&self, text: &str) -> Result<BackupRecord, BackupError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BackupError::Integrity(format!("not a backup file: {e}")))?;
        if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| value.get(**f).is_none()) {
            return Err(BackupError::Integrity(format!("missing field '{missing}'")));
        }
        let mut record: BackupRecord = serde_json::from_value(value)
            .map_err(|e| BackupError::Integrity(format!("malformed backup: {e}")))?;
        self.inner.decode_payload(&record)?;

        record.id = uuid::Uuid::new_v4().to_string();
        record.timestamp = self.inner.clock.now();
        self.inner.persist(record.clone())?;
        log::info!("Imported backup '{}' as {}", record.name, record.id);
        Ok(record)
    }

    pub fn get_backup_stats(&self) -> Result<BackupStats, BackupError> {
        let archive = self.inner.load_archive()?;
        let count = archive.len();
        let total_size: u64 = archive.iter().map(|r| r.size).sum();
        Ok(BackupStats {
            count,
            total_size,
            oldest: archive.iter().map(|r| r.timestamp).min(),
            newest: archive.iter().map(|r| r.timestamp).max(),
            average_size: if count == 0 { 0 } else { total_size / count as u64 },
        })
    }

    /// Drop records older than `retention_days`. Returns how many went.
    pub fn sweep_expired(&self) -> Result<usize, BackupError> {
        self.inner.sweep_expired()
    }

    /// Start the retention sweep and, if configured, automatic backups.
    pub fn start(&self) {
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.clear();

        let inner = self.inner.clone();
        timers.push(PeriodicTask::spawn(self.inner.config.sweep_interval, move || {
            let inner = inner.clone();
            async move {
                if let Err(e) = inner.sweep_expired() {
                    log::warn!("Backup retention sweep failed: {e}");
                }
            }
        }));

        if let Some(period) = self.inner.config.auto_backup_interval {
            let inner = self.inner.clone();
            timers.push(PeriodicTask::spawn(period, move || {
                let inner = inner.clone();
                async move {
                    let name = format!("auto_backup_{}", inner.clock.now_millis());
                    match inner.create_backup(&name, Some("Automatic backup")).await {
                        Ok(_) | Err(BackupError::InProgress) => {}
                        Err(e) => log::warn!("Automatic backup failed: {e}"),
                    }
                }
            }));
        }
    }

    pub fn stop(&self) {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Inner {
    fn report(&self, stage: BackupStage, percent: u8) {
        let callback = self
            .progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(BackupProgress { stage, percent });
        }
    }

    async fn create_backup(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<BackupRecord, BackupError> {
        let Some(_flight) = self.flight.try_begin() else {
            return Err(BackupError::InProgress);
        };

        self.report(BackupStage::Preparing, 0);
        let payload = BackupPayload {
            drafts: self.drafts.read().await.get_all().into_iter().cloned().collect(),
            recovery: self.store.get_json(keys::RECOVERY_DATA).unwrap_or_else(|e| {
                log::warn!("Backing up without recovery data: {e}");
                None
            }),
            preferences: self.session.read().await.preferences.clone(),
            collaboration: self.channel.collaboration_state().await,
        };
        let prepared =
            serde_json::to_vec(&payload).map_err(|e| BackupError::Serialization(e.to_string()))?;
        let checksum = sha256_hex(&prepared);
        self.report(BackupStage::Preparing, 20);

        self.report(BackupStage::Compressing, 40);
        let compressed = self.compressor.encode(&prepared)?;
        self.report(BackupStage::Encrypting, 60);
        let encrypted = self.encryptor.encode(&compressed)?;

        let record = BackupRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            timestamp: self.clock.now(),
            size: encrypted.len() as u64,
            version: BACKUP_FORMAT_VERSION.to_string(),
            data: BASE64_STANDARD.encode(&encrypted),
            metadata: BackupMetadata {
                draft_count: payload.drafts.len(),
                total_size: prepared.len() as u64,
                compression_ratio: if compressed.is_empty() {
                    1.0
                } else {
                    prepared.len() as f64 / compressed.len() as f64
                },
                checksum,
                compression: self.compressor.name().to_string(),
                encryption: self.encryptor.name().to_string(),
            },
        };

        self.report(BackupStage::Saving, 80);
        self.persist(record.clone())?;
        self.report(BackupStage::Complete, 100);
        log::info!(
            "Backup '{}' created ({} drafts, {} bytes)",
            record.name,
            record.metadata.draft_count,
            record.size
        );
        Ok(record)
    }

    fn decode_payload(&self, record: &BackupRecord) -> Result<BackupPayload, BackupError> {
        if record.metadata.encryption != self.encryptor.name()
            || record.metadata.compression != self.compressor.name()
        {
            return Err(BackupError::Integrity(format!(
                "encoded with {}/{}, expected {}/{}",
                record.metadata.compression,
                record.metadata.encryption,
                self.compressor.name(),
                self.encryptor.name()
            )));
        }
        let encrypted = BASE64_STANDARD
            .decode(&record.data)
            .map_err(|e| BackupError::Integrity(format!("payload is not base64: {e}")))?;
        let compressed = self
            .encryptor
            .decode(&encrypted)
            .map_err(|e| BackupError::Integrity(e.to_string()))?;
        let prepared = self
            .compressor
            .decode(&compressed)
            .map_err(|e| BackupError::Integrity(e.to_string()))?;
        if sha256_hex(&prepared) != record.metadata.checksum {
            return Err(BackupError::Integrity("checksum mismatch".into()));
        }
        serde_json::from_slice(&prepared)
            .map_err(|e| BackupError::Integrity(format!("payload unreadable: {e}")))
    }

    fn load_archive(&self) -> Result<Vec<BackupRecord>, BackupError> {
        Ok(self.store.get_json(keys::BACKUPS)?.unwrap_or_default())
    }

    fn save_archive(&self, archive: &[BackupRecord]) -> Result<(), BackupError> {
        Ok(self.store.put_json(keys::BACKUPS, archive)?)
    }

    /// Prepend and evict beyond `max_backups`, oldest first.
    fn persist(&self, record: BackupRecord) -> Result<(), BackupError> {
        let mut archive = self.load_archive()?;
        archive.insert(0, record);
        if archive.len() > self.config.max_backups {
            for evicted in archive.drain(self.config.max_backups..) {
                log::debug!("Evicting backup '{}'", evicted.name);
            }
        }
        self.save_archive(&archive)
    }

    fn sweep_expired(&self) -> Result<usize, BackupError> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(self.config.retention_days));
        let mut archive = self.load_archive()?;
        let before = archive.len();
        archive.retain(|r| r.timestamp >= cutoff);
        let removed = before - archive.len();
        if removed > 0 {
            self.save_archive(&archive)?;
            log::info!("Retention sweep removed {removed} backups");
        }
        Ok(removed)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `gli_backup_{name}_{YYYY-MM-DD}.json`
fn export_file_name(record: &BackupRecord) -> String {
    let name: String = record
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("gli_backup_{}_{}.json", name, record.timestamp.format("%Y-%m-%d"))
}
