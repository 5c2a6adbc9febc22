//! The engine context: one value owning the draft store and every
//! component, built from injected storage, transport, clock, credentials
//! and codecs.

use std::sync::Arc;
use std::time::Duration;

use gli_draft_core::{Clock, DraftError, DraftPatch, DraftStore, SystemClock};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::autosave::AutoSaveScheduler;
use crate::backup::{BackupCodecs, BackupError, BackupManager, RestoreSummary};
use crate::channel::{ChannelError, CollaborationChannel};
use crate::codec::{Codec, IdentityCodec};
use crate::config::EngineConfig;
use crate::recovery::{
    CredentialProvider, RecoveryError, RecoveryInfo, RecoveryManager, StaticCredentials,
};
use crate::session::{SessionState, SharedSession};
use crate::storage::KvStore;
use crate::transport::Connector;
use crate::SharedDraftStore;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Backup(#[from] BackupError),
}

/// Result of [`DraftEngine::boot`].
#[derive(Debug, Clone, PartialEq)]
pub struct BootReport {
    /// A snapshot that can be offered to the user for recovery.
    pub recoverable: Option<RecoveryInfo>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    store: Arc<dyn KvStore>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    credentials: Arc<dyn CredentialProvider>,
    compressor: Arc<dyn Codec>,
    encryptor: Arc<dyn Codec>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn codecs(mut self, compressor: Arc<dyn Codec>, encryptor: Arc<dyn Codec>) -> Self {
        self.compressor = compressor;
        self.encryptor = encryptor;
        self
    }

    pub fn build(self) -> DraftEngine {
        let drafts: SharedDraftStore = Arc::new(RwLock::new(DraftStore::new(self.clock.clone())));
        let mut state = SessionState::new(self.clock.now());
        // Until the user picks one, the interval is the configured debounce
        state.preferences.auto_save_interval = self.config.autosave.debounce.as_millis() as u64;
        let session: SharedSession = Arc::new(RwLock::new(state));
        let autosave = AutoSaveScheduler::new(
            self.config.autosave.clone(),
            self.store.clone(),
            drafts.clone(),
            self.clock.clone(),
        );
        let channel = CollaborationChannel::new(
            self.config.channel.clone(),
            self.connector,
            drafts.clone(),
            self.clock.clone(),
        );
        let recovery = RecoveryManager::new(
            self.config.recovery.clone(),
            self.store.clone(),
            drafts.clone(),
            channel.clone(),
            session.clone(),
            self.credentials,
            self.clock.clone(),
        );
        let backups = BackupManager::new(
            self.config.backup.clone(),
            self.store.clone(),
            drafts.clone(),
            channel.clone(),
            session.clone(),
            self.clock.clone(),
            BackupCodecs::new(self.compressor, self.encryptor),
        );

        DraftEngine {
            config: self.config,
            clock: self.clock,
            drafts,
            session,
            autosave,
            channel,
            recovery,
            backups,
        }
    }
}

pub struct DraftEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    drafts: SharedDraftStore,
    session: SharedSession,
    autosave: AutoSaveScheduler,
    channel: CollaborationChannel,
    recovery: RecoveryManager,
    backups: BackupManager,
}

impl DraftEngine {
    pub fn builder(store: Arc<dyn KvStore>, connector: Arc<dyn Connector>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            store,
            connector,
            clock: Arc::new(SystemClock),
            credentials: Arc::new(StaticCredentials::default()),
            compressor: Arc::new(IdentityCodec),
            encryptor: Arc::new(IdentityCodec),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn drafts(&self) -> &SharedDraftStore {
        &self.drafts
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn autosave(&self) -> &AutoSaveScheduler {
        &self.autosave
    }

    pub fn channel(&self) -> &CollaborationChannel {
        &self.channel
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Start the background timers and report whether a snapshot can be
    /// recovered.
    pub async fn boot(&self) -> BootReport {
        self.apply_preferences().await;
        self.recovery.start();
        self.backups.start();
        let recoverable = self.recovery.recovery_info();
        if let Some(info) = &recoverable {
            log::info!(
                "Recoverable draft '{}' from {} ({} ms old)",
                info.title,
                info.last_saved,
                info.age_ms
            );
        }
        BootReport { recoverable }
    }

    /// Replay the latest snapshot and apply the restored preferences.
    pub async fn recover(&self) -> Result<bool, EngineError> {
        let recovered = self.recovery.recover_data().await?;
        if recovered {
            self.apply_preferences().await;
        }
        Ok(recovered)
    }

    /// Restore a named backup and apply the preferences it carried.
    pub async fn restore_backup(&self, backup_id: &str) -> Result<RestoreSummary, EngineError> {
        let summary = self.backups.restore_from_backup(backup_id).await?;
        self.apply_preferences().await;
        Ok(summary)
    }

    /// Apply a UI edit to the current draft. Inside a collaboration room
    /// the edit is also published; otherwise it stays local. Either way an
    /// autosave is scheduled.
    pub async fn edit(&self, patch: DraftPatch) -> Result<(), EngineError> {
        let current = self.drafts.read().await.current_id();
        let current = current.ok_or(DraftError::NoCurrentDraft)?;
        if self.channel.contract_id().await == Some(current) {
            self.channel.send_update(current, patch).await?;
        } else {
            self.drafts.write().await.update_partial(&patch)?;
        }
        self.session.write().await.touch(self.clock.now());
        self.autosave.schedule_save();
        Ok(())
    }

    /// Tab hidden: flush the pending save and take a snapshot.
    pub async fn on_page_hidden(&self) {
        self.flush().await;
    }

    /// Page about to unload: same as hidden, then stop the timers.
    pub async fn before_unload(&self) {
        self.flush().await;
        self.recovery.stop();
        self.backups.stop();
    }

    /// Flush state and leave any collaboration room.
    pub async fn shutdown(&self) {
        self.before_unload().await;
        self.channel.disconnect().await;
    }

    async fn flush(&self) {
        self.autosave.force_save().await;
        if let Err(e) = self.recovery.create_snapshot().await {
            log::warn!("Recovery snapshot failed: {e}");
        }
    }

    async fn apply_preferences(&self) {
        let prefs = self.session.read().await.preferences.clone();
        self.autosave.set_interval(Duration::from_millis(prefs.auto_save_interval));
        self.autosave.set_enabled(prefs.auto_save_enabled);
    }
}
