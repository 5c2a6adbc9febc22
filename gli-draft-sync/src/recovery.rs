//! Crash recovery snapshots.
//!
//! A [`RecoverySnapshot`] captures the current draft, the collaboration
//! view, preferences and session info. The latest one lives under
//! `gli_recovery_data`; a short rolling list lives under `gli_backup_data`.
//! Snapshots are taken on a timer and from the page-hidden / before-unload
//! hooks, and replayed once at boot by [`RecoveryManager::recover_data`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gli_draft_core::{Clock, ContractDraft, ContractType, DraftId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{CollaborationChannel, CollaborationState};
use crate::config::duration_ms;
use crate::schedule::{PeriodicTask, SingleFlight};
use crate::session::{SessionInfo, SharedSession, UserPreferences};
use crate::storage::{keys, KvStore, KvStoreExt, StoreError};
use crate::SharedDraftStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    #[serde(rename = "snapshot_interval_ms", with = "duration_ms")]
    pub snapshot_interval: Duration,
    /// Snapshots older than this are ignored.
    #[serde(rename = "max_recovery_age_ms", with = "duration_ms")]
    pub max_recovery_age: Duration,
    /// Entries kept in the rolling list.
    pub rolling_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(30),
            max_recovery_age: Duration::from_secs(24 * 60 * 60),
            rolling_limit: 5,
        }
    }
}

impl RecoveryConfig {
    pub fn for_testing() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(5),
            max_recovery_age: Duration::from_secs(60 * 60),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySnapshot {
    pub contract_id: DraftId,
    pub draft: ContractDraft,
    pub last_saved: DateTime<Utc>,
    pub collaboration_state: CollaborationState,
    pub user_preferences: UserPreferences,
    pub session_info: SessionInfo,
}

/// Summary for a "restore your work?" prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryInfo {
    pub contract_id: DraftId,
    pub title: String,
    pub contract_type: ContractType,
    pub last_saved: DateTime<Utc>,
    pub age_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user_name: String,
}

/// Source of a fresh auth token when a collaboration session is resumed.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self) -> Option<Credentials>;
}

/// Fixed credentials, or none.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Option<Credentials>);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self) -> Option<Credentials> {
        self.0.clone()
    }
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("recovery already in progress")]
    InProgress,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("recovery snapshot unreadable: {0}")]
    Corrupt(String),
}

struct Inner {
    config: RecoveryConfig,
    store: Arc<dyn KvStore>,
    drafts: SharedDraftStore,
    channel: CollaborationChannel,
    session: SharedSession,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    flight: SingleFlight,
    timer: Mutex<Option<PeriodicTask>>,
}

#[derive(Clone)]
pub struct RecoveryManager {
    inner: Arc<Inner>,
}

impl RecoveryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RecoveryConfig,
        store: Arc<dyn KvStore>,
        drafts: SharedDraftStore,
        channel: CollaborationChannel,
        session: SharedSession,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                drafts,
                channel,
                session,
                credentials,
                clock,
                flight: SingleFlight::new(),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Start periodic snapshots.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let task = PeriodicTask::spawn(self.inner.config.snapshot_interval, move || {
            let inner = inner.clone();
            async move {
                if let Err(e) = inner.create_snapshot().await {
                    log::warn!("Periodic recovery snapshot failed: {e}");
                }
            }
        });
        *self.inner.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    pub fn stop(&self) {
        self.inner
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(PeriodicTask::is_running)
    }

    /// Snapshot the current state. `None` when there is no current draft.
    pub async fn create_snapshot(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        self.inner.create_snapshot().await
    }

    /// Latest snapshot regardless of age.
    pub fn latest_snapshot(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        self.inner.latest_snapshot()
    }

    /// Newest first.
    pub fn rolling_snapshots(&self) -> Result<Vec<RecoverySnapshot>, RecoveryError> {
        Ok(self
            .inner
            .store
            .get_json(keys::RECOVERY_ROLLING)
            .map_err(|e| RecoveryError::Corrupt(e.to_string()))?
            .unwrap_or_default())
    }

    /// Whether a snapshot young enough to restore exists.
    pub fn has_recovery_data(&self) -> bool {
        match self.inner.latest_snapshot() {
            Ok(Some(snapshot)) => self.inner.is_fresh(&snapshot),
            Ok(None) => false,
            Err(e) => {
                log::warn!("Ignoring recovery data: {e}");
                false
            }
        }
    }

    pub fn recovery_info(&self) -> Option<RecoveryInfo> {
        let snapshot = self.inner.latest_snapshot().ok().flatten()?;
        if !self.inner.is_fresh(&snapshot) {
            return None;
        }
        Some(RecoveryInfo {
            contract_id: snapshot.contract_id,
            title: snapshot.draft.title.clone(),
            contract_type: snapshot.draft.contract_type,
            last_saved: snapshot.last_saved,
            age_ms: self.inner.age_ms(&snapshot),
        })
    }

    /// Replay the latest snapshot. Returns `Ok(false)` when there is nothing
    /// usable to recover; individual step failures are logged and skipped.
    pub async fn recover_data(&self) -> Result<bool, RecoveryError> {
        let Some(_flight) = self.inner.flight.try_begin() else {
            return Err(RecoveryError::InProgress);
        };
        let snapshot = match self.inner.latest_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(false),
            Err(e) => {
                log::warn!("Cannot recover: {e}");
                return Ok(false);
            }
        };
        if !self.inner.is_fresh(&snapshot) {
            log::info!("Recovery snapshot for {} is too old", snapshot.contract_id);
            return Ok(false);
        }
        let contract_id = snapshot.contract_id;

        // 1. Draft
        self.inner
            .drafts
            .write()
            .await
            .insert_restored(snapshot.draft.clone());
        log::info!("Restored draft {contract_id} from recovery snapshot");

        // 2. Collaboration session
        if snapshot.collaboration_state.connected {
            match self.inner.credentials.credentials().await {
                Some(creds) => {
                    if let Err(e) = self
                        .inner
                        .channel
                        .connect(contract_id, creds.token, creds.user_name)
                        .await
                    {
                        log::warn!("Could not resume collaboration on {contract_id}: {e}");
                    }
                }
                None => log::warn!("No credentials to resume collaboration on {contract_id}"),
            }
        }

        // 3. Preferences, 4. session bookkeeping
        let now = self.inner.clock.now();
        let mut session = self.inner.session.write().await;
        session.preferences = snapshot.user_preferences;
        if session.info.page_url.is_none() {
            session.info.page_url = snapshot.session_info.page_url;
        }
        session.restart(now);
        Ok(true)
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.flight.is_busy()
    }

    /// Drop the latest snapshot and the rolling list.
    pub fn clear_recovery_data(&self) -> Result<(), RecoveryError> {
        self.inner.store.delete(keys::RECOVERY_DATA)?;
        self.inner.store.delete(keys::RECOVERY_ROLLING)?;
        Ok(())
    }
}

impl Inner {
    async fn create_snapshot(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        let Some(draft) = self.drafts.read().await.current().cloned() else {
            return Ok(None);
        };
        let now = self.clock.now();
        let (user_preferences, session_info) = {
            let mut session = self.session.write().await;
            session.touch(now);
            (session.preferences.clone(), session.info.clone())
        };
        let snapshot = RecoverySnapshot {
            contract_id: draft.id,
            draft,
            last_saved: now,
            collaboration_state: self.channel.collaboration_state().await,
            user_preferences,
            session_info,
        };

        self.store.put_json(keys::RECOVERY_DATA, &snapshot)?;
        let mut rolling: Vec<RecoverySnapshot> = self
            .store
            .get_json(keys::RECOVERY_ROLLING)
            .unwrap_or_else(|e| {
                log::warn!("Resetting unreadable rolling snapshots: {e}");
                None
            })
            .unwrap_or_default();
        rolling.insert(0, snapshot.clone());
        rolling.truncate(self.config.rolling_limit);
        self.store.put_json(keys::RECOVERY_ROLLING, &rolling)?;

        log::debug!("Recovery snapshot taken for {}", snapshot.contract_id);
        Ok(Some(snapshot))
    }

    fn latest_snapshot(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        self.store
            .get_json(keys::RECOVERY_DATA)
            .map_err(|e| match e {
                StoreError::Deserialization(reason) => RecoveryError::Corrupt(reason),
                other => RecoveryError::Store(other),
            })
    }

    fn age_ms(&self, snapshot: &RecoverySnapshot) -> i64 {
        (self.clock.now() - snapshot.last_saved).num_milliseconds()
    }

    fn is_fresh(&self, snapshot: &RecoverySnapshot) -> bool {
        self.age_ms(snapshot) <= self.config.max_recovery_age.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::storage::MemoryStore;
    use crate::transport::MemoryConnector;
    use crate::session::SessionState;
    use gli_draft_core::{DraftPatch, DraftStore, ManualClock};
    use tokio::sync::{Notify, RwLock};

    struct Harness {
        recovery: RecoveryManager,
        drafts: SharedDraftStore,
        session: SharedSession,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(credentials: Arc<dyn CredentialProvider>) -> Harness {
        let clock = Arc::new(ManualClock::at_epoch_2024());
        let store = Arc::new(MemoryStore::new());
        let drafts: SharedDraftStore = Arc::new(RwLock::new(DraftStore::new(clock.clone())));
        let (connector, _accept_rx) = MemoryConnector::new();
        connector.set_online(false);
        let channel = CollaborationChannel::new(
            ChannelConfig::for_testing(),
            connector,
            drafts.clone(),
            clock.clone(),
        );
        let session = SessionState::shared(clock.now());
        let recovery = RecoveryManager::new(
            RecoveryConfig::for_testing(),
            store.clone(),
            drafts.clone(),
            channel,
            session.clone(),
            credentials,
            clock.clone(),
        );
        Harness {
            recovery,
            drafts,
            session,
            store,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(StaticCredentials::default()))
    }

    async fn seed_draft(h: &Harness) -> DraftId {
        let mut drafts = h.drafts.write().await;
        let id = drafts.create(ContractType::Rental, "Flat");
        drafts
            .update_partial(&DraftPatch::new().set("property.city", "Sevilla"))
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_snapshot_without_current_draft_is_none() {
        let h = harness();
        assert_eq!(h.recovery.create_snapshot().await.unwrap(), None);
        assert!(!h.recovery.has_recovery_data());
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_and_recover_into_empty_store() {
        let h = harness();
        let id = seed_draft(&h).await;
        h.session.write().await.preferences.theme = "dark".into();
        h.recovery.create_snapshot().await.unwrap().unwrap();

        // Simulated restart: fresh drafts and session.
        *h.drafts.write().await = DraftStore::new(h.clock.clone());
        *h.session.write().await = SessionState::new(h.clock.now());

        h.clock.advance_millis(60_000);
        assert!(h.recovery.has_recovery_data());
        let info = h.recovery.recovery_info().unwrap();
        assert_eq!(info.title, "Flat");
        assert_eq!(info.age_ms, 60_000);

        assert!(h.recovery.recover_data().await.unwrap());
        let drafts = h.drafts.read().await;
        assert_eq!(drafts.current_id(), Some(id));
        assert_eq!(drafts.current().unwrap().property.city, "Sevilla");
        let session = h.session.read().await;
        assert_eq!(session.preferences.theme, "dark");
        assert_eq!(session.info.session_start, h.clock.now());
    }

    #[tokio::test]
    async fn test_snapshot_expires_after_max_age() {
        let h = harness();
        seed_draft(&h).await;
        h.recovery.create_snapshot().await.unwrap();

        h.clock.advance_millis(60 * 60 * 1000);
        assert!(h.recovery.has_recovery_data());
        h.clock.advance_millis(1);
        assert!(!h.recovery.has_recovery_data());
        assert!(h.recovery.recovery_info().is_none());
        assert!(!h.recovery.recover_data().await.unwrap());
    }

    #[tokio::test]
    async fn test_rolling_list_keeps_five_newest() {
        let h = harness();
        seed_draft(&h).await;
        for _ in 0..7 {
            h.clock.advance_millis(1000);
            h.recovery.create_snapshot().await.unwrap();
        }
        let rolling = h.recovery.rolling_snapshots().unwrap();
        assert_eq!(rolling.len(), 5);
        assert!(rolling[0].last_saved > rolling[4].last_saved);
        assert_eq!(
            h.recovery.latest_snapshot().unwrap().unwrap().last_saved,
            rolling[0].last_saved
        );
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_not_recovered() {
        let h = harness();
        h.store.put(keys::RECOVERY_DATA, b"{not json").unwrap();
        assert!(!h.recovery.has_recovery_data());
        assert!(!h.recovery.recover_data().await.unwrap());
    }

    /// Blocks in `credentials()` until released.
    struct GatedCredentials {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CredentialProvider for GatedCredentials {
        async fn credentials(&self) -> Option<Credentials> {
            self.entered.notify_one();
            self.release.notified().await;
            None
        }
    }

    #[tokio::test]
    async fn test_recover_is_single_flight() {
        let gate = Arc::new(GatedCredentials {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let h = harness_with(gate.clone());
        seed_draft(&h).await;
        let mut snapshot = h.recovery.create_snapshot().await.unwrap().unwrap();
        snapshot.collaboration_state.connected = true;
        h.store.put_json(keys::RECOVERY_DATA, &snapshot).unwrap();

        let recovery = h.recovery.clone();
        let first = tokio::spawn(async move { recovery.recover_data().await });
        gate.entered.notified().await;

        assert!(h.recovery.is_recovering());
        assert!(matches!(
            h.recovery.recover_data().await,
            Err(RecoveryError::InProgress)
        ));

        gate.release.notify_one();
        assert!(first.await.unwrap().unwrap());
        assert!(!h.recovery.is_recovering());
    }

    #[tokio::test]
    async fn test_failed_reconnect_does_not_abort_recovery() {
        let h = harness_with(Arc::new(StaticCredentials(Some(Credentials {
            token: "t0k".into(),
            user_name: "Alice".into(),
        }))));
        seed_draft(&h).await;
        h.session.write().await.preferences.language = "en".into();
        let mut snapshot = h.recovery.create_snapshot().await.unwrap().unwrap();
        snapshot.collaboration_state.connected = true;
        h.store.put_json(keys::RECOVERY_DATA, &snapshot).unwrap();
        h.session.write().await.preferences.language = "es".into();

        // The connector is offline, so step 2 fails and the rest still runs.
        assert!(h.recovery.recover_data().await.unwrap());
        assert_eq!(h.session.read().await.preferences.language, "en");
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_snapshots() {
        let h = harness();
        seed_draft(&h).await;
        h.recovery.start();
        assert!(h.recovery.is_running());
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert!(h.recovery.latest_snapshot().unwrap().is_some());

        h.recovery.stop();
        assert!(!h.recovery.is_running());
        h.recovery.clear_recovery_data().unwrap();
        assert!(h.recovery.latest_snapshot().unwrap().is_none());
    }
}
