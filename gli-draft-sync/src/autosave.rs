//! Debounced persistence of the current draft.
//!
//! ```text
//! edit ─► schedule_save ─► Debouncer (restarts on every call)
//!                               │ quiet for `debounce`
//!                               ▼
//!                          perform_save ─► contract_backup_{id}
//!                               │          contract_history_{id} (newest first)
//!                               ▼
//!                          SaveStatus (watch channel)
//! ```
//!
//! `force_save` skips the debounce. Failed writes are retried with a fixed
//! delay; once the budget is spent the error lands in
//! [`SaveStatus::last_error`] and is never returned to the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gli_draft_core::{Clock, ContractDraft, DraftError, DraftId, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::config::duration_ms;
use crate::schedule::{Debouncer, RetryPolicy};
use crate::storage::{keys, KvStore, KvStoreExt, StoreError};
use crate::SharedDraftStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
    /// Quiet period before a scheduled save runs.
    #[serde(rename = "debounce_ms", with = "duration_ms")]
    pub debounce: Duration,
    /// Retries after the first failed write.
    pub max_retries: u32,
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
    /// Entries kept in `contract_history_{id}`.
    pub history_limit: usize,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            history_limit: 10,
        }
    }
}

impl AutoSaveConfig {
    pub fn for_testing() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

/// Observable save state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStatus {
    pub is_saving: bool,
    pub last_saved: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub save_count: u64,
    pub pending_changes: bool,
}

/// A persisted copy of a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedDraft {
    pub draft: ContractDraft,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AutoSaveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error("no history entry {index} for draft {id}")]
    HistoryEntryMissing { id: DraftId, index: usize },
}

struct Inner {
    config: AutoSaveConfig,
    store: Arc<dyn KvStore>,
    drafts: SharedDraftStore,
    clock: Arc<dyn Clock>,
    status: watch::Sender<SaveStatus>,
    debouncer: Debouncer,
    /// Current debounce window in milliseconds; starts at `config.debounce`.
    interval_ms: AtomicU64,
    paused: AtomicBool,
    enabled: AtomicBool,
    /// Bumped by every `schedule_save`; lets a save tell whether edits
    /// arrived while it was writing.
    changes: AtomicU64,
    save_lock: Mutex<()>,
}

/// Debounced autosave for the current draft. Cheap to clone.
#[derive(Clone)]
pub struct AutoSaveScheduler {
    inner: Arc<Inner>,
}

impl AutoSaveScheduler {
    pub fn new(
        config: AutoSaveConfig,
        store: Arc<dyn KvStore>,
        drafts: SharedDraftStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status, _) = watch::channel(SaveStatus::default());
        let interval_ms = AtomicU64::new(config.debounce.as_millis() as u64);
        Self {
            inner: Arc::new(Inner {
                interval_ms,
                config,
                store,
                drafts,
                clock,
                status,
                debouncer: Debouncer::new(),
                paused: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
                changes: AtomicU64::new(0),
                save_lock: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &AutoSaveConfig {
        &self.inner.config
    }

    /// Note a change and (re)start the debounce timer.
    pub fn schedule_save(&self) {
        self.inner.changes.fetch_add(1, Ordering::SeqCst);
        self.inner.status.send_modify(|s| s.pending_changes = true);
        self.arm();
    }

    /// Persist now, cancelling any pending timer. Returns whether a draft
    /// was written.
    pub async fn force_save(&self) -> bool {
        self.inner.debouncer.cancel();
        self.inner.perform_save().await
    }

    /// Stop the timer without discarding the pending change.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        if self.inner.debouncer.cancel() {
            log::debug!("Autosave paused with a save pending");
        }
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        if self.status().pending_changes {
            self.arm();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Follow the user's autosave preference. While disabled, changes are
    /// only marked pending.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.inner.debouncer.cancel();
        } else if self.status().pending_changes {
            self.arm();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Change the debounce window. A pending save is re-armed with it.
    pub fn set_interval(&self, interval: Duration) {
        if interval.is_zero() {
            log::warn!("Ignoring zero autosave interval");
            return;
        }
        let previous = self
            .inner
            .interval_ms
            .swap(interval.as_millis() as u64, Ordering::SeqCst);
        if previous != interval.as_millis() as u64 && self.inner.debouncer.is_armed() {
            self.arm();
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.inner.interval_ms.load(Ordering::SeqCst))
    }

    pub fn status(&self) -> SaveStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
        self.inner.status.subscribe()
    }

    /// Saved versions of `id`, newest first.
    pub fn history(&self, id: DraftId) -> Result<Vec<SavedDraft>, AutoSaveError> {
        Ok(self
            .inner
            .store
            .get_json(&keys::contract_history(id))?
            .unwrap_or_default())
    }

    /// Latest saved copy of `id`.
    pub fn load_saved(&self, id: DraftId) -> Result<Option<SavedDraft>, AutoSaveError> {
        Ok(self.inner.store.get_json(&keys::contract_backup(id))?)
    }

    /// Put history entry `index` back into the store as the current draft
    /// and schedule a save of the restored state.
    pub async fn restore_from_history(
        &self,
        id: DraftId,
        index: usize,
    ) -> Result<Version, AutoSaveError> {
        let entry = self
            .history(id)?
            .into_iter()
            .nth(index)
            .ok_or(AutoSaveError::HistoryEntryMissing { id, index })?;
        let version = {
            let mut drafts = self.inner.drafts.write().await;
            if drafts.get_by_id(id).is_some() {
                drafts.update(id, entry.draft)?;
                drafts.set_current(id)?
            } else {
                drafts.insert_restored(entry.draft)
            }
        };
        log::info!("Restored draft {id} from history entry {index} ({})", entry.saved_at);
        self.schedule_save();
        Ok(version)
    }

    fn arm(&self) {
        if self.is_paused() || !self.is_enabled() {
            return;
        }
        let inner = self.inner.clone();
        let delay = self.interval();
        log::debug!("Autosave armed for {delay:?}");
        self.inner.debouncer.arm(delay, move || async move {
            inner.perform_save().await;
        });
    }
}

impl Inner {
    async fn perform_save(&self) -> bool {
        let _guard = self.save_lock.lock().await;
        let generation = self.changes.load(Ordering::SeqCst);

        let draft = self.drafts.read().await.current().cloned();
        let Some(draft) = draft else {
            self.status.send_modify(|s| s.pending_changes = false);
            return false;
        };

        self.status.send_modify(|s| s.is_saving = true);
        let policy = RetryPolicy::fixed(self.config.max_retries, self.config.retry_delay);
        let (this, draft) = (self, &draft);
        let result = policy
            .run(move |_attempt| async move { this.write_draft(draft) })
            .await;

        let still_pending = self.changes.load(Ordering::SeqCst) != generation;
        match result {
            Ok(saved_at) => {
                self.status.send_modify(|s| {
                    s.is_saving = false;
                    s.last_saved = Some(saved_at);
                    s.last_error = None;
                    s.save_count += 1;
                    s.pending_changes = still_pending;
                });
                log::debug!("Saved draft {}", draft.id);
                true
            }
            Err(exhausted) => {
                log::error!(
                    "Saving draft {} failed after {} attempts: {}",
                    draft.id,
                    exhausted.attempts,
                    exhausted.last_error
                );
                self.status.send_modify(|s| {
                    s.is_saving = false;
                    s.last_error = Some(exhausted.last_error.to_string());
                });
                false
            }
        }
    }

    fn write_draft(&self, draft: &ContractDraft) -> Result<DateTime<Utc>, AutoSaveError> {
        let saved = SavedDraft {
            draft: draft.clone(),
            saved_at: self.clock.now(),
        };
        self.store.put_json(&keys::contract_backup(draft.id), &saved)?;

        let history_key = keys::contract_history(draft.id);
        let mut history: Vec<SavedDraft> = self.store.get_json(&history_key)?.unwrap_or_default();
        history.insert(0, saved.clone());
        history.truncate(self.config.history_limit);
        self.store.put_json(&history_key, &history)?;
        Ok(saved.saved_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use gli_draft_core::{ContractType, DraftPatch, DraftStore, ManualClock};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::RwLock;

    /// Fails the first `failures` puts.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl KvStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.put(key, value)
        }

        fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key)
        }

        fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys_with_prefix(prefix)
        }
    }

    fn setup(store: Arc<dyn KvStore>) -> (AutoSaveScheduler, SharedDraftStore, DraftId) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch_2024());
        let mut drafts = DraftStore::new(clock.clone());
        let id = drafts.create(ContractType::Sale, "D1");
        let drafts = Arc::new(RwLock::new(drafts));
        let scheduler =
            AutoSaveScheduler::new(AutoSaveConfig::for_testing(), store, drafts.clone(), clock);
        (scheduler, drafts, id)
    }

    async fn edit_address(drafts: &SharedDraftStore, address: &str) {
        drafts
            .write()
            .await
            .update_partial(&DraftPatch::new().set("property.address", address))
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_within_window_coalesce_into_one_save() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, drafts, id) = setup(store.clone());

        for (i, address) in ["A1", "A2", "A3", "A4", "A5"].iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            edit_address(&drafts, address).await;
            scheduler.schedule_save();
        }
        assert_eq!(scheduler.status().save_count, 0);
        assert!(scheduler.status().pending_changes);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let status = scheduler.status();
        assert_eq!(status.save_count, 1);
        assert!(!status.pending_changes);
        assert_eq!(scheduler.history(id).unwrap().len(), 1);
        let saved = scheduler.load_saved(id).unwrap().unwrap();
        assert_eq!(saved.draft.property.address, "A5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_save_skips_debounce() {
        let (scheduler, drafts, id) = setup(Arc::new(MemoryStore::new()));
        edit_address(&drafts, "Now").await;
        scheduler.schedule_save();

        assert!(scheduler.force_save().await);
        assert_eq!(scheduler.status().save_count, 1);
        assert_eq!(
            scheduler.load_saved(id).unwrap().unwrap().draft.property.address,
            "Now"
        );

        // The cancelled timer must not produce a second write.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(scheduler.status().save_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_applies_to_next_save() {
        let (scheduler, drafts, _) = setup(Arc::new(MemoryStore::new()));
        scheduler.set_interval(Duration::from_secs(5));
        assert_eq!(scheduler.interval(), Duration::from_secs(5));

        edit_address(&drafts, "Slow").await;
        scheduler.schedule_save();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(scheduler.status().save_count, 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(scheduler.status().save_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_rearms_pending_save() {
        let (scheduler, drafts, _) = setup(Arc::new(MemoryStore::new()));
        edit_address(&drafts, "Pending").await;
        scheduler.schedule_save();

        scheduler.set_interval(Duration::from_secs(3));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(scheduler.status().save_count, 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(scheduler.status().save_count, 1);

        scheduler.set_interval(Duration::ZERO);
        assert_eq!(scheduler.interval(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(1),
        });
        let (scheduler, _drafts, id) = setup(store);
        assert!(scheduler.force_save().await);
        assert_eq!(scheduler.status().last_error, None);
        assert!(scheduler.load_saved(id).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_recorded_not_returned() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(10),
        });
        let (scheduler, _drafts, _id) = setup(store);
        scheduler.schedule_save();
        assert!(!scheduler.force_save().await);

        let status = scheduler.status();
        assert_eq!(status.save_count, 0);
        assert!(!status.is_saving);
        assert!(status.pending_changes);
        assert!(status.last_error.unwrap().contains("disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_newest_first_and_capped() {
        let (scheduler, drafts, id) = setup(Arc::new(MemoryStore::new()));
        for i in 0..12 {
            edit_address(&drafts, &format!("Street {i}")).await;
            scheduler.force_save().await;
        }
        let history = scheduler.history(id).unwrap();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].draft.property.address, "Street 11");
        assert_eq!(history[9].draft.property.address, "Street 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_pending_until_resume() {
        let (scheduler, drafts, _id) = setup(Arc::new(MemoryStore::new()));
        edit_address(&drafts, "Paused").await;
        scheduler.schedule_save();
        scheduler.pause();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(scheduler.status().save_count, 0);
        assert!(scheduler.status().pending_changes);

        scheduler.resume();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(scheduler.status().save_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_only_marks_pending() {
        let (scheduler, _drafts, _id) = setup(Arc::new(MemoryStore::new()));
        scheduler.set_enabled(false);
        scheduler.schedule_save();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(scheduler.status().save_count, 0);
        assert!(scheduler.status().pending_changes);

        scheduler.set_enabled(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(scheduler.status().save_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_from_history() {
        let (scheduler, drafts, id) = setup(Arc::new(MemoryStore::new()));
        edit_address(&drafts, "Old").await;
        scheduler.force_save().await;
        edit_address(&drafts, "New").await;
        scheduler.force_save().await;

        scheduler.restore_from_history(id, 1).await.unwrap();
        assert_eq!(
            drafts.read().await.get_by_id(id).unwrap().property.address,
            "Old"
        );
        assert!(matches!(
            scheduler.restore_from_history(id, 7).await,
            Err(AutoSaveError::HistoryEntryMissing { index: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_no_current_draft_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch_2024());
        let drafts = Arc::new(RwLock::new(DraftStore::new(clock.clone())));
        let scheduler =
            AutoSaveScheduler::new(AutoSaveConfig::for_testing(), store.clone(), drafts, clock);
        scheduler.schedule_save();
        assert!(!scheduler.force_save().await);
        assert!(!scheduler.status().pending_changes);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_observe_saves() {
        let (scheduler, _drafts, _id) = setup(Arc::new(MemoryStore::new()));
        let mut rx = scheduler.subscribe();
        scheduler.force_save().await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().save_count, 1);
    }
}
