//! In-memory draft store.
//!
//! `DraftStore` is the single source of truth for drafts during a session:
//! a map of drafts keyed by id plus a "current draft" pointer. Every
//! mutation bumps a store-wide [`Version`] so observers (autosave, UI
//! projections) can tell whether anything changed since they last looked.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::clock::Clock;
use crate::draft::{ContractDraft, ContractType, DraftId, DraftStatus};
use crate::patch::DraftPatch;

/// Monotonic stamp returned by every mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(pub u64);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DraftError {
    #[error("draft not found: {0}")]
    NotFound(DraftId),
    #[error("no current draft selected")]
    NoCurrentDraft,
    #[error("malformed draft: {0}")]
    Malformed(String),
}

pub struct DraftStore {
    /// Ordered by id; UUIDv7 ids make this creation order.
    drafts: BTreeMap<DraftId, ContractDraft>,
    current: Option<DraftId>,
    version: Version,
    clock: Arc<dyn Clock>,
}

impl DraftStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            drafts: BTreeMap::new(),
            current: None,
            version: Version::default(),
            clock,
        }
    }

    /// Create an empty draft and make it current.
    pub fn create(&mut self, contract_type: ContractType, title: impl Into<String>) -> DraftId {
        let draft = ContractDraft::new(contract_type, title, self.clock.now());
        let id = draft.id;
        self.drafts.insert(id, draft);
        self.current = Some(id);
        self.bump();
        log::debug!("Created draft {id} ({})", contract_type.as_str());
        id
    }

    /// Replace a draft's content. Identity (`id`, `createdAt`) is preserved.
    pub fn update(&mut self, id: DraftId, draft: ContractDraft) -> Result<Version, DraftError> {
        let now = self.clock.now();
        let existing = self.drafts.get_mut(&id).ok_or(DraftError::NotFound(id))?;
        let created_at = existing.created_at;
        let previous = existing.updated_at;
        *existing = draft;
        existing.id = id;
        existing.created_at = created_at;
        existing.updated_at = previous;
        existing.touch(now);
        Ok(self.bump())
    }

    /// Apply a patch to the current draft.
    pub fn update_partial(&mut self, patch: &DraftPatch) -> Result<Version, DraftError> {
        let id = self.current.ok_or(DraftError::NoCurrentDraft)?;
        self.apply_patch(id, patch)
    }

    /// Apply a patch to a specific draft. The draft is left untouched if the
    /// patched result is malformed.
    pub fn apply_patch(&mut self, id: DraftId, patch: &DraftPatch) -> Result<Version, DraftError> {
        let now = self.clock.now();
        let existing = self.drafts.get_mut(&id).ok_or(DraftError::NotFound(id))?;
        let mut patched = patch.apply_to(existing)?;
        patched.updated_at = existing.updated_at;
        patched.touch(now);
        *existing = patched;
        Ok(self.bump())
    }

    pub fn set_status(&mut self, id: DraftId, status: DraftStatus) -> Result<Version, DraftError> {
        let now = self.clock.now();
        let existing = self.drafts.get_mut(&id).ok_or(DraftError::NotFound(id))?;
        existing.status = status;
        existing.touch(now);
        Ok(self.bump())
    }

    pub fn set_current(&mut self, id: DraftId) -> Result<Version, DraftError> {
        if !self.drafts.contains_key(&id) {
            return Err(DraftError::NotFound(id));
        }
        self.current = Some(id);
        Ok(self.bump())
    }

    pub fn clear_current(&mut self) -> Version {
        self.current = None;
        self.bump()
    }

    /// Remove a draft. If it was current, another remaining draft (if any)
    /// becomes current.
    pub fn delete(&mut self, id: DraftId) -> Result<Version, DraftError> {
        self.drafts.remove(&id).ok_or(DraftError::NotFound(id))?;
        if self.current == Some(id) {
            self.current = self.drafts.keys().next_back().copied();
        }
        Ok(self.bump())
    }

    /// Copy a draft under a fresh identity. The copy is not made current.
    pub fn duplicate(&mut self, id: DraftId) -> Result<DraftId, DraftError> {
        let source = self.drafts.get(&id).ok_or(DraftError::NotFound(id))?;
        let mut copy = source.clone();
        copy.reidentify(self.clock.now());
        copy.title = format!("{} (Copy)", source.title);
        let new_id = copy.id;
        self.drafts.insert(new_id, copy);
        self.bump();
        Ok(new_id)
    }

    /// Pretty-printed JSON of a draft.
    pub fn export_as_text(&self, id: DraftId) -> Result<String, DraftError> {
        let draft = self.drafts.get(&id).ok_or(DraftError::NotFound(id))?;
        serde_json::to_string_pretty(draft).map_err(|e| DraftError::Malformed(e.to_string()))
    }

    /// Parse a draft exported by [`export_as_text`](Self::export_as_text)
    /// and add it under a fresh identity, making it current.
    pub fn import_from_text(&mut self, text: &str) -> Result<DraftId, DraftError> {
        let mut draft: ContractDraft =
            serde_json::from_str(text).map_err(|e| DraftError::Malformed(e.to_string()))?;
        draft.reidentify(self.clock.now());
        let id = draft.id;
        self.drafts.insert(id, draft);
        self.current = Some(id);
        self.bump();
        log::info!("Imported draft as {id}");
        Ok(id)
    }

    /// Put back a draft exactly as it was recorded (same id and timestamps)
    /// and make it current.
    pub fn insert_restored(&mut self, draft: ContractDraft) -> Version {
        let id = draft.id;
        self.drafts.insert(id, draft);
        self.current = Some(id);
        self.bump()
    }

    /// Wipe every draft and replace the collection. The first restored draft
    /// becomes current.
    pub fn replace_all(&mut self, drafts: Vec<ContractDraft>) -> Version {
        self.drafts.clear();
        self.current = None;
        for draft in drafts {
            if self.current.is_none() {
                self.current = Some(draft.id);
            }
            self.drafts.insert(draft.id, draft);
        }
        self.bump()
    }

    pub fn get_by_id(&self, id: DraftId) -> Option<&ContractDraft> {
        self.drafts.get(&id)
    }

    pub fn get_all(&self) -> Vec<&ContractDraft> {
        self.drafts.values().collect()
    }

    pub fn get_by_type(&self, contract_type: ContractType) -> Vec<&ContractDraft> {
        self.drafts
            .values()
            .filter(|d| d.contract_type == contract_type)
            .collect()
    }

    pub fn current(&self) -> Option<&ContractDraft> {
        self.current.and_then(|id| self.drafts.get(&id))
    }

    pub fn current_id(&self) -> Option<DraftId> {
        self.current
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn bump(&mut self) -> Version {
        self.version.0 += 1;
        self.version
    }
}
