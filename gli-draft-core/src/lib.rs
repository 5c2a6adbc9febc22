//! # gli-draft-core: contract draft model and in-memory store
//!
//! ```text
//! UI edits ──► DraftStore (versioned map + current pointer)
//!                 │
//!                 ├──► autosave / collaboration / recovery (gli-draft-sync)
//!                 ▼
//!             ContractDraft ◄── DraftPatch (deep-merge partial update)
//! ```
//!
//! ## Modules
//!
//! - [`draft`]: `ContractDraft`, its sections and identifiers
//! - [`patch`]: partial updates applied by the UI and by remote peers
//! - [`store`]: `DraftStore`, the session's source of truth
//! - [`clock`]: injectable wall clock

pub mod clock;
pub mod draft;
pub mod patch;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use draft::{
    AgreementsSection, AttachedDocument, ContractDraft, ContractType, DocumentsSection, DraftId,
    DraftStatus, FinancialSection, Installment, LegalSection, PartiesSection, Party,
    PropertySection, Signature,
};
pub use patch::DraftPatch;
pub use store::{DraftError, DraftStore, Version};
