//! Contract draft data model.
//!
//! JSON shape uses camelCase keys so exported drafts, durable records and
//! wire payloads share one representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::{NoContext, Timestamp, Uuid};

/// Draft identifier.
///
/// A UUIDv7: the high bits carry the creation timestamp, the rest is random,
/// so ids sort by creation time and never collide within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DraftId(Uuid);

impl DraftId {
    /// Mint a new id for the given creation instant.
    pub fn generate(at: DateTime<Utc>) -> Self {
        let secs = at.timestamp().max(0) as u64;
        let nanos = at.timestamp_subsec_nanos();
        Self(Uuid::new_v7(Timestamp::from_unix(NoContext, secs, nanos)))
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for DraftId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DraftId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of contract being drafted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    Sale,
    Rental,
    Lease,
    Commercial,
    Land,
    Other,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Rental => "rental",
            Self::Lease => "lease",
            Self::Commercial => "commercial",
            Self::Land => "land",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    #[default]
    Draft,
    Completed,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PropertySection {
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub cadastral_reference: String,
    /// Built area in square meters.
    pub area: Option<f64>,
    pub property_kind: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Party {
    pub role: String,
    pub name: String,
    pub id_number: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartiesSection {
    pub parties: Vec<Party>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Installment {
    pub due: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FinancialSection {
    pub price: Option<f64>,
    pub deposit: Option<f64>,
    pub currency: String,
    pub payment_method: String,
    pub payment_schedule: Vec<Installment>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegalSection {
    pub jurisdiction: String,
    pub governing_law: String,
    pub clauses: Vec<String>,
    pub special_conditions: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachedDocument {
    pub name: String,
    pub kind: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentsSection {
    pub documents: Vec<AttachedDocument>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Signature {
    pub user_id: String,
    pub signed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgreementsSection {
    pub terms_accepted: bool,
    pub signatures: Vec<Signature>,
    pub notes: String,
}

/// The editable contract document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDraft {
    pub id: DraftId,
    #[serde(rename = "type")]
    pub contract_type: ContractType,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DraftStatus,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub property: PropertySection,
    #[serde(default)]
    pub parties: PartiesSection,
    #[serde(default)]
    pub financial: FinancialSection,
    #[serde(default)]
    pub legal: LegalSection,
    #[serde(default)]
    pub documents: DocumentsSection,
    #[serde(default)]
    pub agreements: AgreementsSection,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, Value>,
}

impl ContractDraft {
    /// Fresh empty draft created at `now`.
    pub fn new(contract_type: ContractType, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: DraftId::generate(now),
            contract_type,
            title: title.into(),
            created_at: now,
            updated_at: now,
            status: DraftStatus::Draft,
            participants: Vec::new(),
            property: PropertySection::default(),
            parties: PartiesSection::default(),
            financial: FinancialSection::default(),
            legal: LegalSection::default(),
            documents: DocumentsSection::default(),
            agreements: AgreementsSection::default(),
            custom_fields: BTreeMap::new(),
        }
    }

    /// Give this draft a new identity: fresh id, timestamps at `now`,
    /// status back to `draft`. Content is untouched.
    pub fn reidentify(&mut self, now: DateTime<Utc>) {
        self.id = DraftId::generate(now);
        self.created_at = now;
        self.updated_at = now;
        self.status = DraftStatus::Draft;
    }

    /// Bump `updated_at`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// True when every content field matches `other`; identity and
    /// timestamps are ignored.
    pub fn same_content(&self, other: &ContractDraft) -> bool {
        self.contract_type == other.contract_type
            && self.title == other.title
            && self.participants == other.participants
            && self.property == other.property
            && self.parties == other.parties
            && self.financial == other.financial
            && self.legal == other.legal
            && self.documents == other.documents
            && self.agreements == other.agreements
            && self.custom_fields == other.custom_fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_ids_are_unique_within_same_millisecond() {
        let now = at(1_704_067_200_000);
        let a = DraftId::generate(now);
        let b = DraftId::generate(now);
        assert_ne!(a, b);
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let early = DraftId::generate(at(1_704_067_200_000));
        let late = DraftId::generate(at(1_704_067_260_000));
        assert!(early < late);
    }

    #[test]
    fn test_draft_id_parse_display() {
        let id = DraftId::generate(at(1_704_067_200_000));
        let parsed: DraftId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_json_shape_uses_camel_case_and_type_key() {
        let draft = ContractDraft::new(ContractType::Sale, "Flat", at(1_704_067_200_000));
        let json = serde_json::to_value(&draft).unwrap();
        assert_eq!(json["type"], "sale");
        assert_eq!(json["status"], "draft");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("customFields").is_some());
        assert!(json["property"].get("postalCode").is_some());
    }

    #[test]
    fn test_missing_sections_default_on_parse() {
        let draft = ContractDraft::new(ContractType::Rental, "Room", at(1_704_067_200_000));
        let mut json = serde_json::to_value(&draft).unwrap();
        let obj = json.as_object_mut().unwrap();
        obj.remove("legal");
        obj.remove("agreements");
        let parsed: ContractDraft = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.legal, LegalSection::default());
        assert_eq!(parsed.id, draft.id);
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let mut draft = ContractDraft::new(ContractType::Land, "Plot", at(10_000));
        draft.touch(at(5_000));
        assert_eq!(draft.updated_at, at(10_000));
        draft.touch(at(20_000));
        assert_eq!(draft.updated_at, at(20_000));
    }

    #[test]
    fn test_reidentify_resets_identity_only() {
        let mut draft = ContractDraft::new(ContractType::Sale, "House", at(1_000));
        draft.status = DraftStatus::Completed;
        draft.property.address = "Calle Mayor 1".into();
        let original = draft.clone();

        draft.reidentify(at(9_000));
        assert_ne!(draft.id, original.id);
        assert_eq!(draft.created_at, at(9_000));
        assert_eq!(draft.status, DraftStatus::Draft);
        assert!(draft.same_content(&original));
    }
}
