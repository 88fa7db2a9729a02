use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a reviewed entity.
///
/// ```text
/// pending_address → address_set → extracting → resolved | resolved_empty
///        └──────────────┴─────────────┴──────→ skipped
/// ```
///
/// `resolved`, `resolved_empty` and `skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    PendingAddress,
    AddressSet,
    Extracting,
    Resolved,
    ResolvedEmpty,
    Skipped,
}

impl EntityStatus {
    pub const ALL: [EntityStatus; 6] = [
        Self::PendingAddress,
        Self::AddressSet,
        Self::Extracting,
        Self::Resolved,
        Self::ResolvedEmpty,
        Self::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingAddress => "pending_address",
            Self::AddressSet => "address_set",
            Self::Extracting => "extracting",
            Self::Resolved => "resolved",
            Self::ResolvedEmpty => "resolved_empty",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::ResolvedEmpty | Self::Skipped)
    }

    /// Terminal status for an extraction result.
    pub fn for_contacts(contacts: &[String]) -> Self {
        if contacts.is_empty() {
            Self::ResolvedEmpty
        } else {
            Self::Resolved
        }
    }

    /// Whether `self → to` is legal.
    ///
    /// `address_set → pending_address` is the rollback used when the
    /// extraction collaborator refuses to start; nothing leaves a terminal
    /// status.
    pub fn can_transition_to(&self, to: EntityStatus) -> bool {
        matches!(
            (self, to),
            (Self::PendingAddress, Self::AddressSet)
                | (Self::AddressSet, Self::Extracting)
                | (Self::AddressSet, Self::Resolved)
                | (Self::AddressSet, Self::ResolvedEmpty)
                | (Self::AddressSet, Self::PendingAddress)
                | (Self::Extracting, Self::Resolved)
                | (Self::Extracting, Self::ResolvedEmpty)
                | (Self::PendingAddress, Self::Skipped)
                | (Self::AddressSet, Self::Skipped)
                | (Self::Extracting, Self::Skipped)
        )
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_address" => Ok(Self::PendingAddress),
            "address_set" => Ok(Self::AddressSet),
            "extracting" => Ok(Self::Extracting),
            "resolved" => Ok(Self::Resolved),
            "resolved_empty" => Ok(Self::ResolvedEmpty),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid entity status: {}", s)),
        }
    }
}

/// A raw entity record produced by the harvesting collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEntity {
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub review_date: Option<String>,
}

impl NewEntity {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// A reviewed subject awaiting resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub job_id: i64,
    pub name: String,
    pub region: Option<String>,
    pub excerpt: String,
    pub rating: Option<u8>,
    pub review_date: Option<String>,
    pub status: EntityStatus,
    pub address: Option<String>,
    pub contacts: Vec<String>,
    /// Free-form annotation, e.g. why extraction was force-finished.
    pub note: Option<String>,
    pub status_changed_at: String,
    pub created_at: String,
}

impl Entity {
    /// Check the data-model invariants linking status, address and contacts.
    pub fn is_consistent(&self) -> bool {
        let contacts_match_status = match self.status {
            EntityStatus::Resolved => !self.contacts.is_empty(),
            EntityStatus::ResolvedEmpty => self.contacts.is_empty(),
            _ => self.contacts.is_empty(),
        };
        let address_present_when_needed = match self.status {
            EntityStatus::AddressSet
            | EntityStatus::Extracting
            | EntityStatus::Resolved
            | EntityStatus::ResolvedEmpty => self.address.is_some(),
            EntityStatus::PendingAddress => self.address.is_none(),
            EntityStatus::Skipped => true,
        };
        contacts_match_status && address_present_when_needed
    }

    /// Text used as the search query for this entity.
    pub fn search_query(&self) -> String {
        match self.region.as_deref().filter(|r| !r.trim().is_empty()) {
            Some(region) => format!("{} {}", self.name.trim(), region.trim()),
            None => self.name.trim().to_string(),
        }
    }
}
