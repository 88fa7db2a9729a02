//! Entity Queue: "give me the next unit of work" over the entities table.
//!
//! `next` selects and claims in one locked database call, so two callers can
//! never own the same entity. A claim lasts until the owner releases it or the
//! entity reaches a terminal status.

use std::str::FromStr;

use harvest_common::{Entity, EntityStatus, NewEntity};
use reqwest::Url;
use tracing::{debug, info};

use crate::errors::{HarvestError, HarvestResult};
use crate::store::DbHandle;

#[derive(Clone)]
pub struct EntityQueue {
    db: DbHandle,
}

impl EntityQueue {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Claim the first pending entity of `job_id` in insertion order.
    /// `None` means the queue is exhausted for this pass.
    pub async fn next(&self, job_id: i64) -> HarvestResult<Option<Entity>> {
        let entity = self
            .db
            .call(move |db| db.claim_next(job_id))
            .await
            .map_err(HarvestError::from_anyhow)?;
        if let Some(entity) = &entity {
            debug!(job_id, entity_id = entity.id, status = %entity.status, "claimed entity");
        }
        Ok(entity)
    }

    /// Give up ownership without changing status.
    pub async fn release(&self, id: i64) -> HarvestResult<()> {
        self.db
            .call(move |db| db.release_claim(id))
            .await
            .map_err(HarvestError::from_anyhow)
    }

    pub async fn get_by_id(&self, id: i64) -> HarvestResult<Entity> {
        self.db
            .call(move |db| {
                db.get_entity(id)?
                    .ok_or_else(|| HarvestError::EntityNotFound { id }.into())
            })
            .await
            .map_err(HarvestError::from_anyhow)
    }

    pub async fn list(&self, job_id: i64) -> HarvestResult<Vec<Entity>> {
        self.db
            .call(move |db| db.list_entities(job_id))
            .await
            .map_err(HarvestError::from_anyhow)
    }

    /// Entities of `job_id` in insertion order, narrowed by `filter`.
    pub async fn list_matching(&self, job_id: i64, filter: EntityFilter) -> HarvestResult<Vec<Entity>> {
        let mut entities = self.list(job_id).await?;
        entities.retain(|entity| filter.matches(entity.status));
        Ok(entities)
    }

    /// Move an entity to `skipped`. Skipping an already-terminal entity leaves
    /// it as it is and returns its snapshot.
    pub async fn skip(&self, id: i64) -> HarvestResult<Entity> {
        let entity = self
            .db
            .call(move |db| {
                let Some(current) = db.get_entity(id)? else {
                    return Err(HarvestError::EntityNotFound { id }.into());
                };
                if !db.skip_entity(id)? {
                    debug!(entity_id = id, status = %current.status, "skip on terminal entity ignored");
                }
                db.get_entity(id)?
                    .ok_or_else(|| HarvestError::EntityNotFound { id }.into())
            })
            .await
            .map_err(HarvestError::from_anyhow)?;
        info!(entity_id = id, status = %entity.status, "entity skipped");
        Ok(entity)
    }

    /// Bulk-insert harvested entities in `pending_address` status.
    pub async fn insert_many(&self, job_id: i64, entities: Vec<NewEntity>) -> HarvestResult<usize> {
        self.db
            .call(move |db| db.insert_entities(job_id, &entities))
            .await
            .map_err(HarvestError::from_anyhow)
    }

    /// Validate and attach an address to a `pending_address` entity.
    pub async fn attach_address(&self, id: i64, raw: &str) -> HarvestResult<Entity> {
        let address = normalize_address(raw)?;
        self.db
            .call(move |db| {
                let Some(current) = db.get_entity(id)? else {
                    return Err(HarvestError::EntityNotFound { id }.into());
                };
                if !db.attach_address(id, &address)? {
                    return Err(HarvestError::invalid(
                        "status",
                        format!(
                            "entity {} is {}, an address can only be attached while pending_address",
                            id, current.status
                        ),
                    )
                    .into());
                }
                db.get_entity(id)?
                    .ok_or_else(|| HarvestError::EntityNotFound { id }.into())
            })
            .await
            .map_err(HarvestError::from_anyhow)
    }

    /// Roll an attach back when extraction could not be started.
    pub async fn detach_address(&self, id: i64, note: &str) -> HarvestResult<bool> {
        let note = note.to_string();
        self.db
            .call(move |db| db.detach_address(id, &note))
            .await
            .map_err(HarvestError::from_anyhow)
    }

    /// `address_set → extracting`, once the worker acknowledged the start.
    pub async fn mark_extracting(&self, id: i64) -> HarvestResult<bool> {
        self.db
            .call(move |db| db.transition_entity(id, EntityStatus::AddressSet, EntityStatus::Extracting))
            .await
            .map_err(HarvestError::from_anyhow)
    }

    /// Store an extraction result. Returns the terminal status written, or
    /// `None` when the entity was no longer awaiting extraction.
    pub async fn record_contacts(
        &self,
        id: i64,
        contacts: Vec<String>,
        note: Option<String>,
    ) -> HarvestResult<Option<EntityStatus>> {
        let contacts = dedupe_contacts(contacts);
        self.db
            .call(move |db| {
                if db.get_entity(id)?.is_none() {
                    return Err(HarvestError::EntityNotFound { id }.into());
                }
                db.record_contacts(id, &contacts, note.as_deref())
            })
            .await
            .map_err(HarvestError::from_anyhow)
    }
}

/// Which entities a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntityFilter {
    #[default]
    All,
    /// Everything not yet terminal.
    Pending,
    Status(EntityStatus),
}

impl EntityFilter {
    pub fn matches(&self, status: EntityStatus) -> bool {
        match self {
            Self::All => true,
            Self::Pending => !status.is_terminal(),
            Self::Status(wanted) => *wanted == status,
        }
    }
}

impl FromStr for EntityFilter {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "all" => Ok(Self::All),
            "pending" => Ok(Self::Pending),
            other => EntityStatus::from_str(other)
                .map(Self::Status)
                .map_err(|e| HarvestError::invalid("status", e)),
        }
    }
}

/// Keep the first occurrence of each contact, compared case-insensitively.
fn dedupe_contacts(contacts: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    contacts
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(c.to_lowercase()))
        .collect()
}

/// Canonical form of an operator- or agent-supplied web address.
///
/// Adds `https://` to bare hosts, strips query and fragment and drops a
/// trailing slash. Anything without an http(s) scheme and a host is rejected.
pub fn normalize_address(raw: &str) -> HarvestResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(HarvestError::invalid("address", "address is empty"));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else if looks_like_host(trimmed) {
        format!("https://{}", trimmed)
    } else {
        return Err(HarvestError::invalid(
            "address",
            format!("'{}' has no scheme and does not look like a host", trimmed),
        ));
    };

    let mut url = Url::parse(&with_scheme)
        .map_err(|e| HarvestError::invalid("address", format!("'{}': {}", trimmed, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(HarvestError::invalid(
            "address",
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(HarvestError::invalid("address", format!("'{}' has no host", trimmed)));
    }
    url.set_query(None);
    url.set_fragment(None);

    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn looks_like_host(text: &str) -> bool {
    let host = text.split('/').next().unwrap_or_default();
    host.contains('.')
        && !host.starts_with('.')
        && !host.ends_with('.')
        && !text.chars().any(char::is_whitespace)
}

/// Host part of an address, lowercased and without a leading `www.`.
pub fn address_host(address: &str) -> Option<String> {
    let url = Url::parse(address).ok()?;
    let host = url.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}
