use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use harvest_common::{Entity, EntityStatus, Job, JobCounters, JobLimits, JobPhase, NewEntity};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

/// Async-safe handle to the harvest database.
///
/// Wraps `HarvestDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. Each `call` holds the lock for
/// the whole closure, so a read followed by a write inside one closure is
/// atomic with respect to every other caller.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<HarvestDb>>,
}

impl DbHandle {
    pub fn new(db: HarvestDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open an in-memory database, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(HarvestDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&HarvestDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Per-status entity totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: u32,
    pub pending_address: u32,
    pub address_set: u32,
    pub extracting: u32,
    pub resolved: u32,
    pub resolved_empty: u32,
    pub skipped: u32,
    pub total_contacts: u32,
}

impl Statistics {
    /// Entities without an address yet.
    pub fn awaiting_address(&self) -> u32 {
        self.pending_address
    }

    /// Entities with an address whose extraction has not finished.
    pub fn extraction_in_flight(&self) -> u32 {
        self.address_set + self.extracting
    }

    pub fn finished(&self) -> u32 {
        self.resolved + self.resolved_empty + self.skipped
    }

    fn add(&mut self, status: EntityStatus, count: u32) {
        self.total += count;
        match status {
            EntityStatus::PendingAddress => self.pending_address += count,
            EntityStatus::AddressSet => self.address_set += count,
            EntityStatus::Extracting => self.extracting += count,
            EntityStatus::Resolved => self.resolved += count,
            EntityStatus::ResolvedEmpty => self.resolved_empty += count,
            EntityStatus::Skipped => self.skipped += count,
        }
    }
}

const TERMINAL_STATUSES_SQL: &str = "('resolved', 'resolved_empty', 'skipped')";

pub struct HarvestDb {
    conn: Connection,
}

impl HarvestDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        // Claims mirror the loop's process-local guard state; a fresh process
        // owns nothing.
        self.release_all_claims()?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_url TEXT NOT NULL,
                    label TEXT NOT NULL,
                    phase TEXT NOT NULL DEFAULT 'harvesting_reviews',
                    entities_harvested INTEGER NOT NULL DEFAULT 0,
                    entities_processed INTEGER NOT NULL DEFAULT 0,
                    pages_visited INTEGER NOT NULL DEFAULT 0,
                    max_entities INTEGER,
                    max_pages INTEGER,
                    progress_message TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS entities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    region TEXT,
                    excerpt TEXT NOT NULL DEFAULT '',
                    rating INTEGER,
                    review_date TEXT,
                    status TEXT NOT NULL DEFAULT 'pending_address',
                    address TEXT,
                    contacts TEXT NOT NULL DEFAULT '[]',
                    contact_count INTEGER NOT NULL DEFAULT 0,
                    note TEXT,
                    claimed_at TEXT,
                    status_changed_at TEXT NOT NULL DEFAULT (datetime('now')),
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_source ON jobs(source_url);
                CREATE INDEX IF NOT EXISTS idx_entities_job ON entities(job_id);
                CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(job_id, status);
                ",
            )
            .context("Failed to create tables")?;

        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );",
            )
            .context("Failed to create settings table")?;

        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn create_job(&self, source_url: &str, label: &str, limits: JobLimits) -> Result<Job> {
        let limits = limits.normalized();
        self.conn
            .execute(
                "INSERT INTO jobs (source_url, label, max_entities, max_pages) VALUES (?1, ?2, ?3, ?4)",
                params![source_url, label, limits.max_entities, limits.max_pages],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.require_job(id)
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to query job")?
            .map(JobRow::into_job)
            .transpose()
    }

    fn require_job(&self, id: i64) -> Result<Job> {
        self.get_job(id)?
            .ok_or_else(|| anyhow::anyhow!("Job {} vanished after write", id))
    }

    /// All jobs, newest first.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM jobs ORDER BY created_at DESC, id DESC",
                JOB_COLUMNS
            ))
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map([], JobRow::from_row)
            .context("Failed to query jobs")?;
        rows.map(|row| row.context("Failed to read job row")?.into_job())
            .collect()
    }

    /// The most recent non-terminal job for `source_url`, if any.
    pub fn find_active_job(&self, source_url: &str) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM jobs WHERE source_url = ?1 AND phase NOT IN ('completed', 'error')
                     ORDER BY id DESC LIMIT 1",
                    JOB_COLUMNS
                ),
                params![source_url],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to query active job")?
            .map(JobRow::into_job)
            .transpose()
    }

    /// Move a job from `from` to `to`. Returns false if the job was no longer
    /// in `from`. Pairs outside the forward phase order are rejected.
    pub fn transition_job_phase(&self, id: i64, from: JobPhase, to: JobPhase) -> Result<bool> {
        if !from.can_transition_to(to) {
            anyhow::bail!("Illegal job phase transition {} -> {}", from, to);
        }
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET phase = ?1, updated_at = datetime('now') WHERE id = ?2 AND phase = ?3",
                params![to.as_str(), id, from.as_str()],
            )
            .context("Failed to update job phase")?;
        Ok(changed > 0)
    }

    /// Put an active job back into harvesting for a resume.
    pub fn restart_job(&self, id: i64, message: &str) -> Result<Job> {
        self.conn
            .execute(
                "UPDATE jobs SET phase = 'harvesting_reviews', error = NULL, progress_message = ?1,
                 updated_at = datetime('now')
                 WHERE id = ?2 AND phase NOT IN ('completed', 'error')",
                params![message, id],
            )
            .context("Failed to restart job")?;
        self.require_job(id)
    }

    /// Record progress. Counters only ever grow.
    pub fn update_job_progress(
        &self,
        id: i64,
        message: Option<&str>,
        counters: JobCounters,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET
                    progress_message = COALESCE(?1, progress_message),
                    entities_harvested = MAX(entities_harvested, ?2),
                    entities_processed = MAX(entities_processed, ?3),
                    pages_visited = MAX(pages_visited, ?4),
                    updated_at = datetime('now')
                 WHERE id = ?5",
                params![
                    message,
                    counters.entities_harvested,
                    counters.entities_processed,
                    counters.pages_visited,
                    id
                ],
            )
            .context("Failed to update job progress")?;
        Ok(())
    }

    /// Count the owning job's entity as processed. Called inside the same
    /// transaction as the terminal status write.
    fn count_processed(&self, entity_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET entities_processed = entities_processed + 1,
                 updated_at = datetime('now')
                 WHERE id = (SELECT job_id FROM entities WHERE id = ?1)",
                params![entity_id],
            )
            .context("Failed to increment processed counter")?;
        Ok(())
    }

    /// Mark a non-terminal job as failed. Returns false if it was already terminal.
    pub fn fail_job(&self, id: i64, error: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET phase = 'error', error = ?1, progress_message = ?2,
                 updated_at = datetime('now')
                 WHERE id = ?3 AND phase NOT IN ('completed', 'error')",
                params![error, format!("Error: {}", error), id],
            )
            .context("Failed to mark job as failed")?;
        Ok(changed > 0)
    }

    // ── Entities ──────────────────────────────────────────────────────

    /// Bulk-insert harvested entities in order. Returns the number inserted.
    pub fn insert_entities(&self, job_id: i64, entities: &[NewEntity]) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin entity insert")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO entities (job_id, name, region, excerpt, rating, review_date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .context("Failed to prepare entity insert")?;
            for entity in entities {
                stmt.execute(params![
                    job_id,
                    entity.name,
                    entity.region,
                    entity.excerpt,
                    entity.rating,
                    entity.review_date
                ])
                .context("Failed to insert entity")?;
            }
        }
        tx.commit().context("Failed to commit entity insert")?;
        Ok(entities.len())
    }

    pub fn count_entities(&self, job_id: i64) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM entities WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .context("Failed to count entities")
    }

    pub fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS),
                params![id],
                EntityRow::from_row,
            )
            .optional()
            .context("Failed to query entity")?
            .map(EntityRow::into_entity)
            .transpose()
    }

    pub fn list_entities(&self, job_id: i64) -> Result<Vec<Entity>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM entities WHERE job_id = ?1 ORDER BY id",
                ENTITY_COLUMNS
            ))
            .context("Failed to prepare list_entities")?;
        let rows = stmt
            .query_map(params![job_id], EntityRow::from_row)
            .context("Failed to query entities")?;
        rows.map(|row| row.context("Failed to read entity row")?.into_entity())
            .collect()
    }

    /// Select the first unclaimed, non-terminal entity of a job in insertion
    /// order and claim it in the same statement sequence.
    pub fn claim_next(&self, job_id: i64) -> Result<Option<Entity>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin claim")?;
        let id: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT id FROM entities
                     WHERE job_id = ?1 AND claimed_at IS NULL AND status NOT IN {}
                     ORDER BY id LIMIT 1",
                    TERMINAL_STATUSES_SQL
                ),
                params![job_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to select next entity")?;
        let Some(id) = id else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE entities SET claimed_at = datetime('now') WHERE id = ?1",
            params![id],
        )
        .context("Failed to claim entity")?;
        tx.commit().context("Failed to commit claim")?;
        self.get_entity(id)
    }

    pub fn release_claim(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE entities SET claimed_at = NULL WHERE id = ?1",
                params![id],
            )
            .context("Failed to release claim")?;
        Ok(())
    }

    pub fn release_all_claims(&self) -> Result<()> {
        self.conn
            .execute(
                "UPDATE entities SET claimed_at = NULL WHERE claimed_at IS NOT NULL",
                [],
            )
            .context("Failed to release claims")?;
        Ok(())
    }

    /// Guarded status write: applies only while the entity is still in
    /// `from`. Returns whether the write happened.
    pub fn transition_entity(
        &self,
        id: i64,
        from: EntityStatus,
        to: EntityStatus,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            anyhow::bail!("Illegal entity transition {} -> {}", from, to);
        }
        let changed = self
            .conn
            .execute(
                "UPDATE entities SET status = ?1, status_changed_at = datetime('now')
                 WHERE id = ?2 AND status = ?3",
                params![to.as_str(), id, from.as_str()],
            )
            .context("Failed to update entity status")?;
        Ok(changed > 0)
    }

    /// Attach an address to a `pending_address` entity.
    pub fn attach_address(&self, id: i64, address: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE entities SET address = ?1, status = 'address_set', note = NULL,
                 status_changed_at = datetime('now')
                 WHERE id = ?2 AND status = 'pending_address'",
                params![address, id],
            )
            .context("Failed to attach address")?;
        Ok(changed > 0)
    }

    /// Undo an attach whose extraction never started.
    pub fn detach_address(&self, id: i64, note: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE entities SET address = NULL, status = 'pending_address', note = ?1,
                 status_changed_at = datetime('now')
                 WHERE id = ?2 AND status = 'address_set'",
                params![note, id],
            )
            .context("Failed to detach address")?;
        Ok(changed > 0)
    }

    /// Store an extraction result, choosing `resolved` or `resolved_empty`.
    /// Applies only while extraction is outstanding; returns the new status.
    pub fn record_contacts(
        &self,
        id: i64,
        contacts: &[String],
        note: Option<&str>,
    ) -> Result<Option<EntityStatus>> {
        let status = EntityStatus::for_contacts(contacts);
        let json = serde_json::to_string(contacts).context("Failed to serialize contacts")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin contacts transaction")?;
        let changed = tx
            .execute(
                "UPDATE entities SET contacts = ?1, contact_count = ?2, status = ?3, note = ?4,
                 status_changed_at = datetime('now')
                 WHERE id = ?5 AND status IN ('address_set', 'extracting')",
                params![json, contacts.len() as i64, status.as_str(), note, id],
            )
            .context("Failed to record contacts")?;
        if changed > 0 {
            self.count_processed(id)?;
        }
        tx.commit().context("Failed to commit contacts")?;
        Ok((changed > 0).then_some(status))
    }

    /// Move any non-terminal entity to `skipped`. Returns false if it was
    /// already terminal.
    pub fn skip_entity(&self, id: i64) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin skip transaction")?;
        let changed = tx
            .execute(
                &format!(
                    "UPDATE entities SET status = 'skipped', claimed_at = NULL,
                     status_changed_at = datetime('now')
                     WHERE id = ?1 AND status NOT IN {}",
                    TERMINAL_STATUSES_SQL
                ),
                params![id],
            )
            .context("Failed to skip entity")?;
        if changed > 0 {
            self.count_processed(id)?;
        }
        tx.commit().context("Failed to commit skip")?;
        Ok(changed > 0)
    }

    /// Per-status totals for one job, or across all jobs.
    pub fn statistics(&self, job_id: Option<i64>) -> Result<Statistics> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(contact_count), 0) FROM entities
                 WHERE ?1 IS NULL OR job_id = ?1
                 GROUP BY status",
            )
            .context("Failed to prepare statistics")?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u32>(2)?,
                ))
            })
            .context("Failed to query statistics")?;

        let mut stats = Statistics::default();
        for row in rows {
            let (status, count, contacts) = row.context("Failed to read statistics row")?;
            let status = EntityStatus::from_str(&status)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse entity status")?;
            stats.add(status, count);
            stats.total_contacts += contacts;
        }
        Ok(stats)
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, source_url, label, phase, entities_harvested, entities_processed, \
     pages_visited, max_entities, max_pages, progress_message, error, created_at, updated_at";

/// Intermediate row struct for jobs before parsing the phase string.
struct JobRow {
    id: i64,
    source_url: String,
    label: String,
    phase: String,
    counters: JobCounters,
    limits: JobLimits,
    progress_message: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_url: row.get(1)?,
            label: row.get(2)?,
            phase: row.get(3)?,
            counters: JobCounters {
                entities_harvested: row.get(4)?,
                entities_processed: row.get(5)?,
                pages_visited: row.get(6)?,
            },
            limits: JobLimits {
                max_entities: row.get(7)?,
                max_pages: row.get(8)?,
            },
            progress_message: row.get(9)?,
            error: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let phase = JobPhase::from_str(&self.phase)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job phase")?;
        Ok(Job {
            id: self.id,
            source_url: self.source_url,
            label: self.label,
            phase,
            counters: self.counters,
            limits: self.limits,
            progress_message: self.progress_message,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const ENTITY_COLUMNS: &str = "id, job_id, name, region, excerpt, rating, review_date, status, \
     address, contacts, note, status_changed_at, created_at";

/// Intermediate row struct for entities before parsing status and contacts.
struct EntityRow {
    id: i64,
    job_id: i64,
    name: String,
    region: Option<String>,
    excerpt: String,
    rating: Option<u8>,
    review_date: Option<String>,
    status: String,
    address: Option<String>,
    contacts: String,
    note: Option<String>,
    status_changed_at: String,
    created_at: String,
}

impl EntityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            name: row.get(2)?,
            region: row.get(3)?,
            excerpt: row.get(4)?,
            rating: row.get(5)?,
            review_date: row.get(6)?,
            status: row.get(7)?,
            address: row.get(8)?,
            contacts: row.get(9)?,
            note: row.get(10)?,
            status_changed_at: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_entity(self) -> Result<Entity> {
        let status = EntityStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse entity status")?;
        let contacts: Vec<String> =
            serde_json::from_str(&self.contacts).context("Failed to parse contacts JSON")?;
        Ok(Entity {
            id: self.id,
            job_id: self.job_id,
            name: self.name,
            region: self.region,
            excerpt: self.excerpt,
            rating: self.rating,
            review_date: self.review_date,
            status,
            address: self.address,
            contacts,
            note: self.note,
            status_changed_at: self.status_changed_at,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(names: &[&str]) -> Result<(HarvestDb, Job)> {
        let db = HarvestDb::new_in_memory()?;
        let job = db.create_job("https://apps.example/acme/reviews", "acme", JobLimits::default())?;
        let entities: Vec<NewEntity> = names.iter().map(|n| NewEntity::named(n)).collect();
        db.insert_entities(job.id, &entities)?;
        Ok((db, job))
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = HarvestDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('jobs', 'entities', 'settings')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3);
        Ok(())
    }

    #[test]
    fn test_create_job_defaults() -> Result<()> {
        let db = HarvestDb::new_in_memory()?;
        let job = db.create_job("https://apps.example/acme/reviews", "acme", JobLimits::new(Some(0), Some(4)))?;
        assert!(job.id > 0);
        assert_eq!(job.phase, JobPhase::HarvestingReviews);
        assert_eq!(job.counters, JobCounters::default());
        assert_eq!(job.limits.max_entities, None);
        assert_eq!(job.limits.max_pages, Some(4));
        assert!(!job.created_at.is_empty());
        Ok(())
    }

    #[test]
    fn test_find_active_job_ignores_terminal() -> Result<()> {
        let db = HarvestDb::new_in_memory()?;
        let url = "https://apps.example/acme/reviews";
        let job = db.create_job(url, "acme", JobLimits::default())?;
        assert_eq!(db.find_active_job(url)?.map(|j| j.id), Some(job.id));

        assert!(db.fail_job(job.id, "boom")?);
        assert!(db.find_active_job(url)?.is_none());
        assert!(!db.fail_job(job.id, "again")?, "already terminal");
        Ok(())
    }

    #[test]
    fn test_transition_job_phase_is_guarded() -> Result<()> {
        let db = HarvestDb::new_in_memory()?;
        let job = db.create_job("u", "l", JobLimits::default())?;
        assert!(db.transition_job_phase(job.id, JobPhase::HarvestingReviews, JobPhase::ResolvingAddresses)?);
        assert!(!db.transition_job_phase(job.id, JobPhase::HarvestingReviews, JobPhase::ResolvingAddresses)?);
        assert_eq!(db.get_job(job.id)?.unwrap().phase, JobPhase::ResolvingAddresses);
        Ok(())
    }

    #[test]
    fn test_transition_job_phase_rejects_out_of_order_moves() -> Result<()> {
        let db = HarvestDb::new_in_memory()?;
        let job = db.create_job("u", "l", JobLimits::default())?;
        assert!(db.transition_job_phase(job.id, JobPhase::HarvestingReviews, JobPhase::Completed).is_err());
        assert!(db.transition_job_phase(job.id, JobPhase::HarvestingReviews, JobPhase::ExtractingContacts).is_err());
        assert!(db.transition_job_phase(job.id, JobPhase::ResolvingAddresses, JobPhase::HarvestingReviews).is_err());
        assert_eq!(db.get_job(job.id)?.unwrap().phase, JobPhase::HarvestingReviews);

        assert!(db.transition_job_phase(job.id, JobPhase::HarvestingReviews, JobPhase::ResolvingAddresses)?);
        assert!(db.transition_job_phase(job.id, JobPhase::ResolvingAddresses, JobPhase::ExtractingContacts)?);
        assert!(db.transition_job_phase(job.id, JobPhase::ExtractingContacts, JobPhase::Completed)?);
        assert!(db.transition_job_phase(job.id, JobPhase::Completed, JobPhase::Error).is_err());
        assert_eq!(db.get_job(job.id)?.unwrap().phase, JobPhase::Completed);
        Ok(())
    }

    #[test]
    fn test_progress_counters_never_decrease() -> Result<()> {
        let db = HarvestDb::new_in_memory()?;
        let job = db.create_job("u", "l", JobLimits::default())?;
        db.update_job_progress(
            job.id,
            Some("page 3"),
            JobCounters { entities_harvested: 30, entities_processed: 0, pages_visited: 3 },
        )?;
        db.update_job_progress(
            job.id,
            None,
            JobCounters { entities_harvested: 20, entities_processed: 0, pages_visited: 2 },
        )?;
        let job = db.get_job(job.id)?.unwrap();
        assert_eq!(job.counters.entities_harvested, 30);
        assert_eq!(job.counters.pages_visited, 3);
        assert_eq!(job.progress_message.as_deref(), Some("page 3"));
        Ok(())
    }

    #[test]
    fn test_claim_next_in_insertion_order_and_exclusive() -> Result<()> {
        let (db, job) = seeded(&["alpha", "beta"])?;
        let first = db.claim_next(job.id)?.expect("alpha");
        let second = db.claim_next(job.id)?.expect("beta");
        assert_eq!(first.name, "alpha");
        assert_eq!(second.name, "beta");
        assert!(db.claim_next(job.id)?.is_none(), "both claimed");

        db.release_claim(first.id)?;
        assert_eq!(db.claim_next(job.id)?.map(|e| e.id), Some(first.id));
        Ok(())
    }

    #[test]
    fn test_claim_next_skips_terminal() -> Result<()> {
        let (db, job) = seeded(&["alpha", "beta"])?;
        let alpha = db.list_entities(job.id)?[0].clone();
        assert!(db.skip_entity(alpha.id)?);
        assert_eq!(db.claim_next(job.id)?.map(|e| e.name), Some("beta".to_string()));
        Ok(())
    }

    #[test]
    fn test_attach_address_only_from_pending() -> Result<()> {
        let (db, job) = seeded(&["alpha"])?;
        let id = db.list_entities(job.id)?[0].id;
        assert!(db.attach_address(id, "https://alpha.test")?);
        assert!(!db.attach_address(id, "https://other.test")?);
        let entity = db.get_entity(id)?.unwrap();
        assert_eq!(entity.status, EntityStatus::AddressSet);
        assert_eq!(entity.address.as_deref(), Some("https://alpha.test"));
        Ok(())
    }

    #[test]
    fn test_record_contacts_chooses_resolved_family() -> Result<()> {
        let (db, job) = seeded(&["alpha", "beta"])?;
        let ids: Vec<i64> = db.list_entities(job.id)?.iter().map(|e| e.id).collect();
        db.attach_address(ids[0], "https://alpha.test")?;
        db.attach_address(ids[1], "https://beta.test")?;

        let contacts = vec!["a@alpha.test".to_string(), "b@alpha.test".to_string()];
        assert_eq!(db.record_contacts(ids[0], &contacts, None)?, Some(EntityStatus::Resolved));
        assert_eq!(db.record_contacts(ids[1], &[], None)?, Some(EntityStatus::ResolvedEmpty));

        let alpha = db.get_entity(ids[0])?.unwrap();
        assert_eq!(alpha.contacts, contacts);
        assert!(alpha.is_consistent());
        assert!(db.get_entity(ids[1])?.unwrap().is_consistent());
        Ok(())
    }

    #[test]
    fn test_record_contacts_never_downgrades_terminal() -> Result<()> {
        let (db, job) = seeded(&["alpha"])?;
        let id = db.list_entities(job.id)?[0].id;
        db.attach_address(id, "https://alpha.test")?;
        assert!(db.skip_entity(id)?);

        let late = vec!["late@alpha.test".to_string()];
        assert_eq!(db.record_contacts(id, &late, None)?, None);
        let entity = db.get_entity(id)?.unwrap();
        assert_eq!(entity.status, EntityStatus::Skipped);
        assert!(entity.contacts.is_empty());
        Ok(())
    }

    #[test]
    fn test_terminal_writes_count_processed_once() -> Result<()> {
        let (db, job) = seeded(&["alpha", "beta"])?;
        let ids: Vec<i64> = db.list_entities(job.id)?.iter().map(|e| e.id).collect();
        db.attach_address(ids[0], "https://alpha.test")?;
        let contacts = vec!["a@alpha.test".to_string()];
        assert_eq!(db.record_contacts(ids[0], &contacts, None)?, Some(EntityStatus::Resolved));
        assert_eq!(db.record_contacts(ids[0], &[], Some("late"))?, None);
        assert!(!db.skip_entity(ids[0])?);

        assert!(db.skip_entity(ids[1])?);
        assert!(!db.skip_entity(ids[1])?);

        assert_eq!(db.get_job(job.id)?.unwrap().counters.entities_processed, 2);
        Ok(())
    }

    #[test]
    fn test_record_contacts_requires_address() -> Result<()> {
        let (db, job) = seeded(&["alpha"])?;
        let id = db.list_entities(job.id)?[0].id;
        assert_eq!(db.record_contacts(id, &["a@alpha.test".to_string()], None)?, None);
        assert_eq!(db.get_entity(id)?.unwrap().status, EntityStatus::PendingAddress);
        Ok(())
    }

    #[test]
    fn test_transition_entity_rejects_illegal_moves() -> Result<()> {
        let (db, job) = seeded(&["alpha"])?;
        let id = db.list_entities(job.id)?[0].id;
        assert!(db.transition_entity(id, EntityStatus::Resolved, EntityStatus::PendingAddress).is_err());
        assert!(!db.transition_entity(id, EntityStatus::AddressSet, EntityStatus::Extracting)?);
        Ok(())
    }

    #[test]
    fn test_detach_address_rolls_back() -> Result<()> {
        let (db, job) = seeded(&["alpha"])?;
        let id = db.list_entities(job.id)?[0].id;
        db.attach_address(id, "https://alpha.test")?;
        assert!(db.detach_address(id, "extraction worker refused")?);
        let entity = db.get_entity(id)?.unwrap();
        assert_eq!(entity.status, EntityStatus::PendingAddress);
        assert!(entity.address.is_none());
        assert_eq!(entity.note.as_deref(), Some("extraction worker refused"));
        Ok(())
    }

    #[test]
    fn test_statistics_per_job_and_global() -> Result<()> {
        let (db, job) = seeded(&["alpha", "beta", "gamma"])?;
        let other = db.create_job("other", "other", JobLimits::default())?;
        db.insert_entities(other.id, &[NewEntity::named("delta")])?;

        let ids: Vec<i64> = db.list_entities(job.id)?.iter().map(|e| e.id).collect();
        db.attach_address(ids[0], "https://alpha.test")?;
        db.record_contacts(ids[0], &["a@alpha.test".to_string(), "b@alpha.test".to_string()], None)?;
        db.skip_entity(ids[1])?;

        let stats = db.statistics(Some(job.id))?;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.pending_address, 1);
        assert_eq!(stats.total_contacts, 2);
        assert_eq!(stats.finished(), 2);

        assert_eq!(db.statistics(None)?.total, 4);
        Ok(())
    }

    #[test]
    fn test_claims_released_on_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("harvest.db");
        let job_id;
        {
            let db = HarvestDb::new(&path)?;
            let job = db.create_job("u", "l", JobLimits::default())?;
            job_id = job.id;
            db.insert_entities(job.id, &[NewEntity::named("alpha")])?;
            assert!(db.claim_next(job.id)?.is_some());
            assert!(db.claim_next(job.id)?.is_none());
        }
        let db = HarvestDb::new(&path)?;
        assert!(db.claim_next(job_id)?.is_some());
        Ok(())
    }

    #[test]
    fn test_set_and_get_setting() -> Result<()> {
        let db = HarvestDb::new_in_memory()?;
        assert!(db.get_setting("auto_advance")?.is_none());
        db.set_setting("auto_advance", "true")?;
        db.set_setting("auto_advance", "false")?;
        assert_eq!(db.get_setting("auto_advance")?.as_deref(), Some("false"));
        Ok(())
    }
}
