//! Job/Phase Controller.
//!
//! Owns the job record: creation and resume, phase transitions, harvest
//! callbacks and completion. True completion is derived from the phase plus
//! the entity statistics, never from the progress message.

use std::sync::Arc;

use harvest_common::{Job, JobCounters, JobLimits, JobPhase, NewEntity, Remaining};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::errors::{HarvestError, HarvestResult};
use crate::harvest::{HarvestRequest, ReviewHarvester};
use crate::server::ws::{WsMessage, broadcast_message};
use crate::store::{DbHandle, HarvestDb, Statistics};

/// Label used when the source URL carries no recognisable app segment.
pub const UNKNOWN_LABEL: &str = "unknown_app";

/// Remaining budget per limit, surfaced to the caller of `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingLimits {
    pub entities: Remaining,
    pub pages: Remaining,
}

impl RemainingLimits {
    pub fn for_job(job: &Job) -> Self {
        Self {
            entities: Remaining::compute(job.limits.max_entities, job.counters.entities_harvested),
            pages: Remaining::compute(job.limits.max_pages, job.counters.pages_visited),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.entities.is_exhausted() || self.pages.is_exhausted()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOutcome {
    pub job: Job,
    pub resumed: bool,
    pub remaining: RemainingLimits,
}

/// Result of a harvester bulk insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub accepted: usize,
    /// Records dropped because the job's entity limit was reached.
    pub truncated: usize,
}

#[derive(Clone)]
pub struct JobController {
    db: DbHandle,
    harvester: Option<Arc<dyn ReviewHarvester>>,
    tx: broadcast::Sender<String>,
}

impl JobController {
    pub fn new(
        db: DbHandle,
        harvester: Option<Arc<dyn ReviewHarvester>>,
        tx: broadcast::Sender<String>,
    ) -> Self {
        Self { db, harvester, tx }
    }

    /// Start a job for `source_url`, or resume the active one when `resume`
    /// is set. Without `resume`, an active job for the same source is an
    /// `AlreadyRunning` error.
    pub async fn start(
        &self,
        source_url: &str,
        limits: JobLimits,
        resume: bool,
    ) -> HarvestResult<StartOutcome> {
        let source_url = validate_source_url(source_url)?;
        let label = source_label(&source_url);
        let limits = limits.normalized();

        let (job, resumed) = self
            .db
            .call(move |db| match db.find_active_job(&source_url)? {
                Some(active) if !resume => Err(HarvestError::AlreadyRunning {
                    job_id: active.id,
                    source_url,
                }
                .into()),
                Some(active) => Ok((db.restart_job(active.id, "Resuming harvest")?, true)),
                None => Ok((db.create_job(&source_url, &label, limits)?, false)),
            })
            .await
            .map_err(HarvestError::from_anyhow)?;

        let remaining = RemainingLimits::for_job(&job);
        info!(
            job_id = job.id,
            source = %job.source_url,
            resumed,
            remaining_entities = %remaining.entities,
            remaining_pages = %remaining.pages,
            "job started"
        );
        broadcast_message(&self.tx, &WsMessage::JobStarted { job: job.clone(), resumed });

        if resumed && remaining.is_exhausted() {
            info!(job_id = job.id, "limits already consumed, skipping harvest");
            let job = self.complete_harvest(job.id).await?;
            return Ok(StartOutcome { job, resumed, remaining });
        }

        if let Some(harvester) = &self.harvester {
            let request = HarvestRequest {
                job_id: job.id,
                source_url: job.source_url.clone(),
                max_entities: remaining.entities.as_limit(),
                max_pages: remaining.pages.as_limit(),
                resume: resumed,
            };
            if let Err(e) = harvester.start(&request).await {
                warn!(job_id = job.id, error = %e, "harvest dispatch failed");
                self.fail(job.id, &format!("{:#}", e)).await?;
                return Err(HarvestError::Other(e));
            }
        }

        Ok(StartOutcome { job, resumed, remaining })
    }

    pub async fn get(&self, id: i64) -> HarvestResult<Job> {
        self.db
            .call(move |db| require_job(db, id))
            .await
            .map_err(HarvestError::from_anyhow)
    }

    /// All jobs, newest first.
    pub async fn list(&self) -> HarvestResult<Vec<Job>> {
        self.db
            .call(|db| db.list_jobs())
            .await
            .map_err(HarvestError::from_anyhow)
    }

    pub async fn statistics(&self, job_id: Option<i64>) -> HarvestResult<Statistics> {
        self.db
            .call(move |db| {
                if let Some(id) = job_id {
                    require_job(db, id)?;
                }
                db.statistics(job_id)
            })
            .await
            .map_err(HarvestError::from_anyhow)
    }

    /// Advisory progress from a collaborator. Counters only ever grow; reports
    /// for terminal jobs are ignored.
    pub async fn report_progress(
        &self,
        id: i64,
        message: Option<String>,
        counters: JobCounters,
    ) -> HarvestResult<Job> {
        let job = self
            .db
            .call(move |db| {
                let job = require_job(db, id)?;
                if job.is_active() {
                    db.update_job_progress(id, message.as_deref(), counters)?;
                }
                require_job(db, id)
            })
            .await
            .map_err(HarvestError::from_anyhow)?;
        broadcast_message(
            &self.tx,
            &WsMessage::JobProgress {
                job_id: job.id,
                message: job.progress_message.clone(),
                counters: job.counters,
            },
        );
        Ok(job)
    }

    /// Bulk insert from the harvester. Records beyond the job's entity limit
    /// are dropped.
    pub async fn ingest_entities(
        &self,
        id: i64,
        entities: Vec<NewEntity>,
    ) -> HarvestResult<IngestOutcome> {
        if let Some(pos) = entities.iter().position(|e| e.name.trim().is_empty()) {
            return Err(HarvestError::invalid(
                "entities",
                format!("record {} has an empty name", pos),
            ));
        }

        let outcome = self
            .db
            .call(move |db| {
                let job = require_job(db, id)?;
                if job.phase != JobPhase::HarvestingReviews {
                    return Err(HarvestError::invalid(
                        "phase",
                        format!("job {} is {}, entities are only accepted while harvesting", id, job.phase),
                    )
                    .into());
                }
                let existing = db.count_entities(id)?;
                let allowed = match Remaining::compute(job.limits.max_entities, existing) {
                    Remaining::Unlimited => entities.len(),
                    Remaining::Limited(n) => entities.len().min(n as usize),
                };
                let truncated = entities.len() - allowed;
                let accepted = db.insert_entities(id, &entities[..allowed])?;
                let counters = JobCounters {
                    entities_harvested: db.count_entities(id)?,
                    ..job.counters
                };
                db.update_job_progress(id, None, counters)?;
                Ok(IngestOutcome { accepted, truncated })
            })
            .await
            .map_err(HarvestError::from_anyhow)?;

        if outcome.truncated > 0 {
            info!(job_id = id, truncated = outcome.truncated, "entity limit reached, batch truncated");
        }
        broadcast_message(
            &self.tx,
            &WsMessage::EntitiesHarvested {
                job_id: id,
                accepted: outcome.accepted,
            },
        );
        Ok(outcome)
    }

    /// Harvest finished: `harvesting_reviews → resolving_addresses`, then
    /// reconcile (a job with nothing to resolve completes right away).
    /// Repeated calls are no-ops.
    pub async fn complete_harvest(&self, id: i64) -> HarvestResult<Job> {
        let moved = self
            .db
            .call(move |db| {
                if require_job(db, id)?.phase != JobPhase::HarvestingReviews {
                    return Ok(false);
                }
                db.update_job_progress(id, Some("Harvest complete"), JobCounters::default())?;
                db.transition_job_phase(id, JobPhase::HarvestingReviews, JobPhase::ResolvingAddresses)
            })
            .await
            .map_err(HarvestError::from_anyhow)?;
        if moved {
            self.announce_phase(id, JobPhase::HarvestingReviews, JobPhase::ResolvingAddresses);
        }
        self.reconcile(id).await
    }

    /// Mark the job as failed. Already-terminal jobs are returned unchanged.
    pub async fn fail(&self, id: i64, error: &str) -> HarvestResult<Job> {
        let error = error.to_string();
        let (job, previous) = self
            .db
            .call(move |db| {
                let previous = require_job(db, id)?.phase;
                db.fail_job(id, &error)?;
                Ok((require_job(db, id)?, previous))
            })
            .await
            .map_err(HarvestError::from_anyhow)?;
        if previous != job.phase {
            warn!(job_id = id, error = ?job.error, "job failed");
            self.announce_phase(id, previous, job.phase);
        }
        Ok(job)
    }

    /// Move the job forward as far as the entity statistics allow:
    /// resolving → extracting once nothing awaits an address, and
    /// extracting → completed once no extraction is in flight either.
    pub async fn reconcile(&self, id: i64) -> HarvestResult<Job> {
        let (job, steps) = self
            .db
            .call(move |db| {
                let mut steps = Vec::new();
                loop {
                    let job = require_job(db, id)?;
                    let stats = db.statistics(Some(id))?;
                    let next = match job.phase {
                        JobPhase::ResolvingAddresses if stats.awaiting_address() == 0 => {
                            JobPhase::ExtractingContacts
                        }
                        JobPhase::ExtractingContacts
                            if stats.awaiting_address() == 0 && stats.extraction_in_flight() == 0 =>
                        {
                            JobPhase::Completed
                        }
                        _ => return Ok((job, steps)),
                    };
                    if !db.transition_job_phase(id, job.phase, next)? {
                        return Ok((require_job(db, id)?, steps));
                    }
                    if next == JobPhase::Completed {
                        let message = format!(
                            "Completed: {} of {} entities ({} resolved, {} without contacts, {} skipped)",
                            stats.finished(),
                            stats.total,
                            stats.resolved,
                            stats.resolved_empty,
                            stats.skipped
                        );
                        db.update_job_progress(id, Some(&message), JobCounters::default())?;
                    }
                    steps.push((job.phase, next));
                }
            })
            .await
            .map_err(HarvestError::from_anyhow)?;

        for (from, to) in steps {
            self.announce_phase(id, from, to);
        }
        Ok(job)
    }

    fn announce_phase(&self, job_id: i64, from: JobPhase, to: JobPhase) {
        info!(job_id, %from, %to, "job phase changed");
        broadcast_message(&self.tx, &WsMessage::JobPhaseChanged { job_id, from, to });
    }
}

fn require_job(db: &HarvestDb, id: i64) -> anyhow::Result<Job> {
    db.get_job(id)?
        .ok_or_else(|| HarvestError::JobNotFound { id }.into())
}

fn validate_source_url(raw: &str) -> HarvestResult<String> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| HarvestError::invalid("source_url", format!("'{}': {}", trimmed, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(HarvestError::invalid(
            "source_url",
            format!("'{}' is not an http(s) URL", trimmed),
        ));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

/// Display label for a source: the path segment before `reviews`.
///
/// `https://apps.example.com/acme-shop/reviews?page=2` → `acme-shop`.
pub fn source_label(source_url: &str) -> String {
    let Ok(url) = Url::parse(source_url) else {
        return UNKNOWN_LABEL.to_string();
    };
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    segments
        .iter()
        .position(|seg| *seg == "reviews")
        .filter(|pos| *pos > 0)
        .map(|pos| segments[pos - 1].to_string())
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string())
}
