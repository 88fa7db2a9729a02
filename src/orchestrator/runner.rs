use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use harvest_common::{Candidate, Entity, EntityStatus, Job, JobPhase, Recommendation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::guard::{LoopGuard, LoopState, Ticket};
use super::modes::{ModeSettings, Modes, ModesPatch};
use crate::config::HarvestToml;
use crate::errors::{HarvestError, HarvestResult};
use crate::extraction::{
    CompletionWatcher, ContactExtractor, ExtractionAck, ExtractionRequest, WatchConfig,
    WatchOutcome, extractor_from_config,
};
use crate::harvest::{HttpHarvester, ReviewHarvester};
use crate::job::JobController;
use crate::queue::EntityQueue;
use crate::search::{
    BrokerConfig, CandidateScorer, CandidateSelector, Decision, HttpScorer, SearchAgent,
    SearchBroker, agent_from_config,
};
use crate::server::ws::{WsMessage, broadcast_message};
use crate::store::{DbHandle, Statistics};

/// Out-of-process collaborators. Any of them may be absent.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub harvester: Option<Arc<dyn ReviewHarvester>>,
    pub search_agent: Option<Arc<dyn SearchAgent>>,
    pub scorer: Option<Arc<dyn CandidateScorer>>,
    pub extractor: Option<Arc<dyn ContactExtractor>>,
}

impl Collaborators {
    pub fn from_config(toml: &HarvestToml) -> Result<Self> {
        let harvester: Option<Arc<dyn ReviewHarvester>> =
            match toml.harvest.worker_url.as_deref().filter(|u| !u.trim().is_empty()) {
                Some(url) => Some(Arc::new(HttpHarvester::new(url)?)),
                None => None,
            };
        let scorer: Option<Arc<dyn CandidateScorer>> =
            match toml.selection.scorer_url.as_deref().filter(|u| !u.trim().is_empty()) {
                Some(url) => Some(Arc::new(HttpScorer::new(url)?)),
                None => None,
            };
        Ok(Self {
            harvester,
            search_agent: agent_from_config(&toml.search)?,
            scorer,
            extractor: extractor_from_config(&toml.extraction)?,
        })
    }
}

/// Timing and initial modes for the loop.
#[derive(Debug, Clone, Default)]
pub struct LoopSettings {
    pub broker: BrokerConfig,
    pub watch: WatchConfig,
    pub default_modes: Modes,
}

impl From<&HarvestToml> for LoopSettings {
    fn from(toml: &HarvestToml) -> Self {
        Self {
            broker: BrokerConfig::from(&toml.search),
            watch: WatchConfig::from(&toml.watch),
            default_modes: Modes::from(toml.modes),
        }
    }
}

/// Candidates presented for the owned entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSet {
    pub entity_id: i64,
    pub request_id: String,
    pub candidates: Vec<Candidate>,
    pub recommendation: Option<Recommendation>,
}

/// Result of one loop decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// The job is still harvesting; nothing to pull yet.
    NotReady { job: Job },
    /// The job is completed or failed.
    JobFinished { job: Job },
    /// The loop already owns an entity.
    Busy { state: LoopState },
    /// No pending entity is left.
    Exhausted { job: Job },
    /// The pulled entity already has an address; its extraction is watched.
    Watching { entity: Entity },
    /// Address resolution started for the pulled entity.
    Resolving { entity: Entity },
    /// The pulled entity waits for the operator.
    AwaitingOperator {
        entity: Entity,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStart {
    Started,
    /// A resolution or extraction is already in flight, or the entity is not
    /// the one the loop owns.
    Ignored,
}

/// What the approval surface renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSnapshot {
    pub state: LoopState,
    pub modes: Modes,
    pub entity: Option<Entity>,
    pub candidates: Option<CandidateSet>,
    pub job: Option<Job>,
    pub statistics: Option<Statistics>,
}

/// The top-level coordinator: pulls entities, resolves their addresses,
/// waits for extraction and advances.
#[derive(Clone)]
pub struct Orchestrator {
    jobs: JobController,
    queue: EntityQueue,
    broker: SearchBroker,
    selector: CandidateSelector,
    extractor: Option<Arc<dyn ContactExtractor>>,
    watcher: CompletionWatcher,
    modes: ModeSettings,
    guard: Arc<LoopGuard>,
    candidates: Arc<Mutex<Option<CandidateSet>>>,
    tx: broadcast::Sender<String>,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        collaborators: Collaborators,
        settings: LoopSettings,
        tx: broadcast::Sender<String>,
    ) -> Self {
        let queue = EntityQueue::new(db.clone());
        Self {
            jobs: JobController::new(db.clone(), collaborators.harvester, tx.clone()),
            broker: SearchBroker::new(collaborators.search_agent, settings.broker),
            selector: CandidateSelector::new(collaborators.scorer),
            extractor: collaborators.extractor,
            watcher: CompletionWatcher::new(queue.clone(), settings.watch),
            modes: ModeSettings::new(db, settings.default_modes),
            queue,
            guard: Arc::new(LoopGuard::new()),
            candidates: Arc::new(Mutex::new(None)),
            tx,
        }
    }

    pub fn jobs(&self) -> &JobController {
        &self.jobs
    }

    pub fn queue(&self) -> &EntityQueue {
        &self.queue
    }

    pub fn broker(&self) -> &SearchBroker {
        &self.broker
    }

    pub fn state(&self) -> LoopState {
        self.guard.state()
    }

    pub fn events(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub async fn modes(&self) -> HarvestResult<Modes> {
        self.modes.read().await
    }

    pub async fn update_modes(&self, patch: ModesPatch) -> HarvestResult<Modes> {
        let modes = self.modes.update(patch).await?;
        info!(auto_advance = modes.auto_advance, auto_select = modes.auto_select, "modes updated");
        broadcast_message(&self.tx, &WsMessage::ModesChanged { modes });
        Ok(modes)
    }

    // ── Loop decisions ────────────────────────────────────────────────

    /// One loop decision for `job_id`: pull the next pending entity and act
    /// on it according to its status and the modes read right now.
    pub async fn advance(&self, job_id: i64) -> HarvestResult<AdvanceOutcome> {
        let job = self.jobs.get(job_id).await?;
        if job.phase.is_terminal() {
            return Ok(AdvanceOutcome::JobFinished { job });
        }
        if job.phase == JobPhase::HarvestingReviews {
            return Ok(AdvanceOutcome::NotReady { job });
        }

        let state = self.guard.state();
        if !state.is_idle() {
            debug!(job_id, ?state, "advance while loop is busy ignored");
            return Ok(AdvanceOutcome::Busy { state });
        }

        let Some(entity) = self.queue.next(job_id).await? else {
            let job = self.jobs.reconcile(job_id).await?;
            info!(job_id, phase = %job.phase, "queue exhausted");
            return Ok(AdvanceOutcome::Exhausted { job });
        };

        // Re-check after the claim: another decision may have won meanwhile.
        if !self.guard.claim(job_id, entity.id) {
            self.queue.release(entity.id).await?;
            let state = self.guard.state();
            debug!(job_id, entity_id = entity.id, ?state, "lost the race for the loop");
            return Ok(AdvanceOutcome::Busy { state });
        }
        self.set_candidates(None);
        info!(job_id, entity_id = entity.id, name = %entity.name, status = %entity.status, "entity claimed");
        broadcast_message(&self.tx, &WsMessage::EntityClaimed { entity: entity.clone() });

        match entity.status {
            EntityStatus::AddressSet | EntityStatus::Extracting => {
                self.start_watch(entity.id);
                Ok(AdvanceOutcome::Watching { entity })
            }
            _ => {
                let modes = self.modes.read().await?;
                if !modes.auto_advance {
                    return Ok(AdvanceOutcome::AwaitingOperator { entity, reason: None });
                }
                if !self.broker.is_available() {
                    let reason = HarvestError::AgentUnavailable.to_string();
                    self.report_recoverable(Some(entity.id), &reason);
                    return Ok(AdvanceOutcome::AwaitingOperator {
                        entity,
                        reason: Some(reason),
                    });
                }
                match self.start_resolution(&entity) {
                    ResolveStart::Started => Ok(AdvanceOutcome::Resolving { entity }),
                    ResolveStart::Ignored => Ok(AdvanceOutcome::AwaitingOperator { entity, reason: None }),
                }
            }
        }
    }

    /// Operator-triggered address search for the owned entity. Re-entry while
    /// a search or extraction is in flight is a silent no-op.
    pub async fn resolve(&self, entity_id: i64) -> HarvestResult<ResolveStart> {
        let entity = self.queue.get_by_id(entity_id).await?;
        if entity.status != EntityStatus::PendingAddress {
            return Err(HarvestError::invalid(
                "status",
                format!("entity {} is {}, only pending_address entities are searched", entity_id, entity.status),
            ));
        }
        if !self.broker.is_available() {
            return Err(HarvestError::AgentUnavailable);
        }
        Ok(self.start_resolution(&entity))
    }

    fn start_resolution(&self, entity: &Entity) -> ResolveStart {
        let Some(ticket) = self.guard.begin_resolving(entity.id) else {
            debug!(entity_id = entity.id, state = ?self.guard.state(), "resolve re-entry ignored");
            return ResolveStart::Ignored;
        };
        let this = self.clone();
        let entity = entity.clone();
        tokio::spawn(async move { this.run_resolution(ticket, entity).await });
        ResolveStart::Started
    }

    async fn run_resolution(self, ticket: Ticket, entity: Entity) {
        let query = entity.search_query();
        let context = json!({
            "job_id": entity.job_id,
            "entity_id": entity.id,
            "name": entity.name,
            "region": entity.region,
        });

        let searched = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => {
                debug!(entity_id = entity.id, "resolution cancelled");
                return;
            }
            result = self.submit_and_wait(&entity, &query, context) => result,
        };

        if !self.guard.finish_resolving(&ticket) {
            debug!(entity_id = entity.id, "stale resolution result dropped");
            return;
        }

        let (request_id, candidates) = match searched {
            Ok(found) => found,
            Err(e) => {
                warn!(entity_id = entity.id, error = %e, "address resolution failed");
                self.report_recoverable(Some(entity.id), &e.to_string());
                return;
            }
        };

        let ranked = self.selector.rank(candidates);
        let recommendation = self.selector.recommend(&entity, &ranked).await;
        if !self.guard.holds(&ticket) {
            debug!(entity_id = entity.id, "entity changed hands while scoring");
            return;
        }

        info!(
            entity_id = entity.id,
            %request_id,
            candidates = ranked.len(),
            confidence = recommendation.as_ref().map(|r| r.confidence),
            "candidates ready"
        );
        self.set_candidates(Some(CandidateSet {
            entity_id: entity.id,
            request_id: request_id.clone(),
            candidates: ranked.clone(),
            recommendation: recommendation.clone(),
        }));
        broadcast_message(
            &self.tx,
            &WsMessage::CandidatesReady {
                entity_id: entity.id,
                request_id,
                candidates: ranked.clone(),
                recommendation: recommendation.clone(),
            },
        );

        // Read at the moment of decision, not when the search started.
        let auto_select = match self.modes.read().await {
            Ok(modes) => modes.auto_select,
            Err(e) => {
                warn!(error = %e, "could not read modes, leaving the choice to the operator");
                false
            }
        };
        if !self.guard.holds(&ticket) {
            return;
        }
        if let Decision::AutoAttach { index, address } =
            CandidateSelector::decide(&ranked, recommendation.as_ref(), auto_select)
        {
            info!(entity_id = entity.id, index, %address, "auto-selecting candidate");
            if let Err(e) = self.attach(entity.id, &address, true).await {
                warn!(entity_id = entity.id, error = %e, "auto-select attach failed");
                self.report_recoverable(Some(entity.id), &e.to_string());
            }
        }
    }

    async fn submit_and_wait(
        &self,
        entity: &Entity,
        query: &str,
        context: serde_json::Value,
    ) -> HarvestResult<(String, Vec<Candidate>)> {
        let request_id = self.broker.submit(query, context).await?;
        broadcast_message(
            &self.tx,
            &WsMessage::SearchStarted {
                entity_id: entity.id,
                request_id: request_id.clone(),
                query: query.to_string(),
            },
        );
        let candidates = self.broker.wait_for(&request_id).await?;
        Ok((request_id, candidates))
    }

    // ── Operator and collaborator writes ──────────────────────────────

    /// Attach an address (manual entry or a chosen candidate) and start
    /// extraction. Malformed addresses are rejected with the entity untouched.
    pub async fn attach_address(&self, entity_id: i64, raw: &str) -> HarvestResult<Entity> {
        self.attach(entity_id, raw, false).await
    }

    async fn attach(&self, entity_id: i64, raw: &str, automatic: bool) -> HarvestResult<Entity> {
        let entity = self.queue.attach_address(entity_id, raw).await?;
        let Some(address) = entity.address.clone() else {
            return Err(HarvestError::Other(anyhow::anyhow!(
                "entity {} has no address after attach",
                entity_id
            )));
        };

        let entity = match self.start_extraction(&entity, &address).await {
            Ok(entity) => entity,
            Err(e) => {
                // Never leave an address attached without extraction running.
                self.queue
                    .detach_address(entity_id, &format!("Extraction could not start: {}", e))
                    .await?;
                self.report_recoverable(Some(entity_id), &e.to_string());
                return Err(e);
            }
        };

        info!(entity_id, %address, automatic, status = %entity.status, "address attached");
        broadcast_message(
            &self.tx,
            &WsMessage::AddressAttached {
                entity: entity.clone(),
                automatic,
            },
        );

        if self.guard.state().entity_id() == Some(entity_id) {
            self.start_watch(entity_id);
        }
        Ok(entity)
    }

    async fn start_extraction(&self, entity: &Entity, address: &str) -> HarvestResult<Entity> {
        let Some(extractor) = &self.extractor else {
            // No push worker: the entity waits in address_set for a callback.
            return Ok(entity.clone());
        };
        let request = ExtractionRequest {
            entity_id: entity.id,
            address: address.to_string(),
        };
        match extractor.start(&request).await.map_err(HarvestError::Other)? {
            ExtractionAck::Accepted => {
                self.queue.mark_extracting(entity.id).await?;
            }
            ExtractionAck::Finished(contacts) => {
                self.queue.record_contacts(entity.id, contacts, None).await?;
            }
        }
        self.queue.get_by_id(entity.id).await
    }

    /// Extraction callback. A late report for an entity that already reached
    /// a terminal status is ignored.
    pub async fn record_contacts(&self, entity_id: i64, contacts: Vec<String>) -> HarvestResult<Entity> {
        let before = self.queue.get_by_id(entity_id).await?;
        if before.status == EntityStatus::PendingAddress {
            return Err(HarvestError::invalid(
                "status",
                format!("entity {} has no address yet", entity_id),
            ));
        }
        match self.queue.record_contacts(entity_id, contacts, None).await? {
            Some(status) => info!(entity_id, %status, "extraction reported"),
            None => debug!(entity_id, status = %before.status, "late extraction report ignored"),
        }
        let entity = self.queue.get_by_id(entity_id).await?;
        if self.guard.state().entity_id() != Some(entity_id) {
            self.jobs.reconcile(entity.job_id).await?;
        }
        Ok(entity)
    }

    /// Skip an entity from any status. Cancels whatever the loop had in
    /// flight for it and releases the loop immediately.
    pub async fn skip(&self, entity_id: i64) -> HarvestResult<Entity> {
        let entity = self.queue.skip(entity_id).await?;

        if let Some(previous) = self.guard.release_entity(entity_id) {
            debug!(entity_id, ?previous, "loop released by skip");
            self.clear_candidates_for(entity_id);
        }
        broadcast_message(&self.tx, &WsMessage::EntitySkipped { entity: entity.clone() });

        let job = self.jobs.reconcile(entity.job_id).await?;
        self.maybe_auto_advance(job.id).await;
        Ok(entity)
    }

    // ── Extraction watch ──────────────────────────────────────────────

    fn start_watch(&self, entity_id: i64) {
        let Some(ticket) = self.guard.begin_extracting(entity_id) else {
            debug!(entity_id, state = ?self.guard.state(), "watch not started, loop does not own entity");
            return;
        };
        let this = self.clone();
        tokio::spawn(async move { this.run_watch(ticket).await });
    }

    async fn run_watch(self, ticket: Ticket) {
        let entity_id = ticket.entity_id;
        match self.watcher.watch(entity_id, ticket.cancel.clone()).await {
            Ok(WatchOutcome::Cancelled) => {}
            Ok(WatchOutcome::Finished(entity)) => self.finish_entity(&ticket, entity, false).await,
            Ok(WatchOutcome::TimedOut(entity)) => self.finish_entity(&ticket, entity, true).await,
            Err(e) => {
                warn!(entity_id, error = %e, "completion watch failed");
                if self.guard.release_ticket(&ticket)
                    && let Err(e) = self.queue.release(entity_id).await
                {
                    warn!(entity_id, error = %e, "failed to release claim");
                }
                self.report_recoverable(Some(entity_id), &e.to_string());
            }
        }
    }

    async fn finish_entity(&self, ticket: &Ticket, entity: Entity, timed_out: bool) {
        // Guards are cleared before anything decides about the next entity.
        if !self.guard.release_ticket(ticket) {
            debug!(entity_id = entity.id, "finish for a released entity ignored");
            return;
        }
        self.clear_candidates_for(entity.id);

        info!(entity_id = entity.id, status = %entity.status, contacts = entity.contacts.len(), timed_out, "entity finished");
        broadcast_message(
            &self.tx,
            &WsMessage::EntityFinished {
                entity: entity.clone(),
                timed_out,
            },
        );

        let job_id = ticket.job_id;
        match self.settle_finished(job_id, &entity).await {
            Ok(job) => self.maybe_auto_advance(job.id).await,
            Err(e) => warn!(job_id, error = %e, "post-finish bookkeeping failed"),
        }
    }

    async fn settle_finished(&self, job_id: i64, entity: &Entity) -> HarvestResult<Job> {
        self.queue.release(entity.id).await?;
        self.jobs.reconcile(job_id).await
    }

    /// Schedule the next decision if auto-advance is on right now.
    async fn maybe_auto_advance(&self, job_id: i64) {
        match self.modes.read().await {
            Ok(modes) if modes.auto_advance => self.schedule_advance(job_id),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read modes, not advancing"),
        }
    }

    fn schedule_advance(&self, job_id: i64) {
        let this = self.clone();
        let next: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            match this.advance(job_id).await {
                Ok(outcome) => debug!(job_id, ?outcome, "auto-advance"),
                Err(e) => warn!(job_id, error = %e, "auto-advance failed"),
            }
        });
        tokio::spawn(next);
    }

    // ── Snapshot ──────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> HarvestResult<LoopSnapshot> {
        let state = self.guard.state();
        let modes = self.modes.read().await?;
        let entity = match state.entity_id() {
            Some(id) => Some(self.queue.get_by_id(id).await?),
            None => None,
        };
        let job = match state.job_id() {
            Some(id) => Some(self.jobs.get(id).await?),
            None => None,
        };
        let statistics = match &job {
            Some(job) => Some(self.jobs.statistics(Some(job.id)).await?),
            None => None,
        };
        let candidates = self
            .current_candidates()
            .filter(|set| Some(set.entity_id) == state.entity_id());
        Ok(LoopSnapshot {
            state,
            modes,
            entity,
            candidates,
            job,
            statistics,
        })
    }

    pub fn current_candidates(&self) -> Option<CandidateSet> {
        self.candidates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_candidates(&self, set: Option<CandidateSet>) {
        *self
            .candidates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = set;
    }

    fn clear_candidates_for(&self, entity_id: i64) {
        let mut current = self
            .candidates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_ref().is_some_and(|set| set.entity_id == entity_id) {
            *current = None;
        }
    }

    fn report_recoverable(&self, entity_id: Option<i64>, message: &str) {
        broadcast_message(
            &self.tx,
            &WsMessage::RecoverableError {
                entity_id,
                message: message.to_string(),
                manual_entry: entity_id.is_some(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::PullAgent;
    use async_trait::async_trait;
    use harvest_common::{JobLimits, NewEntity};
    use std::time::Duration;

    const SOURCE: &str = "https://apps.example.com/acme/reviews";

    struct FixedScorer(f64);

    #[async_trait]
    impl CandidateScorer for FixedScorer {
        async fn score(&self, _request: &crate::search::selector::ScoreRequest) -> Result<Recommendation> {
            Ok(Recommendation::new(0, self.0, "fixed"))
        }
    }

    /// Flips auto-select while the candidates are being scored.
    struct TogglingScorer {
        modes: ModeSettings,
        auto_select: bool,
    }

    #[async_trait]
    impl CandidateScorer for TogglingScorer {
        async fn score(&self, _request: &crate::search::selector::ScoreRequest) -> Result<Recommendation> {
            self.modes
                .update(ModesPatch { auto_select: Some(self.auto_select), auto_advance: None })
                .await?;
            Ok(Recommendation::new(0, 0.95, "toggled"))
        }
    }

    struct RefusingExtractor;

    #[async_trait]
    impl ContactExtractor for RefusingExtractor {
        async fn start(&self, _request: &ExtractionRequest) -> Result<ExtractionAck> {
            anyhow::bail!("worker at capacity")
        }
    }

    struct SyncExtractor;

    #[async_trait]
    impl ContactExtractor for SyncExtractor {
        async fn start(&self, request: &ExtractionRequest) -> Result<ExtractionAck> {
            Ok(ExtractionAck::Finished(vec![format!("info@{}", request.address.trim_start_matches("https://"))]))
        }
    }

    fn orchestrator_with(db: DbHandle, collaborators: Collaborators) -> Orchestrator {
        let (tx, _) = broadcast::channel(256);
        Orchestrator::new(db, collaborators, LoopSettings::default(), tx)
    }

    fn orchestrator(collaborators: Collaborators) -> Orchestrator {
        orchestrator_with(DbHandle::in_memory().unwrap(), collaborators)
    }

    fn with_agent(scorer: Option<Arc<dyn CandidateScorer>>) -> Collaborators {
        Collaborators {
            search_agent: Some(Arc::new(PullAgent)),
            scorer,
            ..Default::default()
        }
    }

    async fn ready_job(orch: &Orchestrator, names: &[&str]) -> i64 {
        let job = orch.jobs().start(SOURCE, JobLimits::default(), false).await.unwrap().job;
        orch.jobs()
            .ingest_entities(job.id, names.iter().map(|n| NewEntity::named(n)).collect())
            .await
            .unwrap();
        orch.jobs().complete_harvest(job.id).await.unwrap();
        job.id
    }

    async fn wait_until(orch: &Orchestrator, check: impl Fn(&Orchestrator) -> bool) {
        for _ in 0..600 {
            if check(orch) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_for_status(orch: &Orchestrator, entity_id: i64, status: EntityStatus) {
        for _ in 0..600 {
            if orch.queue().get_by_id(entity_id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("entity {} never reached {}", entity_id, status);
    }

    async fn answer_next_search(orch: &Orchestrator, address: &str) -> String {
        for _ in 0..600 {
            if let Some(pending) = orch.broker().pending().await.into_iter().next() {
                orch.broker()
                    .complete(&pending.request_id, vec![Candidate::new(address)])
                    .await
                    .unwrap();
                return pending.request_id;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("no search was submitted");
    }

    #[tokio::test]
    async fn test_advance_before_harvest_completes_is_not_ready() {
        let orch = orchestrator(Collaborators::default());
        let job = orch.jobs().start(SOURCE, JobLimits::default(), false).await.unwrap().job;
        assert!(matches!(orch.advance(job.id).await.unwrap(), AdvanceOutcome::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_manual_mode_waits_for_operator() {
        let orch = orchestrator(with_agent(None));
        let job_id = ready_job(&orch, &["alpha", "beta"]).await;

        match orch.advance(job_id).await.unwrap() {
            AdvanceOutcome::AwaitingOperator { entity, reason } => {
                assert_eq!(entity.name, "alpha");
                assert!(reason.is_none());
            }
            other => panic!("Expected AwaitingOperator, got {:?}", other),
        }
        assert!(matches!(orch.advance(job_id).await.unwrap(), AdvanceOutcome::Busy { .. }));
    }

    #[tokio::test]
    async fn test_auto_advance_without_agent_falls_back_to_manual() {
        let orch = orchestrator(Collaborators::default());
        orch.update_modes(ModesPatch { auto_advance: Some(true), auto_select: None }).await.unwrap();
        let job_id = ready_job(&orch, &["alpha"]).await;
        let mut events = orch.events();

        match orch.advance(job_id).await.unwrap() {
            AdvanceOutcome::AwaitingOperator { reason, .. } => {
                assert!(reason.unwrap().contains("enter the address manually"));
            }
            other => panic!("Expected AwaitingOperator, got {:?}", other),
        }
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= event.contains("RecoverableError");
        }
        assert!(saw_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_is_not_reentrant() {
        let orch = orchestrator(with_agent(None));
        let job_id = ready_job(&orch, &["alpha"]).await;
        let entity = match orch.advance(job_id).await.unwrap() {
            AdvanceOutcome::AwaitingOperator { entity, .. } => entity,
            other => panic!("Expected AwaitingOperator, got {:?}", other),
        };

        assert_eq!(orch.resolve(entity.id).await.unwrap(), ResolveStart::Started);
        assert_eq!(orch.resolve(entity.id).await.unwrap(), ResolveStart::Ignored);
        assert!(matches!(orch.state(), LoopState::Resolving { .. }));

        answer_next_search(&orch, "https://alpha.test").await;
        wait_until(&orch, |o| o.current_candidates().is_some()).await;
        assert_eq!(orch.broker().pending().await.len(), 0, "exactly one search was submitted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_presents_candidates() {
        let orch = orchestrator(with_agent(Some(Arc::new(FixedScorer(0.5)))));
        orch.update_modes(ModesPatch { auto_advance: Some(true), auto_select: Some(true) })
            .await
            .unwrap();
        let job_id = ready_job(&orch, &["alpha"]).await;
        let entity = match orch.advance(job_id).await.unwrap() {
            AdvanceOutcome::Resolving { entity } => entity,
            other => panic!("Expected Resolving, got {:?}", other),
        };

        answer_next_search(&orch, "https://alpha.test").await;
        wait_until(&orch, |o| o.current_candidates().is_some()).await;

        assert_eq!(orch.queue().get_by_id(entity.id).await.unwrap().status, EntityStatus::PendingAddress);
        assert!(matches!(orch.state(), LoopState::Owned { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_select_uses_mode_at_decision_time() {
        let db = DbHandle::in_memory().unwrap();
        let scorer = TogglingScorer {
            modes: ModeSettings::new(db.clone(), Modes::default()),
            auto_select: true,
        };
        let orch = orchestrator_with(db, with_agent(Some(Arc::new(scorer))));
        orch.update_modes(ModesPatch { auto_advance: Some(true), auto_select: Some(false) })
            .await
            .unwrap();
        let job_id = ready_job(&orch, &["alpha"]).await;
        let AdvanceOutcome::Resolving { entity } = orch.advance(job_id).await.unwrap() else {
            panic!("Expected Resolving");
        };

        answer_next_search(&orch, "https://alpha.test").await;
        wait_for_status(&orch, entity.id, EntityStatus::AddressSet).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_select_switched_off_before_decision() {
        let db = DbHandle::in_memory().unwrap();
        let scorer = TogglingScorer {
            modes: ModeSettings::new(db.clone(), Modes::default()),
            auto_select: false,
        };
        let orch = orchestrator_with(db, with_agent(Some(Arc::new(scorer))));
        orch.update_modes(ModesPatch { auto_advance: Some(true), auto_select: Some(true) })
            .await
            .unwrap();
        let job_id = ready_job(&orch, &["alpha"]).await;
        let AdvanceOutcome::Resolving { entity } = orch.advance(job_id).await.unwrap() else {
            panic!("Expected Resolving");
        };

        answer_next_search(&orch, "https://alpha.test").await;
        wait_until(&orch, |o| o.current_candidates().is_some()).await;
        assert_eq!(orch.queue().get_by_id(entity.id).await.unwrap().status, EntityStatus::PendingAddress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_timeout_is_recoverable() {
        let orch = orchestrator(with_agent(None));
        orch.update_modes(ModesPatch { auto_advance: Some(true), auto_select: None }).await.unwrap();
        let job_id = ready_job(&orch, &["alpha"]).await;
        let mut events = orch.events();
        let AdvanceOutcome::Resolving { entity } = orch.advance(job_id).await.unwrap() else {
            panic!("Expected Resolving");
        };

        wait_until(&orch, |o| matches!(o.state(), LoopState::Owned { .. })).await;
        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            saw_timeout |= event.contains("timed out");
        }
        assert!(saw_timeout);
        let job = orch.jobs().get(job_id).await.unwrap();
        assert_eq!(job.phase, JobPhase::ResolvingAddresses, "job is not aborted");

        let entity = orch.attach_address(entity.id, "alpha.test").await.unwrap();
        assert_eq!(entity.address.as_deref(), Some("https://alpha.test"));
    }

    #[tokio::test]
    async fn test_attach_rolls_back_when_extraction_refuses() {
        let orch = orchestrator(Collaborators {
            extractor: Some(Arc::new(RefusingExtractor)),
            ..Default::default()
        });
        let job_id = ready_job(&orch, &["alpha"]).await;
        let entity = orch.queue().list(job_id).await.unwrap().remove(0);

        assert!(orch.attach_address(entity.id, "alpha.test").await.is_err());
        let entity = orch.queue().get_by_id(entity.id).await.unwrap();
        assert_eq!(entity.status, EntityStatus::PendingAddress);
        assert!(entity.address.is_none());
        assert!(entity.note.unwrap().contains("worker at capacity"));
    }

    #[tokio::test]
    async fn test_attach_invalid_address_keeps_status() {
        let orch = orchestrator(Collaborators::default());
        let job_id = ready_job(&orch, &["alpha"]).await;
        let entity = orch.queue().list(job_id).await.unwrap().remove(0);
        let err = orch.attach_address(entity.id, "not an address").await.unwrap_err();
        assert!(matches!(err, HarvestError::Invalid { .. }));
        assert_eq!(orch.queue().get_by_id(entity.id).await.unwrap().status, EntityStatus::PendingAddress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_extraction_finishes_entity() {
        let orch = orchestrator(Collaborators {
            extractor: Some(Arc::new(SyncExtractor)),
            ..Default::default()
        });
        let job_id = ready_job(&orch, &["alpha", "beta"]).await;
        let AdvanceOutcome::AwaitingOperator { entity, .. } = orch.advance(job_id).await.unwrap() else {
            panic!("Expected AwaitingOperator");
        };

        let attached = orch.attach_address(entity.id, "alpha.test").await.unwrap();
        assert_eq!(attached.status, EntityStatus::Resolved);
        assert_eq!(attached.contacts, vec!["info@alpha.test"]);

        wait_until(&orch, |o| o.state().is_idle()).await;
        let AdvanceOutcome::AwaitingOperator { entity, .. } = orch.advance(job_id).await.unwrap() else {
            panic!("Expected AwaitingOperator");
        };
        assert_eq!(entity.name, "beta");
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_cancels_watch_and_releases_loop() {
        let orch = orchestrator(Collaborators::default());
        let job_id = ready_job(&orch, &["alpha", "beta"]).await;
        let AdvanceOutcome::AwaitingOperator { entity, .. } = orch.advance(job_id).await.unwrap() else {
            panic!("Expected AwaitingOperator");
        };
        orch.attach_address(entity.id, "alpha.test").await.unwrap();
        assert!(matches!(orch.state(), LoopState::Extracting { .. }));

        let skipped = orch.skip(entity.id).await.unwrap();
        assert_eq!(skipped.status, EntityStatus::Skipped);
        assert!(orch.state().is_idle());

        let AdvanceOutcome::AwaitingOperator { entity, .. } = orch.advance(job_id).await.unwrap() else {
            panic!("Expected AwaitingOperator");
        };
        assert_eq!(entity.name, "beta");
    }

    #[tokio::test]
    async fn test_skip_unknown_entity() {
        let orch = orchestrator(Collaborators::default());
        assert!(orch.skip(404).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_record_contacts_requires_address() {
        let orch = orchestrator(Collaborators::default());
        let job_id = ready_job(&orch, &["alpha"]).await;
        let entity = orch.queue().list(job_id).await.unwrap().remove(0);
        let err = orch.record_contacts(entity.id, vec!["a@alpha.test".into()]).await.unwrap_err();
        assert!(matches!(err, HarvestError::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_callback_for_unowned_entity_counts_processed() {
        let orch = orchestrator(Collaborators::default());
        let job_id = ready_job(&orch, &["alpha"]).await;
        let entity = orch.queue().list(job_id).await.unwrap().remove(0);
        assert!(orch.state().is_idle());

        orch.attach_address(entity.id, "alpha.test").await.unwrap();
        let finished = orch.record_contacts(entity.id, vec!["a@alpha.test".into()]).await.unwrap();
        assert_eq!(finished.status, EntityStatus::Resolved);

        let job = orch.jobs().get(job_id).await.unwrap();
        assert_eq!(job.phase, JobPhase::Completed);
        assert_eq!(job.counters.entities_processed, 1);

        orch.skip(entity.id).await.unwrap();
        orch.record_contacts(entity.id, vec!["b@alpha.test".into()]).await.unwrap();
        assert_eq!(orch.jobs().get(job_id).await.unwrap().counters.entities_processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_advance_switched_off_mid_run_stops_at_next_decision() {
        let orch = orchestrator(Collaborators::default());
        orch.update_modes(ModesPatch { auto_advance: Some(true), auto_select: None }).await.unwrap();
        let job_id = ready_job(&orch, &["alpha", "beta"]).await;

        let AdvanceOutcome::AwaitingOperator { entity: alpha, .. } = orch.advance(job_id).await.unwrap() else {
            panic!("Expected AwaitingOperator");
        };
        assert_eq!(alpha.name, "alpha");
        orch.attach_address(alpha.id, "alpha.test").await.unwrap();
        assert!(matches!(orch.state(), LoopState::Extracting { .. }));

        orch.update_modes(ModesPatch { auto_advance: Some(false), auto_select: None }).await.unwrap();
        orch.record_contacts(alpha.id, vec!["a@alpha.test".into()]).await.unwrap();

        wait_until(&orch, |o| o.state().is_idle()).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(orch.state().is_idle());

        let beta = orch
            .queue()
            .list(job_id)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.name == "beta")
            .unwrap();
        assert_eq!(beta.status, EntityStatus::PendingAddress);

        // Still unclaimed: the next manual decision picks it up.
        match orch.advance(job_id).await.unwrap() {
            AdvanceOutcome::AwaitingOperator { entity, reason } => {
                assert_eq!(entity.id, beta.id);
                assert!(reason.is_none());
            }
            other => panic!("Expected AwaitingOperator, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_entity_completes_job() {
        let orch = orchestrator(Collaborators::default());
        let job_id = ready_job(&orch, &["alpha"]).await;
        let AdvanceOutcome::AwaitingOperator { entity, .. } = orch.advance(job_id).await.unwrap() else {
            panic!("Expected AwaitingOperator");
        };
        orch.attach_address(entity.id, "alpha.test").await.unwrap();
        orch.record_contacts(entity.id, vec![]).await.unwrap();

        wait_until(&orch, |o| o.state().is_idle()).await;
        let job = orch.jobs().get(job_id).await.unwrap();
        assert_eq!(job.phase, JobPhase::Completed);
        assert_eq!(job.counters.entities_processed, 1);
        assert!(matches!(orch.advance(job_id).await.unwrap(), AdvanceOutcome::JobFinished { .. }));
    }
}
