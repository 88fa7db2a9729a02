//! Completion watcher: polls an entity after its address is attached until the
//! extraction worker reports a terminal status.
//!
//! The watch ends on whichever comes first: a terminal status, `max_attempts`
//! polls, the `ceiling`, or cancellation. Running out of attempts or time
//! force-finishes the entity as `resolved_empty` with a timeout note, so a
//! silent worker never leaves an entity stuck.

use std::time::Duration;

use harvest_common::Entity;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatchSection;
use crate::errors::HarvestResult;
use crate::queue::EntityQueue;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub ceiling: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::from(&WatchSection::default())
    }
}

impl From<&WatchSection> for WatchConfig {
    fn from(section: &WatchSection) -> Self {
        Self {
            poll_interval: Duration::from_secs(section.poll_interval_secs),
            max_attempts: section.max_attempts,
            ceiling: Duration::from_secs(section.ceiling_secs),
        }
    }
}

impl WatchConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    /// The entity reached a terminal status on its own (or was skipped).
    Finished(Entity),
    /// The watch gave up and forced `resolved_empty`.
    TimedOut(Entity),
    /// The watch was cancelled before any verdict.
    Cancelled,
}

#[derive(Clone)]
pub struct CompletionWatcher {
    queue: EntityQueue,
    config: WatchConfig,
}

impl CompletionWatcher {
    pub fn new(queue: EntityQueue, config: WatchConfig) -> Self {
        Self { queue, config }
    }

    pub async fn watch(&self, entity_id: i64, cancel: CancellationToken) -> HarvestResult<WatchOutcome> {
        let started = Instant::now();
        let polling = tokio::time::timeout(self.config.ceiling, self.poll_until_terminal(entity_id));

        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(entity_id, "completion watch cancelled");
                return Ok(WatchOutcome::Cancelled);
            }
            verdict = polling => verdict,
        };

        match verdict {
            Ok(Ok(Some(entity))) => Ok(WatchOutcome::Finished(entity)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(None)) | Err(_) => self.force_finish(entity_id, started.elapsed()).await,
        }
    }

    /// `Some(entity)` once terminal, `None` when attempts ran out.
    async fn poll_until_terminal(&self, entity_id: i64) -> HarvestResult<Option<Entity>> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        for attempt in 1..=self.config.max_attempts {
            ticker.tick().await;
            let entity = self.queue.get_by_id(entity_id).await?;
            if entity.status.is_terminal() {
                debug!(entity_id, attempt, status = %entity.status, "extraction finished");
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    async fn force_finish(&self, entity_id: i64, elapsed: Duration) -> HarvestResult<WatchOutcome> {
        let note = format!("Extraction timed out after {}s", elapsed.as_secs());
        let written = self
            .queue
            .record_contacts(entity_id, Vec::new(), Some(note.clone()))
            .await?;
        let entity = self.queue.get_by_id(entity_id).await?;
        match written {
            Some(_) => {
                warn!(entity_id, %note, "forced resolved_empty");
                Ok(WatchOutcome::TimedOut(entity))
            }
            None => {
                // A verdict landed between the last poll and the force.
                info!(entity_id, status = %entity.status, "extraction finished at the deadline");
                Ok(WatchOutcome::Finished(entity))
            }
        }
    }
}
