//! Search request/poll broker.
//!
//! The search agent lives in a separate, unreliable process. `submit` hands
//! out a request id immediately; the agent answers later through `complete`
//! or `fail`, and callers `poll` at their own cadence. Requests live in a
//! bounded in-memory map:
//!
//! - a pending request older than `request_timeout` becomes `expired`
//! - a resolved request is purged `retention` after it resolved
//! - beyond `max_retained` entries the oldest are purged first
//!
//! Polling a purged id is `SearchNotFound`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_common::{Candidate, SearchStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::agent::{SearchAgent, SearchDispatch};
use crate::config::SearchSection;
use crate::errors::{HarvestError, HarvestResult};

/// Default number of poll attempts before a search is abandoned.
const DEFAULT_POLL_ATTEMPTS: u32 = 30;

/// Default spacing between poll attempts (1s).
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_RETENTION_SECS: u64 = 3600;
const DEFAULT_MAX_RETAINED: usize = 1000;

/// Configuration for the search broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Poll attempts made by `wait_for` before giving up.
    pub poll_attempts: u32,
    /// Spacing between poll attempts.
    pub poll_interval: Duration,
    /// Age at which an unanswered request is marked expired.
    pub request_timeout: Duration,
    /// How long resolved requests stay pollable.
    pub retention: Duration,
    /// Upper bound on retained requests.
    pub max_retained: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            max_retained: DEFAULT_MAX_RETAINED,
        }
    }
}

impl From<&SearchSection> for BrokerConfig {
    fn from(section: &SearchSection) -> Self {
        Self {
            poll_attempts: section.poll_attempts,
            poll_interval: section.poll_interval(),
            request_timeout: section.request_timeout(),
            retention: section.retention(),
            max_retained: section.max_retained,
        }
    }
}

impl BrokerConfig {
    pub fn with_poll_attempts(mut self, attempts: u32) -> Self {
        self.poll_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_retained(mut self, max: usize) -> Self {
        self.max_retained = max;
        self
    }

    /// Soft ceiling of a `wait_for` loop.
    pub fn poll_budget(&self) -> Duration {
        self.poll_interval * self.poll_attempts
    }
}

/// Caller-visible state of a search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSnapshot {
    pub request_id: String,
    pub query: String,
    pub status: SearchStatus,
    pub results: Vec<Candidate>,
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A request waiting for an agent, as listed for pull-based agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSearch {
    pub request_id: String,
    pub query: String,
    pub context: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

struct SearchEntry {
    snapshot: SearchSnapshot,
    context: serde_json::Value,
    submitted: Instant,
    resolved: Option<Instant>,
}

impl SearchEntry {
    fn resolve(&mut self, status: SearchStatus, results: Vec<Candidate>, error: Option<String>) {
        self.snapshot.status = status;
        self.snapshot.results = results;
        self.snapshot.error = error;
        self.snapshot.resolved_at = Some(Utc::now());
        self.resolved = Some(Instant::now());
    }
}

#[derive(Default)]
struct BrokerState {
    entries: HashMap<String, SearchEntry>,
    /// Request ids in submission order.
    order: VecDeque<String>,
}

impl BrokerState {
    /// Expire overdue requests, then purge by retention and capacity.
    fn sweep(&mut self, config: &BrokerConfig) {
        let now = Instant::now();

        for entry in self.entries.values_mut() {
            if entry.snapshot.status == SearchStatus::Pending
                && now.duration_since(entry.submitted) >= config.request_timeout
            {
                debug!(request_id = %entry.snapshot.request_id, "search request expired");
                entry.resolve(
                    SearchStatus::Expired,
                    Vec::new(),
                    Some(format!(
                        "No answer from the search agent within {}s",
                        config.request_timeout.as_secs()
                    )),
                );
            }
        }

        let retention = config.retention;
        self.entries.retain(|_, entry| {
            entry
                .resolved
                .is_none_or(|at| now.duration_since(at) < retention)
        });
        let entries = &self.entries;
        self.order.retain(|id| entries.contains_key(id));

        while self.entries.len() > config.max_retained {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Request/poll bridge to the external search agent.
#[derive(Clone)]
pub struct SearchBroker {
    agent: Option<Arc<dyn SearchAgent>>,
    config: BrokerConfig,
    state: Arc<RwLock<BrokerState>>,
}

impl SearchBroker {
    pub fn new(agent: Option<Arc<dyn SearchAgent>>, config: BrokerConfig) -> Self {
        Self {
            agent,
            config,
            state: Arc::new(RwLock::new(BrokerState::default())),
        }
    }

    pub fn is_available(&self) -> bool {
        self.agent.is_some()
    }

    /// Register a search and hand it to the agent. Returns the request id
    /// without waiting for an answer. A dispatch failure resolves the request
    /// as failed, which the next poll reports.
    pub async fn submit(&self, query: &str, context: serde_json::Value) -> HarvestResult<String> {
        let Some(agent) = self.agent.clone() else {
            return Err(HarvestError::AgentUnavailable);
        };
        let query = query.trim();
        if query.is_empty() {
            return Err(HarvestError::invalid("query", "search query is empty"));
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.state.write().await;
            state.sweep(&self.config);
            state.entries.insert(
                request_id.clone(),
                SearchEntry {
                    snapshot: SearchSnapshot {
                        request_id: request_id.clone(),
                        query: query.to_string(),
                        status: SearchStatus::Pending,
                        results: Vec::new(),
                        error: None,
                        requested_at: Utc::now(),
                        resolved_at: None,
                    },
                    context: context.clone(),
                    submitted: Instant::now(),
                    resolved: None,
                },
            );
            state.order.push_back(request_id.clone());
            state.sweep(&self.config);
        }

        let dispatch = SearchDispatch {
            request_id: request_id.clone(),
            query: query.to_string(),
            context,
        };
        match agent.dispatch(&dispatch).await {
            Ok(()) => info!(%request_id, agent = agent.name(), query, "search submitted"),
            Err(e) => {
                warn!(%request_id, error = %e, "search dispatch failed");
                self.fail(&request_id, &format!("{:#}", e)).await?;
            }
        }
        Ok(request_id)
    }

    /// Current state of a request.
    pub async fn poll(&self, request_id: &str) -> HarvestResult<SearchSnapshot> {
        let mut state = self.state.write().await;
        state.sweep(&self.config);
        state
            .entries
            .get(request_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| HarvestError::SearchNotFound {
                id: request_id.to_string(),
            })
    }

    /// Agent callback: results are in. A no-op on an already-resolved request.
    pub async fn complete(
        &self,
        request_id: &str,
        results: Vec<Candidate>,
    ) -> HarvestResult<SearchSnapshot> {
        self.resolve_with(request_id, SearchStatus::Complete, results, None)
            .await
    }

    /// Agent callback: the search failed. A no-op on an already-resolved
    /// request.
    pub async fn fail(&self, request_id: &str, reason: &str) -> HarvestResult<SearchSnapshot> {
        self.resolve_with(
            request_id,
            SearchStatus::Failed,
            Vec::new(),
            Some(reason.to_string()),
        )
        .await
    }

    async fn resolve_with(
        &self,
        request_id: &str,
        status: SearchStatus,
        results: Vec<Candidate>,
        error: Option<String>,
    ) -> HarvestResult<SearchSnapshot> {
        let mut state = self.state.write().await;
        state.sweep(&self.config);
        let entry = state
            .entries
            .get_mut(request_id)
            .ok_or_else(|| HarvestError::SearchNotFound {
                id: request_id.to_string(),
            })?;
        if entry.snapshot.status.is_resolved() {
            debug!(%request_id, current = %entry.snapshot.status, "repeat search callback ignored");
        } else {
            info!(%request_id, %status, results = results.len(), "search resolved");
            entry.resolve(status, results, error);
        }
        Ok(entry.snapshot.clone())
    }

    /// Requests still waiting for an agent, oldest first.
    pub async fn pending(&self) -> Vec<PendingSearch> {
        let mut state = self.state.write().await;
        state.sweep(&self.config);
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| entry.snapshot.status == SearchStatus::Pending)
            .map(|entry| PendingSearch {
                request_id: entry.snapshot.request_id.clone(),
                query: entry.snapshot.query.clone(),
                context: entry.context.clone(),
                requested_at: entry.snapshot.requested_at,
            })
            .collect()
    }

    /// Poll `request_id` up to `poll_attempts` times, `poll_interval` apart,
    /// until it resolves. Failure and expiry are errors; running out of
    /// attempts is a `Timeout`.
    pub async fn wait_for(&self, request_id: &str) -> HarvestResult<Vec<Candidate>> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        for attempt in 1..=self.config.poll_attempts {
            ticker.tick().await;
            let snapshot = self.poll(request_id).await?;
            match snapshot.status {
                SearchStatus::Pending => {
                    debug!(%request_id, attempt, "search still pending");
                }
                SearchStatus::Complete => return Ok(snapshot.results),
                SearchStatus::Failed => {
                    return Err(HarvestError::Other(anyhow::anyhow!(
                        "Search failed: {}",
                        snapshot.error.unwrap_or_else(|| "unknown reason".into())
                    )));
                }
                SearchStatus::Expired => {
                    return Err(HarvestError::Timeout {
                        operation: "Address search",
                        seconds: self.config.request_timeout.as_secs(),
                    });
                }
            }
        }

        Err(HarvestError::Timeout {
            operation: "Address search",
            seconds: self.config.poll_budget().as_secs(),
        })
    }
}
