//! Candidate ranking and the auto-select decision.
//!
//! Scoring is delegated to an optional external collaborator. When it is
//! missing, slow or wrong, the selector degrades to "no recommendation" and
//! the operator picks by hand.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use harvest_common::{Candidate, Entity, Recommendation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::queue::address_host;

/// Minimum confidence for attaching a candidate without operator approval.
pub const AUTO_SELECT_THRESHOLD: f64 = 0.70;

/// Request body sent to the scoring collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub entity: EntityContext,
    pub candidates: Vec<Candidate>,
}

/// The slice of an entity the scorer gets to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    pub entity_id: i64,
    pub name: String,
    pub region: Option<String>,
    pub excerpt: String,
}

impl From<&Entity> for EntityContext {
    fn from(entity: &Entity) -> Self {
        Self {
            entity_id: entity.id,
            name: entity.name.clone(),
            region: entity.region.clone(),
            excerpt: entity.excerpt.clone(),
        }
    }
}

/// Abstraction over the scoring collaborator.
#[async_trait]
pub trait CandidateScorer: Send + Sync {
    async fn score(&self, request: &ScoreRequest) -> Result<Recommendation>;
}

pub struct HttpScorer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpScorer {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("Failed to build scorer HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl CandidateScorer for HttpScorer {
    async fn score(&self, request: &ScoreRequest) -> Result<Recommendation> {
        let recommendation = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach scorer at {}", self.endpoint))?
            .error_for_status()
            .context("Scorer returned error status")?
            .json::<Recommendation>()
            .await
            .context("Failed to parse scorer response")?;
        Ok(Recommendation::new(
            recommendation.selected_index,
            recommendation.confidence,
            &recommendation.reasoning,
        ))
    }
}

/// What to do with a ranked candidate list.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Attach `address` without asking.
    AutoAttach { index: usize, address: String },
    /// Present the candidates and wait for the operator.
    AwaitChoice,
}

#[derive(Clone, Default)]
pub struct CandidateSelector {
    scorer: Option<Arc<dyn CandidateScorer>>,
}

impl CandidateSelector {
    pub fn new(scorer: Option<Arc<dyn CandidateScorer>>) -> Self {
        Self { scorer }
    }

    /// De-duplicate by host (first occurrence wins) and move
    /// platform-affinity candidates to the front, otherwise keeping the
    /// agent's order.
    pub fn rank(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        let mut ranked: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| !c.address.trim().is_empty())
            .filter(|c| {
                let key = address_host(&c.address).unwrap_or_else(|| c.address.trim().to_lowercase());
                seen.insert(key)
            })
            .collect();
        ranked.sort_by_key(|c| !c.platform_affinity);
        ranked
    }

    /// Ask the scorer for a pick among `ranked`. Any failure is "no
    /// recommendation".
    pub async fn recommend(&self, entity: &Entity, ranked: &[Candidate]) -> Option<Recommendation> {
        let scorer = self.scorer.as_ref()?;
        if ranked.is_empty() {
            return None;
        }
        let request = ScoreRequest {
            entity: EntityContext::from(entity),
            candidates: ranked.to_vec(),
        };
        match scorer.score(&request).await {
            Ok(rec) if rec.selected_index < ranked.len() => {
                debug!(
                    entity_id = entity.id,
                    index = rec.selected_index,
                    confidence = rec.confidence,
                    "scorer recommendation"
                );
                Some(rec)
            }
            Ok(rec) => {
                warn!(
                    entity_id = entity.id,
                    index = rec.selected_index,
                    candidates = ranked.len(),
                    "scorer picked an index out of range"
                );
                None
            }
            Err(e) => {
                warn!(entity_id = entity.id, error = %e, "scorer unavailable");
                None
            }
        }
    }

    /// Auto-attach only when `auto_select` is on and the recommendation
    /// meets [`AUTO_SELECT_THRESHOLD`].
    pub fn decide(
        ranked: &[Candidate],
        recommendation: Option<&Recommendation>,
        auto_select: bool,
    ) -> Decision {
        let Some(rec) = recommendation else {
            return Decision::AwaitChoice;
        };
        if !auto_select || !rec.meets_confidence(AUTO_SELECT_THRESHOLD) {
            return Decision::AwaitChoice;
        }
        match ranked.get(rec.selected_index) {
            Some(candidate) => Decision::AutoAttach {
                index: rec.selected_index,
                address: candidate.address.clone(),
            },
            None => Decision::AwaitChoice,
        }
    }
}
