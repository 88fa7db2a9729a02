//! Boundary to the review-harvesting collaborator.
//!
//! The harvester runs out of process. We only tell it to start; it reports
//! back through the job callbacks (`/api/jobs/:id/entities`, `/progress`,
//! `/harvest/complete`, `/harvest/fail`).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Work order handed to the harvester when a job starts or resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestRequest {
    pub job_id: i64,
    pub source_url: String,
    /// Entities still wanted; `None` is unlimited.
    pub max_entities: Option<u32>,
    /// Pages still allowed; `None` is unlimited.
    pub max_pages: Option<u32>,
    pub resume: bool,
}

/// Abstraction over the harvesting collaborator for testability.
/// Real implementation: `HttpHarvester`.
#[async_trait]
pub trait ReviewHarvester: Send + Sync {
    async fn start(&self, request: &HarvestRequest) -> Result<()>;
}

/// Dispatches harvest requests to a worker over HTTP.
pub struct HttpHarvester {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpHarvester {
    pub fn new(worker_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build harvest worker HTTP client")?;
        Ok(Self {
            client,
            endpoint: worker_url.to_string(),
        })
    }
}

#[async_trait]
impl ReviewHarvester for HttpHarvester {
    async fn start(&self, request: &HarvestRequest) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach harvest worker at {}", self.endpoint))?
            .error_for_status()
            .context("Harvest worker rejected the request")?;
        Ok(())
    }
}
