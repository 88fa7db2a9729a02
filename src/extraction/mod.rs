//! Boundary to the contact-extraction collaborator, plus the watcher that
//! waits for its verdict.

pub mod watcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ExtractionSection;

pub use watcher::{CompletionWatcher, WatchConfig, WatchOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub entity_id: i64,
    pub address: String,
}

/// How the worker answered a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionAck {
    /// Work started; the result arrives through the contacts callback.
    Accepted,
    /// The worker answered synchronously.
    Finished(Vec<String>),
}

/// Abstraction over the extraction worker for testability.
/// Real implementation: `HttpExtractor`.
#[async_trait]
pub trait ContactExtractor: Send + Sync {
    async fn start(&self, request: &ExtractionRequest) -> Result<ExtractionAck>;
}

#[derive(Debug, Default, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    contacts: Option<Vec<String>>,
}

pub struct HttpExtractor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExtractor {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build extraction worker HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl ContactExtractor for HttpExtractor {
    async fn start(&self, request: &ExtractionRequest) -> Result<ExtractionAck> {
        let body = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach extraction worker at {}", self.endpoint))?
            .error_for_status()
            .context("Extraction worker rejected the request")?
            .text()
            .await
            .context("Failed to read extraction worker response")?;
        parse_ack(&body)
    }
}

/// An empty body or one without `contacts` means the worker will call back.
fn parse_ack(body: &str) -> Result<ExtractionAck> {
    if body.trim().is_empty() {
        return Ok(ExtractionAck::Accepted);
    }
    let response: ExtractionResponse =
        serde_json::from_str(body).context("Failed to parse extraction worker response")?;
    Ok(match response.contacts {
        Some(contacts) => ExtractionAck::Finished(contacts),
        None => ExtractionAck::Accepted,
    })
}

pub fn extractor_from_config(section: &ExtractionSection) -> Result<Option<Arc<dyn ContactExtractor>>> {
    match section.worker_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => Ok(Some(Arc::new(HttpExtractor::new(url)?))),
        None => Ok(None),
    }
}
