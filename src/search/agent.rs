//! Channels to the external search agent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SearchSection;

/// What the agent is asked to search for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDispatch {
    pub request_id: String,
    pub query: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Abstraction over the search agent channel.
/// Real implementations: `HttpSearchAgent`, `PullAgent`.
#[async_trait]
pub trait SearchAgent: Send + Sync {
    /// Hand a request to the agent. The answer arrives later through the
    /// broker's `complete`/`fail` callbacks.
    async fn dispatch(&self, request: &SearchDispatch) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Pushes each request to an agent endpoint.
pub struct HttpSearchAgent {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSearchAgent {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build search agent HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl SearchAgent for HttpSearchAgent {
    async fn dispatch(&self, request: &SearchDispatch) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach search agent at {}", self.endpoint))?
            .error_for_status()
            .context("Search agent rejected the request")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Agents that pull pending requests themselves; dispatch only records.
pub struct PullAgent;

#[async_trait]
impl SearchAgent for PullAgent {
    async fn dispatch(&self, _request: &SearchDispatch) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "pull"
    }
}

/// Build the configured agent channel, if any.
pub fn agent_from_config(section: &SearchSection) -> Result<Option<Arc<dyn SearchAgent>>> {
    if let Some(url) = section.agent_url.as_deref().filter(|u| !u.trim().is_empty()) {
        return Ok(Some(Arc::new(HttpSearchAgent::new(url)?)));
    }
    if section.pull_agents {
        return Ok(Some(Arc::new(PullAgent)));
    }
    Ok(None)
}
