use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of an external search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Pending,
    Complete,
    Failed,
    /// The agent did not answer within the request timeout.
    Expired,
}

impl SearchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid search status: {}", s)),
        }
    }
}

/// A candidate web address returned by the search agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub address: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    /// Whether the result looks hosted on the platform the reviews came from.
    #[serde(default)]
    pub platform_affinity: bool,
}

impl Candidate {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            title: String::new(),
            snippet: String::new(),
            platform_affinity: false,
        }
    }

    pub fn with_affinity(mut self, platform_affinity: bool) -> Self {
        self.platform_affinity = platform_affinity;
        self
    }
}

/// A scoring collaborator's pick among ranked candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub selected_index: usize,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl Recommendation {
    pub fn new(selected_index: usize, confidence: f64, reasoning: &str) -> Self {
        Self {
            selected_index,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.to_string(),
        }
    }

    pub fn meets_confidence(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}
