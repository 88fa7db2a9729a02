use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Phase of a workflow run.
///
/// Phases advance strictly in order, one step at a time:
///
/// ```text
/// harvesting_reviews → resolving_addresses → extracting_contacts → completed
/// ```
///
/// `error` is reachable from any non-terminal phase. The only backwards move
/// is an explicit resume, which restarts a job at `harvesting_reviews`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    HarvestingReviews,
    ResolvingAddresses,
    ExtractingContacts,
    Completed,
    Error,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HarvestingReviews => "harvesting_reviews",
            Self::ResolvingAddresses => "resolving_addresses",
            Self::ExtractingContacts => "extracting_contacts",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Position in the forward ordering. `Error` sits outside it.
    fn ordinal(&self) -> Option<u8> {
        match self {
            Self::HarvestingReviews => Some(0),
            Self::ResolvingAddresses => Some(1),
            Self::ExtractingContacts => Some(2),
            Self::Completed => Some(3),
            Self::Error => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether `self → to` is a legal forward transition.
    pub fn can_transition_to(&self, to: JobPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == Self::Error {
            return true;
        }
        match (self.ordinal(), to.ordinal()) {
            (Some(from), Some(to)) => to == from + 1,
            _ => false,
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "harvesting_reviews" => Ok(Self::HarvestingReviews),
            "resolving_addresses" => Ok(Self::ResolvingAddresses),
            "extracting_contacts" => Ok(Self::ExtractingContacts),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid job phase: {}", s)),
        }
    }
}

/// Optional caps on a job. `None` and `Some(0)` both mean unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLimits {
    #[serde(default)]
    pub max_entities: Option<u32>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl JobLimits {
    pub fn new(max_entities: Option<u32>, max_pages: Option<u32>) -> Self {
        Self {
            max_entities,
            max_pages,
        }
        .normalized()
    }

    /// Collapse `Some(0)` into `None`.
    pub fn normalized(self) -> Self {
        Self {
            max_entities: self.max_entities.filter(|n| *n > 0),
            max_pages: self.max_pages.filter(|n| *n > 0),
        }
    }
}

/// Remaining budget for a limit after some units were consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remaining {
    Unlimited,
    Limited(u32),
}

impl Remaining {
    /// `limit − consumed`, clamped at zero. An absent or zero limit is unlimited.
    pub fn compute(limit: Option<u32>, consumed: u32) -> Self {
        match limit.filter(|n| *n > 0) {
            None => Self::Unlimited,
            Some(limit) => Self::Limited(limit.saturating_sub(consumed)),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Limited(0))
    }

    /// The remaining count as a limit value (`None` for unlimited).
    pub fn as_limit(&self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Limited(n) => Some(*n),
        }
    }
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Limited(n) => write!(f, "{}", n),
        }
    }
}

/// Monotonic job counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    #[serde(default)]
    pub entities_harvested: u32,
    #[serde(default)]
    pub entities_processed: u32,
    #[serde(default)]
    pub pages_visited: u32,
}

impl JobCounters {
    /// Fold a report into the counters. Counters never decrease, so a stale or
    /// out-of-order report cannot roll progress back.
    pub fn absorb(&mut self, report: JobCounters) {
        self.entities_harvested = self.entities_harvested.max(report.entities_harvested);
        self.entities_processed = self.entities_processed.max(report.entities_processed);
        self.pages_visited = self.pages_visited.max(report.pages_visited);
    }
}

/// One workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub source_url: String,
    /// Display label derived from the source URL.
    pub label: String,
    pub phase: JobPhase,
    pub counters: JobCounters,
    pub limits: JobLimits,
    pub progress_message: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }
}
