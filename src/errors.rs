//! Typed error hierarchy for the harvest orchestrator.
//!
//! `HarvestError` is what operations hand back to the loop, the CLI and the
//! HTTP surface. Plumbing underneath (SQLite, HTTP clients, config files)
//! works in `anyhow`; a `HarvestError` raised inside a database closure is
//! recovered on the way out by [`HarvestError::from_anyhow`].

use thiserror::Error;

/// Errors surfaced by harvest operations.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Entity {id} not found")]
    EntityNotFound { id: i64 },

    #[error("Search request {id} not found or expired")]
    SearchNotFound { id: String },

    #[error("No search agent is configured; enter the address manually")]
    AgentUnavailable,

    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("A job for {source_url} is already running (job {job_id}); request a resume to continue it")]
    AlreadyRunning { job_id: i64, source_url: String },

    #[error("Invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type HarvestResult<T> = Result<T, HarvestError>;

impl HarvestError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }

    /// Recover a typed error that crossed an `anyhow` boundary, otherwise
    /// treat the failure as a storage fault.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<HarvestError>() {
            Ok(typed) => typed,
            Err(other) => Self::Database(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound { .. } | Self::EntityNotFound { .. } | Self::SearchNotFound { .. }
        )
    }

    /// Recoverable errors leave state consistent and can be retried or worked
    /// around by the operator.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AgentUnavailable
                | Self::Timeout { .. }
                | Self::AlreadyRunning { .. }
                | Self::Invalid { .. }
        ) || self.is_not_found()
    }
}
