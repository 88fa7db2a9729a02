//! Shared domain types for the harvest workflow.
//!
//! These types carry no I/O. They are used by the store, the HTTP surface and
//! the orchestration loop, and by collaborators that speak the same JSON.

pub mod entity;
pub mod job;
pub mod search;

pub use entity::{Entity, EntityStatus, NewEntity};
pub use job::{Job, JobCounters, JobLimits, JobPhase, Remaining};
pub use search::{Candidate, Recommendation, SearchStatus};
