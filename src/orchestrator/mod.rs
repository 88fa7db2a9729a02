//! The orchestration loop: one owned entity at a time, driven either by the
//! operator or by the auto-advance and auto-select modes.

pub mod guard;
pub mod modes;
pub mod runner;

pub use guard::{LoopGuard, LoopState, Ticket};
pub use modes::{ModeSettings, Modes, ModesPatch};
pub use runner::{
    AdvanceOutcome, CandidateSet, Collaborators, LoopSettings, LoopSnapshot, Orchestrator,
    ResolveStart,
};
