//! Process-local ownership token for the orchestration loop.
//!
//! The loop owns at most one entity at a time and is in exactly one of four
//! states. Every async step that started under a state holds a [`Ticket`];
//! after each await it re-checks the ticket, and a ticket invalidated by a
//! skip, a newer action or a finish makes its result a no-op. The mutex is
//! never held across an await.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    /// Claimed, nothing in flight: waiting for the operator or a resolve.
    Owned { job_id: i64, entity_id: i64 },
    /// An address search is in flight.
    Resolving { job_id: i64, entity_id: i64 },
    /// An address is attached and the completion watch is running.
    Extracting { job_id: i64, entity_id: i64 },
}

impl LoopState {
    pub fn entity_id(&self) -> Option<i64> {
        match self {
            Self::Idle => None,
            Self::Owned { entity_id, .. }
            | Self::Resolving { entity_id, .. }
            | Self::Extracting { entity_id, .. } => Some(*entity_id),
        }
    }

    pub fn job_id(&self) -> Option<i64> {
        match self {
            Self::Idle => None,
            Self::Owned { job_id, .. }
            | Self::Resolving { job_id, .. }
            | Self::Extracting { job_id, .. } => Some(*job_id),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Proof that an async step was started under a particular state.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub job_id: i64,
    pub entity_id: i64,
    epoch: u64,
    pub cancel: CancellationToken,
}

struct GuardInner {
    state: LoopState,
    /// Bumped on every transition that invalidates outstanding tickets.
    epoch: u64,
    cancel: Option<CancellationToken>,
}

impl GuardInner {
    fn cancel_in_flight(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    fn issue(&mut self, job_id: i64, entity_id: i64) -> Ticket {
        self.cancel_in_flight();
        self.epoch += 1;
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        Ticket {
            job_id,
            entity_id,
            epoch: self.epoch,
            cancel,
        }
    }
}

pub struct LoopGuard {
    inner: Mutex<GuardInner>,
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopGuard {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GuardInner {
                state: LoopState::Idle,
                epoch: 0,
                cancel: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> LoopState {
        self.lock().state
    }

    /// `idle → owned`. False when the loop already owns something.
    pub fn claim(&self, job_id: i64, entity_id: i64) -> bool {
        let mut inner = self.lock();
        if !inner.state.is_idle() {
            return false;
        }
        inner.epoch += 1;
        inner.state = LoopState::Owned { job_id, entity_id };
        true
    }

    /// `owned(entity) → resolving(entity)`. `None` while a resolution or
    /// extraction is in flight, or when `entity_id` is not the owned entity.
    pub fn begin_resolving(&self, entity_id: i64) -> Option<Ticket> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            LoopState::Owned { job_id, entity_id: owned } if owned == entity_id => {
                let ticket = inner.issue(job_id, entity_id);
                inner.state = LoopState::Resolving { job_id, entity_id };
                Some(ticket)
            }
            _ => None,
        }
    }

    /// `resolving → owned` for the resolution that holds `ticket`.
    /// The ticket stays valid for [`LoopGuard::holds`] until the next
    /// transition.
    pub fn finish_resolving(&self, ticket: &Ticket) -> bool {
        let mut inner = self.lock();
        let current = inner.epoch == ticket.epoch
            && inner.state
                == LoopState::Resolving {
                    job_id: ticket.job_id,
                    entity_id: ticket.entity_id,
                };
        if current {
            inner.cancel = None;
            inner.state = LoopState::Owned {
                job_id: ticket.job_id,
                entity_id: ticket.entity_id,
            };
        }
        current
    }

    /// Whether nothing has happened since `ticket` was issued.
    pub fn holds(&self, ticket: &Ticket) -> bool {
        let inner = self.lock();
        inner.epoch == ticket.epoch && inner.state.entity_id() == Some(ticket.entity_id)
    }

    /// `owned | resolving → extracting` for `entity_id`. A search still in
    /// flight is cancelled and its ticket invalidated.
    pub fn begin_extracting(&self, entity_id: i64) -> Option<Ticket> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            LoopState::Owned { job_id, entity_id: owned }
            | LoopState::Resolving { job_id, entity_id: owned }
                if owned == entity_id =>
            {
                let ticket = inner.issue(job_id, entity_id);
                inner.state = LoopState::Extracting { job_id, entity_id };
                Some(ticket)
            }
            _ => None,
        }
    }

    /// Back to idle, if `ticket` is still current.
    pub fn release_ticket(&self, ticket: &Ticket) -> bool {
        let mut inner = self.lock();
        if inner.epoch != ticket.epoch || inner.state.entity_id() != Some(ticket.entity_id) {
            return false;
        }
        inner.cancel = None;
        inner.epoch += 1;
        inner.state = LoopState::Idle;
        true
    }

    /// Drop ownership of `entity_id` whatever is in flight, cancelling it.
    /// Returns the state that was released, or `None` if the loop did not own
    /// the entity.
    pub fn release_entity(&self, entity_id: i64) -> Option<LoopState> {
        let mut inner = self.lock();
        if inner.state.entity_id() != Some(entity_id) {
            return None;
        }
        let previous = inner.state;
        inner.cancel_in_flight();
        inner.epoch += 1;
        inner.state = LoopState::Idle;
        Some(previous)
    }
}
