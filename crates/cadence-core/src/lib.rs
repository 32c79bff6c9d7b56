//! Recurrence engine, occurrence lifecycle and scheduler for cadence
//!
//! This crate is the heart of cadence, containing:
//! - Next-occurrence computation for daily, weekly and monthly rules
//! - Occurrence state machine (Upcoming -> StartingSoon -> Ready -> Expired)
//! - Per-occurrence countdown tasks
//! - The scheduler: create, join, cancel and complete

mod countdown;
mod engine;
mod events;
mod lifecycle;
mod recurrence;

pub use countdown::*;
pub use engine::*;
pub use events::*;
pub use lifecycle::*;
pub use recurrence::*;

use cadence_api::{OccurrenceState, RuleError, TransitionError};
use cadence_store::StoreError;
use cadence_util::{OccurrenceId, ScheduleId, UserId};
use thiserror::Error;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid schedule rule: {0}")]
    InvalidRule(#[from] RuleError),

    #[error("User {user_id} already has an active schedule")]
    DuplicateSchedule { user_id: UserId },

    #[error("Occurrence {occurrence_id} cannot be joined: it is {state}")]
    JoinWindowClosed {
        occurrence_id: OccurrenceId,
        state: OccurrenceState,
    },

    #[error(transparent)]
    RecurrenceOverflow(#[from] RecurrenceOverflow),

    #[error("No further occurrence can be represented")]
    NoNextOccurrence,

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(ScheduleId),

    #[error("Occurrence not found: {0}")]
    OccurrenceNotFound(OccurrenceId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type CoreResult<T> = Result<T, CoreError>;
