//! Core events emitted by the scheduler

use cadence_util::{OccurrenceId, ScheduleId, SessionContextId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Events emitted by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    ScheduleCreated {
        schedule_id: ScheduleId,
        user_id: UserId,
        first_occurrence: DateTime<Utc>,
    },

    ScheduleCancelled {
        schedule_id: ScheduleId,
        user_id: UserId,
    },

    /// First join of an occurrence
    OccurrenceJoined {
        occurrence_id: OccurrenceId,
        context_id: SessionContextId,
        user_id: UserId,
    },

    /// Pending occurrence replaced after a join or expiry
    OccurrenceAdvanced {
        schedule_id: ScheduleId,
        next_occurrence: OccurrenceId,
        scheduled_at: DateTime<Utc>,
    },

    OccurrenceExpired {
        schedule_id: ScheduleId,
        occurrence_id: OccurrenceId,
    },

    InstantSessionStarted {
        occurrence_id: OccurrenceId,
        user_id: UserId,
    },

    InstantSessionCancelled {
        occurrence_id: OccurrenceId,
    },

    SessionCompleted {
        occurrence_id: OccurrenceId,
        schedule_id: Option<ScheduleId>,
    },
}
