//! Audit event types

use cadence_api::OccurrenceState;
use cadence_util::{OccurrenceId, ScheduleId, SessionContextId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Schedule created with its first occurrence
    ScheduleCreated {
        schedule_id: ScheduleId,
        user_id: UserId,
        first_occurrence: DateTime<Utc>,
    },

    /// Second schedule for a user rejected
    DuplicateScheduleRejected { user_id: UserId },

    /// Schedule cancelled by its user
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

    /// Join refused because the occurrence was outside its window
    JoinDenied {
        occurrence_id: OccurrenceId,
        state: OccurrenceState,
    },

    /// Pending occurrence replaced by the next computed one
    OccurrenceAdvanced {
        schedule_id: ScheduleId,
        from: OccurrenceId,
        to: OccurrenceId,
        scheduled_at: DateTime<Utc>,
    },

    /// Pending occurrence passed its window unjoined
    OccurrenceExpired {
        schedule_id: ScheduleId,
        occurrence_id: OccurrenceId,
    },

    /// Ad-hoc session started outside any schedule
    InstantSessionStarted {
        occurrence_id: OccurrenceId,
        user_id: UserId,
    },

    /// Ad-hoc session cancelled
    InstantSessionCancelled { occurrence_id: OccurrenceId },

    /// Session finished and its summary stored
    SessionCompleted {
        occurrence_id: OccurrenceId,
        schedule_id: Option<ScheduleId>,
    },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp,
            event,
        }
    }
}
