//! Store trait definitions

use cadence_api::{
    ScheduleInstance, ScheduleStatus, SessionContext, SessionEnd, SessionKind, SessionOccurrence,
};
use cadence_util::{OccurrenceId, ScheduleId, UserId};
use chrono::{DateTime, Utc};

use crate::{AuditEvent, StoreResult};

/// Persistence for schedule instances
pub trait ScheduleStore: Send + Sync {
    // Schedules

    /// Insert a schedule unless its user already has a non-cancelled one.
    /// Fails with [`crate::StoreError::Conflict`] in that case.
    fn insert_schedule_if_absent(&self, schedule: &ScheduleInstance) -> StoreResult<()>;

    /// Get a schedule by id, cancelled or not
    fn get_schedule(&self, id: &ScheduleId) -> StoreResult<Option<ScheduleInstance>>;

    /// Get the user's non-cancelled schedule
    fn get_active_schedule(&self, user_id: &UserId) -> StoreResult<Option<ScheduleInstance>>;

    /// Find the non-cancelled schedule whose pending occurrence has this id
    fn find_by_occurrence(
        &self,
        occurrence_id: &OccurrenceId,
    ) -> StoreResult<Option<ScheduleInstance>>;

    /// All non-cancelled schedules
    fn list_active_schedules(&self) -> StoreResult<Vec<ScheduleInstance>>;

    /// Replace the pending occurrence, but only if it is still `expected`.
    /// Returns false when another writer got there first.
    fn advance_occurrence(
        &self,
        id: &ScheduleId,
        expected: &OccurrenceId,
        next: &SessionOccurrence,
        status: ScheduleStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Store the opaque summary of a finished session and return the
    /// schedule to `Scheduled`
    fn record_completion(
        &self,
        id: &ScheduleId,
        summary: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Mark a schedule cancelled. Returns false if it already was.
    fn cancel_schedule(&self, id: &ScheduleId, now: DateTime<Utc>) -> StoreResult<bool>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}

/// Owner of the session contexts created when occurrences are joined and
/// when instant sessions start
pub trait SessionContextProvider: Send + Sync {
    /// Get the open context for an occurrence
    fn get_context(&self, occurrence_id: &OccurrenceId) -> StoreResult<Option<SessionContext>>;

    /// Get the context for an occurrence, open or closed
    fn find_context(&self, occurrence_id: &OccurrenceId) -> StoreResult<Option<SessionContext>>;

    /// Atomically fetch or create the context for an occurrence. The flag is
    /// true only for the caller that created it.
    fn get_or_create_context(
        &self,
        occurrence_id: &OccurrenceId,
        user_id: &UserId,
        kind: SessionKind,
        now: DateTime<Utc>,
    ) -> StoreResult<(SessionContext, bool)>;

    /// Close a context. Returns false if there was no open context.
    fn close_context(
        &self,
        occurrence_id: &OccurrenceId,
        end: SessionEnd,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
}
