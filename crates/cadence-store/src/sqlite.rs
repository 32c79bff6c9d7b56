//! SQLite-based store implementation

use cadence_api::{
    ScheduleInstance, ScheduleStatus, SessionContext, SessionEnd, SessionKind, SessionOccurrence,
};
use cadence_util::{OccurrenceId, ScheduleId, UserId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{AuditEvent, ScheduleStore, SessionContextProvider, StoreError, StoreResult};

const SCHEDULE_COLUMNS: &str = "id, user_id, rule_json, next_occurrence_id, next_occurrence_at, \
     status, last_completed_summary, created_at, updated_at";

const CONTEXT_COLUMNS: &str = "context_id, occurrence_id, user_id, kind, created_at, ended";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Store lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock();

        conn.execute_batch(
            r#"
            -- Schedules, one row per instance ever created
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                rule_json TEXT NOT NULL,
                next_occurrence_id TEXT NOT NULL,
                next_occurrence_at TEXT NOT NULL,
                status TEXT NOT NULL,
                last_completed_summary TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- At most one live schedule per user
            CREATE UNIQUE INDEX IF NOT EXISTS idx_schedules_live_user
                ON schedules(user_id) WHERE status != 'cancelled';

            CREATE INDEX IF NOT EXISTS idx_schedules_next_occurrence
                ON schedules(next_occurrence_id);

            -- Session contexts keyed by occurrence; kind is 'scheduled' or 'instant'
            CREATE TABLE IF NOT EXISTS session_contexts (
                occurrence_id TEXT PRIMARY KEY,
                context_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL,
                ended TEXT,
                closed_at TEXT
            );

            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("Bad timestamp '{}': {}", s, e)))
}

fn parse_id<T>(s: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    s.parse()
        .map_err(|e| StoreError::Serialization(format!("Bad id '{}': {}", s, e)))
}

/// Raw column values of a `schedules` row
struct ScheduleRow {
    id: String,
    user_id: String,
    rule_json: String,
    next_occurrence_id: String,
    next_occurrence_at: String,
    status: String,
    last_completed_summary: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_schedule_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        rule_json: row.get(2)?,
        next_occurrence_id: row.get(3)?,
        next_occurrence_at: row.get(4)?,
        status: row.get(5)?,
        last_completed_summary: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl TryFrom<ScheduleRow> for ScheduleInstance {
    type Error = StoreError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        let last_completed_summary: Option<serde_json::Value> = row
            .last_completed_summary
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(ScheduleInstance {
            id: parse_id(&row.id)?,
            user_id: UserId::new(row.user_id),
            rule: serde_json::from_str(&row.rule_json)?,
            next_occurrence: SessionOccurrence {
                id: parse_id(&row.next_occurrence_id)?,
                scheduled_at: parse_timestamp(&row.next_occurrence_at)?,
            },
            status: row.status.parse().map_err(StoreError::Serialization)?,
            last_completed_summary,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

fn query_schedules<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> StoreResult<Vec<ScheduleInstance>> {
    let sql = format!("SELECT {} FROM schedules WHERE {}", SCHEDULE_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, read_schedule_row)?;

    let mut schedules = Vec::new();
    for row in rows {
        schedules.push(ScheduleInstance::try_from(row?)?);
    }
    Ok(schedules)
}

fn query_context(
    conn: &Connection,
    filter: &str,
    occurrence_id: &OccurrenceId,
) -> StoreResult<Option<SessionContext>> {
    let sql = format!(
        "SELECT {} FROM session_contexts WHERE occurrence_id = ? {}",
        CONTEXT_COLUMNS, filter
    );
    let raw: Option<ContextRow> = conn
        .query_row(&sql, [occurrence_id.to_string()], |row| {
            Ok(ContextRow {
                context_id: row.get(0)?,
                occurrence_id: row.get(1)?,
                user_id: row.get(2)?,
                kind: row.get(3)?,
                created_at: row.get(4)?,
                ended: row.get(5)?,
            })
        })
        .optional()?;

    raw.map(SessionContext::try_from).transpose()
}

/// Raw column values of a `session_contexts` row
struct ContextRow {
    context_id: String,
    occurrence_id: String,
    user_id: String,
    kind: String,
    created_at: String,
    ended: Option<String>,
}

impl TryFrom<ContextRow> for SessionContext {
    type Error = StoreError;

    fn try_from(row: ContextRow) -> Result<Self, Self::Error> {
        Ok(SessionContext {
            id: parse_id(&row.context_id)?,
            occurrence_id: parse_id(&row.occurrence_id)?,
            user_id: UserId::new(row.user_id),
            kind: row.kind.parse().map_err(StoreError::Serialization)?,
            created_at: parse_timestamp(&row.created_at)?,
            ended: row
                .ended
                .map(|e| e.parse::<SessionEnd>().map_err(StoreError::Serialization))
                .transpose()?,
        })
    }
}

impl ScheduleStore for SqliteStore {
    fn insert_schedule_if_absent(&self, schedule: &ScheduleInstance) -> StoreResult<()> {
        let conn = self.lock();
        let rule_json = serde_json::to_string(&schedule.rule)?;
        let summary_json = schedule
            .last_completed_summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = conn.execute(
            &format!(
                "INSERT INTO schedules ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                SCHEDULE_COLUMNS
            ),
            params![
                schedule.id.to_string(),
                schedule.user_id.as_str(),
                rule_json,
                schedule.next_occurrence.id.to_string(),
                format_timestamp(schedule.next_occurrence.scheduled_at),
                schedule.status.as_str(),
                summary_json,
                format_timestamp(schedule.created_at),
                format_timestamp(schedule.updated_at),
            ],
        );

        match result {
            Ok(_) => {
                debug!(
                    schedule_id = %schedule.id,
                    user_id = %schedule.user_id,
                    "Schedule inserted"
                );
                Ok(())
            }
            Err(e) if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) => {
                Err(StoreError::Conflict(format!(
                    "user {} already has a live schedule",
                    schedule.user_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_schedule(&self, id: &ScheduleId) -> StoreResult<Option<ScheduleInstance>> {
        let conn = self.lock();
        let mut found = query_schedules(&conn, "id = ?", [id.to_string()])?;
        Ok(found.pop())
    }

    fn get_active_schedule(&self, user_id: &UserId) -> StoreResult<Option<ScheduleInstance>> {
        let conn = self.lock();
        let mut found = query_schedules(
            &conn,
            "user_id = ? AND status != 'cancelled'",
            [user_id.as_str()],
        )?;
        Ok(found.pop())
    }

    fn find_by_occurrence(
        &self,
        occurrence_id: &OccurrenceId,
    ) -> StoreResult<Option<ScheduleInstance>> {
        let conn = self.lock();
        let mut found = query_schedules(
            &conn,
            "next_occurrence_id = ? AND status != 'cancelled'",
            [occurrence_id.to_string()],
        )?;
        Ok(found.pop())
    }

    fn list_active_schedules(&self) -> StoreResult<Vec<ScheduleInstance>> {
        let conn = self.lock();
        query_schedules(
            &conn,
            "status != 'cancelled' ORDER BY next_occurrence_at",
            [],
        )
    }

    fn advance_occurrence(
        &self,
        id: &ScheduleId,
        expected: &OccurrenceId,
        next: &SessionOccurrence,
        status: ScheduleStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.lock();

        let changed = conn.execute(
            r#"
            UPDATE schedules
            SET next_occurrence_id = ?1, next_occurrence_at = ?2, status = ?3, updated_at = ?4
            WHERE id = ?5 AND next_occurrence_id = ?6 AND status != 'cancelled'
            "#,
            params![
                next.id.to_string(),
                format_timestamp(next.scheduled_at),
                status.as_str(),
                format_timestamp(now),
                id.to_string(),
                expected.to_string(),
            ],
        )?;

        debug!(
            schedule_id = %id,
            from = %expected,
            to = %next.id,
            applied = changed == 1,
            "Occurrence advance"
        );
        Ok(changed == 1)
    }

    fn record_completion(
        &self,
        id: &ScheduleId,
        summary: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.lock();
        let summary_json = serde_json::to_string(summary)?;

        let changed = conn.execute(
            r#"
            UPDATE schedules
            SET last_completed_summary = ?1, status = 'scheduled', updated_at = ?2
            WHERE id = ?3 AND status != 'cancelled'
            "#,
            params![summary_json, format_timestamp(now), id.to_string()],
        )?;

        Ok(changed == 1)
    }

    fn cancel_schedule(&self, id: &ScheduleId, now: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.lock();

        let changed = conn.execute(
            "UPDATE schedules SET status = 'cancelled', updated_at = ?1 \
             WHERE id = ?2 AND status != 'cancelled'",
            params![format_timestamp(now), id.to_string()],
        )?;

        debug!(schedule_id = %id, cancelled = changed == 1, "Schedule cancel");
        Ok(changed == 1)
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.lock();
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![format_timestamp(event.timestamp), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.lock();

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            events.push(AuditEvent {
                id,
                timestamp: parse_timestamp(&timestamp_str)?,
                event: serde_json::from_str(&event_json)?,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

impl SessionContextProvider for SqliteStore {
    fn get_context(&self, occurrence_id: &OccurrenceId) -> StoreResult<Option<SessionContext>> {
        let conn = self.lock();
        query_context(&conn, "AND ended IS NULL", occurrence_id)
    }

    fn find_context(&self, occurrence_id: &OccurrenceId) -> StoreResult<Option<SessionContext>> {
        let conn = self.lock();
        query_context(&conn, "", occurrence_id)
    }

    fn get_or_create_context(
        &self,
        occurrence_id: &OccurrenceId,
        user_id: &UserId,
        kind: SessionKind,
        now: DateTime<Utc>,
    ) -> StoreResult<(SessionContext, bool)> {
        // Insert and read back under one lock so concurrent callers agree
        let conn = self.lock();
        let candidate = SessionContext::new(occurrence_id.clone(), user_id.clone(), kind, now);

        let inserted = conn.execute(
            r#"
            INSERT INTO session_contexts (occurrence_id, context_id, user_id, kind, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(occurrence_id) DO NOTHING
            "#,
            params![
                occurrence_id.to_string(),
                candidate.id.to_string(),
                user_id.as_str(),
                kind.as_str(),
                format_timestamp(now),
            ],
        )? == 1;

        let context = query_context(&conn, "", occurrence_id)?
            .ok_or_else(|| StoreError::NotFound(format!("session context for {}", occurrence_id)))?;

        debug!(
            occurrence_id = %occurrence_id,
            context_id = %context.id,
            created = inserted,
            "Session context resolved"
        );
        Ok((context, inserted))
    }

    fn close_context(
        &self,
        occurrence_id: &OccurrenceId,
        end: SessionEnd,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE session_contexts SET ended = ?1, closed_at = ?2 \
             WHERE occurrence_id = ?3 AND ended IS NULL",
            params![end.as_str(), format_timestamp(now), occurrence_id.to_string()],
        )?;
        debug!(
            occurrence_id = %occurrence_id,
            end = end.as_str(),
            closed = changed == 1,
            "Session context close"
        );
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuditEventType;
    use cadence_api::ScheduleRule;
    use cadence_util::TimeOfDay;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap()
    }

    fn make_schedule(user: &str) -> ScheduleInstance {
        let rule = ScheduleRule::daily(TimeOfDay::new(9, 0).unwrap(), chrono_tz::UTC);
        let first = SessionOccurrence::new(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap());
        ScheduleInstance::new(UserId::new(user), rule, first, t0())
    }

    #[test]
    fn test_in_memory_store() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.is_healthy());
    }

    #[test]
    fn test_insert_and_fetch_schedule() {
        let store = SqliteStore::in_memory().unwrap();
        let schedule = make_schedule("alice");
        store.insert_schedule_if_absent(&schedule).unwrap();

        let by_user = store
            .get_active_schedule(&UserId::new("alice"))
            .unwrap()
            .unwrap();
        assert_eq!(by_user, schedule);

        let by_id = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(by_id.rule, schedule.rule);

        let by_occurrence = store
            .find_by_occurrence(&schedule.next_occurrence.id)
            .unwrap()
            .unwrap();
        assert_eq!(by_occurrence.id, schedule.id);

        assert!(store.get_active_schedule(&UserId::new("bob")).unwrap().is_none());
    }

    #[test]
    fn test_second_live_schedule_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        let first = make_schedule("alice");
        store.insert_schedule_if_absent(&first).unwrap();

        let second = make_schedule("alice");
        let err = store.insert_schedule_if_absent(&second).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Another user is unaffected
        store.insert_schedule_if_absent(&make_schedule("bob")).unwrap();

        // After cancelling, the user may create a new one
        assert!(store.cancel_schedule(&first.id, t0()).unwrap());
        store.insert_schedule_if_absent(&second).unwrap();
        assert_eq!(
            store.get_active_schedule(&UserId::new("alice")).unwrap().unwrap().id,
            second.id
        );
    }

    #[test]
    fn test_cancel_is_one_shot() {
        let store = SqliteStore::in_memory().unwrap();
        let schedule = make_schedule("alice");
        store.insert_schedule_if_absent(&schedule).unwrap();

        assert!(store.cancel_schedule(&schedule.id, t0()).unwrap());
        assert!(!store.cancel_schedule(&schedule.id, t0()).unwrap());

        let stored = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Cancelled);
        assert!(store.find_by_occurrence(&schedule.next_occurrence.id).unwrap().is_none());
        assert!(store.list_active_schedules().unwrap().is_empty());
    }

    #[test]
    fn test_advance_is_compare_and_set() {
        let store = SqliteStore::in_memory().unwrap();
        let schedule = make_schedule("alice");
        store.insert_schedule_if_absent(&schedule).unwrap();

        let next = SessionOccurrence::new(Utc.with_ymd_and_hms(2025, 1, 7, 9, 0, 0).unwrap());

        // Wrong expected id is rejected
        let stale = OccurrenceId::new();
        assert!(!store
            .advance_occurrence(&schedule.id, &stale, &next, ScheduleStatus::Active, t0())
            .unwrap());

        assert!(store
            .advance_occurrence(
                &schedule.id,
                &schedule.next_occurrence.id,
                &next,
                ScheduleStatus::Active,
                t0()
            )
            .unwrap());

        // Same expected id a second time no longer matches
        assert!(!store
            .advance_occurrence(
                &schedule.id,
                &schedule.next_occurrence.id,
                &next,
                ScheduleStatus::Active,
                t0()
            )
            .unwrap());

        let stored = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(stored.next_occurrence, next);
        assert_eq!(stored.status, ScheduleStatus::Active);
    }

    #[test]
    fn test_record_completion() {
        let store = SqliteStore::in_memory().unwrap();
        let schedule = make_schedule("alice");
        store.insert_schedule_if_absent(&schedule).unwrap();

        let summary = serde_json::json!({ "topics": ["grammar"], "minutes": 42 });
        assert!(store.record_completion(&schedule.id, &summary, t0()).unwrap());

        let stored = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(stored.last_completed_summary, Some(summary));
        assert_eq!(stored.status, ScheduleStatus::Scheduled);
    }

    #[test]
    fn test_session_context_is_created_once() {
        let store = SqliteStore::in_memory().unwrap();
        let occurrence = OccurrenceId::new();
        let user = UserId::new("alice");

        assert!(store.get_context(&occurrence).unwrap().is_none());

        let (first, created) = store
            .get_or_create_context(&occurrence, &user, SessionKind::Scheduled, t0())
            .unwrap();
        assert!(created);
        assert_eq!(first.kind, SessionKind::Scheduled);

        // The kind of the first writer wins
        let (second, created) = store
            .get_or_create_context(&occurrence, &user, SessionKind::Instant, t0())
            .unwrap();
        assert!(!created);
        assert_eq!(first, second);

        assert_eq!(store.get_context(&occurrence).unwrap(), Some(first));

        assert!(store
            .close_context(&occurrence, SessionEnd::Completed, t0())
            .unwrap());
        assert!(!store
            .close_context(&occurrence, SessionEnd::Cancelled, t0())
            .unwrap());
        assert!(store.get_context(&occurrence).unwrap().is_none());

        let closed = store.find_context(&occurrence).unwrap().unwrap();
        assert_eq!(closed.ended, Some(SessionEnd::Completed));
    }

    #[test]
    fn test_instant_context_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.db");
        let occurrence = OccurrenceId::new();

        {
            let store = SqliteStore::open(&path).unwrap();
            let user = UserId::new("alice");
            store
                .get_or_create_context(&occurrence, &user, SessionKind::Instant, t0())
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let context = store.get_context(&occurrence).unwrap().unwrap();
        assert_eq!(context.kind, SessionKind::Instant);
        assert!(context.is_open());
    }

    #[test]
    fn test_audit_log() {
        let store = SqliteStore::in_memory().unwrap();

        store
            .append_audit(AuditEvent::new(
                AuditEventType::DuplicateScheduleRejected {
                    user_id: UserId::new("alice"),
                },
                t0(),
            ))
            .unwrap();

        let events = store.get_recent_audits(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, t0());
        assert!(matches!(
            events[0].event,
            AuditEventType::DuplicateScheduleRejected { .. }
        ));
    }

    #[test]
    fn test_store_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.db");
        let schedule = make_schedule("alice");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_schedule_if_absent(&schedule).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(loaded, schedule);
    }
}
