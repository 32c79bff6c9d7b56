//! Schedule, occurrence and session types

use cadence_util::{OccurrenceId, ScheduleId, SessionContextId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::ScheduleRule;

/// Persisted status of a schedule instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Waiting for its next occurrence
    Scheduled,
    /// An occurrence has been joined and its session is running
    Active,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::Active => "active",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ScheduleStatus::Scheduled),
            "active" => Ok(ScheduleStatus::Active),
            "cancelled" => Ok(ScheduleStatus::Cancelled),
            other => Err(format!("Unknown schedule status: {}", other)),
        }
    }
}

/// One concrete instant at which a schedule is due
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOccurrence {
    pub id: OccurrenceId,
    pub scheduled_at: DateTime<Utc>,
}

impl SessionOccurrence {
    pub fn new(scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: OccurrenceId::new(),
            scheduled_at,
        }
    }
}

/// A user's recurring schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInstance {
    pub id: ScheduleId,
    pub user_id: UserId,
    pub rule: ScheduleRule,
    pub next_occurrence: SessionOccurrence,
    pub status: ScheduleStatus,
    /// Opaque result of the last completed session, owned by whoever ran it
    pub last_completed_summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleInstance {
    pub fn new(
        user_id: UserId,
        rule: ScheduleRule,
        next_occurrence: SessionOccurrence,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ScheduleId::new(),
            user_id,
            rule,
            next_occurrence,
            status: ScheduleStatus::Scheduled,
            last_completed_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ScheduleStatus::Cancelled
    }
}

/// Presentation/access state of a single occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceState {
    Upcoming,
    StartingSoon,
    Ready,
    Expired,
    Active,
    Cancelled,
}

impl OccurrenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccurrenceState::Upcoming => "upcoming",
            OccurrenceState::StartingSoon => "starting_soon",
            OccurrenceState::Ready => "ready",
            OccurrenceState::Expired => "expired",
            OccurrenceState::Active => "active",
            OccurrenceState::Cancelled => "cancelled",
        }
    }

    /// Expired, Cancelled and Active end the occurrence's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OccurrenceState::Expired | OccurrenceState::Cancelled | OccurrenceState::Active
        )
    }
}

/// Explicit actions a user can take on an occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Join,
    Cancel,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleAction::Join => f.write_str("join"),
            LifecycleAction::Cancel => f.write_str("cancel"),
        }
    }
}

/// An action that is not allowed from the occurrence's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Cannot {action} an occurrence that is {from}")]
pub struct TransitionError {
    pub from: OccurrenceState,
    pub action: LifecycleAction,
}

impl OccurrenceState {
    /// Ready -> Active
    pub fn join(self) -> Result<OccurrenceState, TransitionError> {
        match self {
            OccurrenceState::Ready => Ok(OccurrenceState::Active),
            from => Err(TransitionError {
                from,
                action: LifecycleAction::Join,
            }),
        }
    }

    /// Upcoming, StartingSoon or Ready -> Cancelled
    pub fn cancel(self) -> Result<OccurrenceState, TransitionError> {
        match self {
            OccurrenceState::Upcoming | OccurrenceState::StartingSoon | OccurrenceState::Ready => {
                Ok(OccurrenceState::Cancelled)
            }
            from => Err(TransitionError {
                from,
                action: LifecycleAction::Cancel,
            }),
        }
    }
}

impl fmt::Display for OccurrenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying an occurrence against a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub state: OccurrenceState,
    /// Until start for Upcoming/StartingSoon, until the window closes for
    /// Ready, zero otherwise
    pub time_remaining: Duration,
    pub can_join: bool,
}

/// Minutes an occurrence stays joinable after its scheduled start
pub const DEFAULT_WINDOW_MINUTES: u32 = 60;

/// Minutes before the start during which an occurrence is StartingSoon
pub const DEFAULT_STARTING_SOON_MINUTES: u32 = 10;

/// What a session context was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// A schedule's occurrence was joined
    Scheduled,
    /// Started ad hoc, outside any schedule
    Instant,
}

/// How a session context was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    Completed,
    Cancelled,
}

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant),)+
                    other => Err(format!("Unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

str_enum!(SessionKind { Scheduled => "scheduled", Instant => "instant" });
str_enum!(SessionEnd { Completed => "completed", Cancelled => "cancelled" });

/// The session record created when an occurrence is joined, or when an
/// instant session starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub id: SessionContextId,
    pub occurrence_id: OccurrenceId,
    pub user_id: UserId,
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended: Option<SessionEnd>,
}

impl SessionContext {
    pub fn new(
        occurrence_id: OccurrenceId,
        user_id: UserId,
        kind: SessionKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionContextId::new(),
            occurrence_id,
            user_id,
            kind,
            created_at: now,
            ended: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended.is_none()
    }

    /// Lifecycle state of the occurrence this context belongs to. A
    /// session stays Active once joined, finished or not, unless it was
    /// cancelled.
    pub fn occurrence_state(&self) -> OccurrenceState {
        match self.ended {
            Some(SessionEnd::Cancelled) => OccurrenceState::Cancelled,
            _ => OccurrenceState::Active,
        }
    }
}
