//! Recurrence rules

use cadence_util::{DaysOfWeek, TimeOfDay};
use chrono::Weekday;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest day-of-month a monthly anchor may name
pub const MAX_ANCHOR_DAY: u32 = 31;

/// Most occurrences a single enumeration may produce
pub const DEFAULT_ENUMERATION_CAP: usize = 366;

/// A malformed schedule rule
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid time '{value}': {message}")]
    InvalidTime { value: String, message: String },

    #[error("Weekly schedule needs at least one day")]
    EmptyWeeklyDays,

    #[error("Days are only allowed on weekly schedules")]
    UnexpectedDays,

    #[error("Unknown day: {0}")]
    UnknownDay(String),

    #[error("Anchor day {0} is outside 1-31")]
    InvalidAnchorDay(u32),

    #[error("Anchor day is only allowed on monthly schedules")]
    UnexpectedAnchorDay,

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Unknown frequency: {0}")]
    UnknownFrequency(String),
}

/// How often a schedule repeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly {
        days: DaysOfWeek,
    },
    /// `anchor_day` is the targeted day-of-month. `None` until the scheduler
    /// pins it on creation.
    Monthly {
        #[serde(default)]
        anchor_day: Option<u32>,
    },
}

impl Frequency {
    pub fn name(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly { .. } => "weekly",
            Frequency::Monthly { .. } => "monthly",
        }
    }

    fn validate(&self) -> Result<(), RuleError> {
        match self {
            Frequency::Daily => Ok(()),
            Frequency::Weekly { days } if days.is_empty() => Err(RuleError::EmptyWeeklyDays),
            Frequency::Weekly { .. } => Ok(()),
            Frequency::Monthly {
                anchor_day: Some(day),
            } if !(1..=MAX_ANCHOR_DAY).contains(day) => Err(RuleError::InvalidAnchorDay(*day)),
            Frequency::Monthly { .. } => Ok(()),
        }
    }
}

/// A validated recurrence rule.
///
/// Construction and deserialization both validate, so a `ScheduleRule`
/// value is always usable by the recurrence engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RuleParts", into = "RuleParts")]
pub struct ScheduleRule {
    frequency: Frequency,
    time: TimeOfDay,
    timezone: Tz,
}

#[derive(Serialize, Deserialize)]
struct RuleParts {
    frequency: Frequency,
    time: TimeOfDay,
    timezone: Tz,
}

impl TryFrom<RuleParts> for ScheduleRule {
    type Error = RuleError;

    fn try_from(parts: RuleParts) -> Result<Self, Self::Error> {
        ScheduleRule::new(parts.frequency, parts.time, parts.timezone)
    }
}

impl From<ScheduleRule> for RuleParts {
    fn from(rule: ScheduleRule) -> Self {
        Self {
            frequency: rule.frequency,
            time: rule.time,
            timezone: rule.timezone,
        }
    }
}

impl ScheduleRule {
    pub fn new(frequency: Frequency, time: TimeOfDay, timezone: Tz) -> Result<Self, RuleError> {
        frequency.validate()?;
        Ok(Self {
            frequency,
            time,
            timezone,
        })
    }

    pub fn daily(time: TimeOfDay, timezone: Tz) -> Self {
        Self {
            frequency: Frequency::Daily,
            time,
            timezone,
        }
    }

    pub fn weekly(days: DaysOfWeek, time: TimeOfDay, timezone: Tz) -> Result<Self, RuleError> {
        Self::new(Frequency::Weekly { days }, time, timezone)
    }

    pub fn monthly(
        anchor_day: Option<u32>,
        time: TimeOfDay,
        timezone: Tz,
    ) -> Result<Self, RuleError> {
        Self::new(Frequency::Monthly { anchor_day }, time, timezone)
    }

    pub fn frequency(&self) -> &Frequency {
        &self.frequency
    }

    pub fn time(&self) -> TimeOfDay {
        self.time
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Anchor day for monthly rules, if one has been set
    pub fn anchor_day(&self) -> Option<u32> {
        match self.frequency {
            Frequency::Monthly { anchor_day } => anchor_day,
            _ => None,
        }
    }

    /// Fix the anchor of a monthly rule that has none yet. Rules that are
    /// not monthly, or already anchored, are returned unchanged.
    pub fn pin_anchor(self, day: u32) -> Result<Self, RuleError> {
        match self.frequency {
            Frequency::Monthly { anchor_day: None } => {
                Self::monthly(Some(day), self.time, self.timezone)
            }
            _ => Ok(self),
        }
    }
}

/// Parse a weekday name ("mon", "monday", case-insensitive)
pub fn parse_weekday(s: &str) -> Result<Weekday, RuleError> {
    match s.trim().to_lowercase().as_str() {
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        "sun" | "sunday" => Ok(Weekday::Sun),
        other => Err(RuleError::UnknownDay(other.to_string())),
    }
}

/// Parse an IANA timezone name
pub fn parse_timezone(s: &str) -> Result<Tz, RuleError> {
    s.trim()
        .parse::<Tz>()
        .map_err(|_| RuleError::UnknownTimezone(s.to_string()))
}
