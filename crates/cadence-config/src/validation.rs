//! Configuration validation

use crate::schema::{RawConfig, RawDays, RawScheduleRule};
use crate::settings::{DEFAULT_STARTING_SOON_MINUTES, DEFAULT_WINDOW_MINUTES};
use cadence_api::{parse_timezone, parse_weekday, Frequency, RuleError, ScheduleRule};
use cadence_util::{DaysOfWeek, TimeOfDay};
use chrono_tz::Tz;
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Schedule for '{user}': {error}")]
    ScheduleError { user: String, error: RuleError },

    #[error("Schedule with an empty user name")]
    EmptyUser,

    #[error("Duplicate schedule for user: {0}")]
    DuplicateUser(String),

    #[error("Invalid default timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid join window: {0}")]
    InvalidJoinWindow(String),

    #[error("Enumeration cap must be at least 1, got {0}")]
    InvalidCap(usize),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let default_tz = match &config.service.default_timezone {
        Some(name) => parse_timezone(name).unwrap_or_else(|_| {
            errors.push(ValidationError::InvalidTimezone(name.clone()));
            Tz::UTC
        }),
        None => Tz::UTC,
    };

    errors.extend(validate_join_window(config));

    if config.recurrence.enumeration_cap == Some(0) {
        errors.push(ValidationError::InvalidCap(0));
    }

    // One live schedule per user, so seeds must not repeat a user
    let mut seen_users = HashSet::new();
    for schedule in &config.schedules {
        if schedule.user.trim().is_empty() {
            errors.push(ValidationError::EmptyUser);
            continue;
        }
        if !seen_users.insert(schedule.user.as_str()) {
            errors.push(ValidationError::DuplicateUser(schedule.user.clone()));
        }
        if let Err(error) = schedule.rule.to_rule(default_tz) {
            errors.push(ValidationError::ScheduleError {
                user: schedule.user.clone(),
                error,
            });
        }
    }

    errors
}

fn validate_join_window(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let window = config
        .join_window
        .window_minutes
        .unwrap_or(DEFAULT_WINDOW_MINUTES);
    let lead = config
        .join_window
        .starting_soon_minutes
        .unwrap_or(DEFAULT_STARTING_SOON_MINUTES);

    if window == 0 {
        errors.push(ValidationError::InvalidJoinWindow(
            "window_minutes must be greater than 0".into(),
        ));
    }
    if lead == 0 {
        errors.push(ValidationError::InvalidJoinWindow(
            "starting_soon_minutes must be greater than 0".into(),
        ));
    }
    if lead > window && window > 0 {
        errors.push(ValidationError::InvalidJoinWindow(format!(
            "starting_soon_minutes ({}) exceeds window_minutes ({})",
            lead, window
        )));
    }

    errors
}

impl RawScheduleRule {
    /// Convert to a validated rule. `default_tz` applies when no timezone
    /// is given.
    pub fn to_rule(&self, default_tz: Tz) -> Result<ScheduleRule, RuleError> {
        let time_str = self.time.as_deref().ok_or(RuleError::MissingField("time"))?;
        let time = TimeOfDay::parse(time_str).map_err(|message| RuleError::InvalidTime {
            value: time_str.to_string(),
            message,
        })?;

        let timezone = match &self.timezone {
            Some(name) => parse_timezone(name)?,
            None => default_tz,
        };

        let frequency = match self.frequency.trim().to_lowercase().as_str() {
            "daily" => {
                self.reject_days()?;
                self.reject_anchor()?;
                Frequency::Daily
            }
            "weekly" => {
                self.reject_anchor()?;
                let days = self.days.as_ref().ok_or(RuleError::MissingField("days"))?;
                Frequency::Weekly {
                    days: parse_days(days)?,
                }
            }
            "monthly" => {
                self.reject_days()?;
                Frequency::Monthly {
                    anchor_day: self.anchor_day,
                }
            }
            other => return Err(RuleError::UnknownFrequency(other.to_string())),
        };

        ScheduleRule::new(frequency, time, timezone)
    }

    fn reject_days(&self) -> Result<(), RuleError> {
        match self.days {
            Some(_) => Err(RuleError::UnexpectedDays),
            None => Ok(()),
        }
    }

    fn reject_anchor(&self) -> Result<(), RuleError> {
        match self.anchor_day {
            Some(_) => Err(RuleError::UnexpectedAnchorDay),
            None => Ok(()),
        }
    }
}

/// Parse days specification
pub fn parse_days(days: &RawDays) -> Result<DaysOfWeek, RuleError> {
    match days {
        RawDays::Preset(preset) => match preset.trim().to_lowercase().as_str() {
            "all" | "every" | "daily" => Ok(DaysOfWeek::ALL_DAYS),
            "weekdays" => Ok(DaysOfWeek::WEEKDAYS),
            "weekends" => Ok(DaysOfWeek::WEEKENDS),
            other => Err(RuleError::UnknownDay(other.to_string())),
        },
        RawDays::List(list) => {
            let weekdays = list
                .iter()
                .map(|day| parse_weekday(day))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DaysOfWeek::from_weekdays(weekdays))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RawSchedule;

    fn rule(frequency: &str) -> RawScheduleRule {
        RawScheduleRule {
            frequency: frequency.into(),
            time: Some("09:00".into()),
            ..Default::default()
        }
    }

    fn config_with(schedules: Vec<RawSchedule>) -> RawConfig {
        RawConfig {
            config_version: 1,
            service: Default::default(),
            join_window: Default::default(),
            recurrence: Default::default(),
            schedules,
        }
    }

    #[test]
    fn test_parse_days() {
        assert_eq!(
            parse_days(&RawDays::Preset("weekdays".into())).unwrap(),
            DaysOfWeek::WEEKDAYS
        );
        assert_eq!(
            parse_days(&RawDays::Preset("Weekends".into())).unwrap(),
            DaysOfWeek::WEEKENDS
        );
        assert_eq!(
            parse_days(&RawDays::List(vec!["mon".into(), "Wednesday".into()])).unwrap(),
            DaysOfWeek::new(DaysOfWeek::MONDAY | DaysOfWeek::WEDNESDAY)
        );
        assert!(parse_days(&RawDays::Preset("fortnightly".into())).is_err());
        assert!(parse_days(&RawDays::List(vec!["mon".into(), "someday".into()])).is_err());
    }

    #[test]
    fn weekly_rule_needs_days() {
        let raw = rule("weekly");
        assert_eq!(raw.to_rule(Tz::UTC).unwrap_err(), RuleError::MissingField("days"));

        let raw = RawScheduleRule {
            days: Some(RawDays::List(vec![])),
            ..rule("weekly")
        };
        assert_eq!(raw.to_rule(Tz::UTC).unwrap_err(), RuleError::EmptyWeeklyDays);
    }

    #[test]
    fn days_and_anchor_only_where_they_belong() {
        let raw = RawScheduleRule {
            days: Some(RawDays::Preset("all".into())),
            ..rule("daily")
        };
        assert_eq!(raw.to_rule(Tz::UTC).unwrap_err(), RuleError::UnexpectedDays);

        let raw = RawScheduleRule {
            anchor_day: Some(3),
            days: Some(RawDays::Preset("weekdays".into())),
            ..rule("weekly")
        };
        assert_eq!(raw.to_rule(Tz::UTC).unwrap_err(), RuleError::UnexpectedAnchorDay);
    }

    #[test]
    fn missing_and_bad_time() {
        let raw = RawScheduleRule {
            time: None,
            ..rule("daily")
        };
        assert_eq!(raw.to_rule(Tz::UTC).unwrap_err(), RuleError::MissingField("time"));

        let raw = RawScheduleRule {
            time: Some("25:00".into()),
            ..rule("daily")
        };
        assert!(matches!(
            raw.to_rule(Tz::UTC),
            Err(RuleError::InvalidTime { .. })
        ));
    }

    #[test]
    fn timezone_falls_back_to_default() {
        let parsed = rule("daily").to_rule(chrono_tz::Europe::Berlin).unwrap();
        assert_eq!(parsed.timezone(), chrono_tz::Europe::Berlin);

        let raw = RawScheduleRule {
            timezone: Some("Asia/Tokyo".into()),
            ..rule("daily")
        };
        assert_eq!(raw.to_rule(Tz::UTC).unwrap().timezone(), chrono_tz::Asia::Tokyo);

        let raw = RawScheduleRule {
            timezone: Some("Nowhere/Special".into()),
            ..rule("daily")
        };
        assert!(matches!(
            raw.to_rule(Tz::UTC),
            Err(RuleError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn unknown_frequency() {
        assert!(matches!(
            rule("hourly").to_rule(Tz::UTC),
            Err(RuleError::UnknownFrequency(f)) if f == "hourly"
        ));
    }

    #[test]
    fn collects_every_error() {
        let mut config = config_with(vec![
            RawSchedule {
                user: "alice".into(),
                rule: rule("daily"),
            },
            RawSchedule {
                user: "alice".into(),
                rule: rule("daily"),
            },
            RawSchedule {
                user: "bob".into(),
                rule: RawScheduleRule {
                    anchor_day: Some(32),
                    ..rule("monthly")
                },
            },
        ]);
        config.join_window.window_minutes = Some(0);
        config.recurrence.enumeration_cap = Some(0);

        let errors = validate_config(&config);
        assert_eq!(errors.len(), 4);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateUser(u) if u == "alice")));
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::ScheduleError {
                error: RuleError::InvalidAnchorDay(32),
                ..
            }
        )));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidJoinWindow(_))));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidCap(0))));
    }

    #[test]
    fn lead_longer_than_window_is_rejected() {
        let mut config = config_with(vec![]);
        config.join_window.window_minutes = Some(5);
        config.join_window.starting_soon_minutes = Some(15);
        assert_eq!(validate_config(&config).len(), 1);

        config.join_window.starting_soon_minutes = Some(5);
        assert!(validate_config(&config).is_empty());

        // Default lead of 10 minutes against a shorter configured window
        config.join_window.starting_soon_minutes = None;
        assert_eq!(validate_config(&config).len(), 1);
    }
}
