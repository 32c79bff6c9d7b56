//! Validated settings types

use crate::schema::RawConfig;
use cadence_api::{parse_timezone, ScheduleRule};
use cadence_util::{data_dir_without_env, UserId, CADENCE_DATA_DIR_ENV};
use chrono_tz::Tz;
use std::path::PathBuf;

pub use cadence_api::{
    DEFAULT_ENUMERATION_CAP, DEFAULT_STARTING_SOON_MINUTES, DEFAULT_WINDOW_MINUTES,
};

/// Validated settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub service: ServiceConfig,
    pub join_window: JoinWindowConfig,
    pub recurrence: RecurrenceConfig,
    /// Schedules to create with `cadence apply`
    pub schedules: Vec<SeedSchedule>,
}

impl Settings {
    /// Convert from an already validated raw config
    pub fn from_raw(raw: RawConfig) -> Self {
        let default_timezone = raw
            .service
            .default_timezone
            .as_deref()
            .and_then(|name| parse_timezone(name).ok())
            .unwrap_or(Tz::UTC);

        let service = ServiceConfig {
            data_dir: raw.service.data_dir,
            default_timezone,
        };

        let join_window = JoinWindowConfig {
            window_minutes: raw
                .join_window
                .window_minutes
                .unwrap_or(DEFAULT_WINDOW_MINUTES),
            starting_soon_minutes: raw
                .join_window
                .starting_soon_minutes
                .unwrap_or(DEFAULT_STARTING_SOON_MINUTES),
        };

        let recurrence = RecurrenceConfig {
            enumeration_cap: raw
                .recurrence
                .enumeration_cap
                .unwrap_or(DEFAULT_ENUMERATION_CAP),
        };

        // Rules were checked by validate_config
        let schedules = raw
            .schedules
            .into_iter()
            .filter_map(|s| {
                let rule = s.rule.to_rule(default_timezone).ok()?;
                Some(SeedSchedule {
                    user_id: UserId::new(s.user),
                    rule,
                })
            })
            .collect();

        Self {
            service,
            join_window,
            recurrence,
            schedules,
        }
    }
}

/// Service-level configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Data directory from the config file, if any
    pub data_dir: Option<PathBuf>,
    pub default_timezone: Tz,
}

impl ServiceConfig {
    /// Effective data directory.
    ///
    /// `CADENCE_DATA_DIR` wins over the config file, which wins over the
    /// XDG default.
    pub fn data_dir(&self) -> PathBuf {
        if let Ok(path) = std::env::var(CADENCE_DATA_DIR_ENV) {
            return PathBuf::from(path);
        }
        self.data_dir.clone().unwrap_or_else(data_dir_without_env)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_timezone: Tz::UTC,
        }
    }
}

/// Join window policy, in minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinWindowConfig {
    pub window_minutes: u32,
    pub starting_soon_minutes: u32,
}

impl Default for JoinWindowConfig {
    fn default() -> Self {
        Self {
            window_minutes: DEFAULT_WINDOW_MINUTES,
            starting_soon_minutes: DEFAULT_STARTING_SOON_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurrenceConfig {
    pub enumeration_cap: usize,
}

impl Default for RecurrenceConfig {
    fn default() -> Self {
        Self {
            enumeration_cap: DEFAULT_ENUMERATION_CAP,
        }
    }
}

/// Schedule declared in the config file
#[derive(Debug, Clone, PartialEq)]
pub struct SeedSchedule {
    pub user_id: UserId,
    pub rule: ScheduleRule,
}
