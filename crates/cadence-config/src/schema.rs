//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Service-level settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Join window policy
    #[serde(default)]
    pub join_window: RawJoinWindow,

    /// Recurrence engine limits
    #[serde(default)]
    pub recurrence: RawRecurrence,

    /// Schedules to seed with `cadence apply`
    #[serde(default)]
    pub schedules: Vec<RawSchedule>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// Data directory for the store
    pub data_dir: Option<PathBuf>,

    /// Timezone used by schedules that don't name one (default: UTC)
    pub default_timezone: Option<String>,
}

/// Join window settings, in minutes
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawJoinWindow {
    /// How long after the start an occurrence stays joinable
    pub window_minutes: Option<u32>,

    /// How long before the start an occurrence counts as starting soon
    pub starting_soon_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawRecurrence {
    /// Maximum occurrences produced by one enumeration
    pub enumeration_cap: Option<usize>,
}

/// Seeded schedule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSchedule {
    /// Owning user
    pub user: String,

    #[serde(flatten)]
    pub rule: RawScheduleRule,
}

/// Recurrence rule as written in the config file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawScheduleRule {
    /// "daily", "weekly" or "monthly"
    pub frequency: String,

    /// Local start time (HH:MM format)
    pub time: Option<String>,

    /// Weekly only
    pub days: Option<RawDays>,

    /// Monthly only; defaults to the day the schedule is created
    pub anchor_day: Option<u32>,

    /// IANA timezone name
    pub timezone: Option<String>,
}

/// Days specification
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawDays {
    Preset(String),
    List(Vec<String>),
}
