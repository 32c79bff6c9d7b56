//! Configuration parsing and validation for cadence
//!
//! Supports TOML configuration with:
//! - Versioned schema
//! - Service settings (data directory, default timezone)
//! - Join window policy and recurrence limits
//! - Seeded schedules
//! - Validation that reports every error at once

mod schema;
mod settings;
mod validation;

pub use schema::*;
pub use settings::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<Settings> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let settings = parse_config(&content)?;
    tracing::debug!(
        path = %path.display(),
        schedules = settings.schedules.len(),
        "Loaded configuration"
    );
    Ok(settings)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<Settings> {
    let raw: RawConfig = toml::from_str(content)?;

    // Check version
    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    // Validate
    let errors = validate_config(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(Settings::from_raw(raw))
}

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_api::Frequency;
    use cadence_util::DaysOfWeek;
    use std::io::Write;

    #[test]
    fn parse_minimal_config() {
        let settings = parse_config("config_version = 1").unwrap();
        assert!(settings.schedules.is_empty());
        assert_eq!(settings.join_window, JoinWindowConfig::default());
        assert_eq!(settings.recurrence.enumeration_cap, DEFAULT_ENUMERATION_CAP);
        assert_eq!(settings.service.default_timezone, chrono_tz::Tz::UTC);
    }

    #[test]
    fn parse_full_config() {
        let config = r#"
            config_version = 1

            [service]
            data_dir = "/var/lib/cadence"
            default_timezone = "America/New_York"

            [join_window]
            window_minutes = 45
            starting_soon_minutes = 5

            [recurrence]
            enumeration_cap = 100

            [[schedules]]
            user = "alice"
            frequency = "weekly"
            time = "09:00"
            days = ["mon", "wed"]
            timezone = "Europe/Berlin"

            [[schedules]]
            user = "bob"
            frequency = "monthly"
            time = "18:30"
            anchor_day = 31
        "#;

        let settings = parse_config(config).unwrap();
        assert_eq!(
            settings.service.data_dir.as_deref(),
            Some(Path::new("/var/lib/cadence"))
        );
        assert_eq!(settings.join_window.window_minutes, 45);
        assert_eq!(settings.join_window.starting_soon_minutes, 5);
        assert_eq!(settings.recurrence.enumeration_cap, 100);
        assert_eq!(settings.schedules.len(), 2);

        let alice = &settings.schedules[0];
        assert_eq!(alice.user_id.as_str(), "alice");
        assert_eq!(alice.rule.timezone(), chrono_tz::Europe::Berlin);
        assert_eq!(
            *alice.rule.frequency(),
            Frequency::Weekly {
                days: DaysOfWeek::new(DaysOfWeek::MONDAY | DaysOfWeek::WEDNESDAY)
            }
        );

        let bob = &settings.schedules[1];
        assert_eq!(bob.rule.timezone(), chrono_tz::America::New_York);
        assert_eq!(bob.rule.anchor_day(), Some(31));
    }

    #[test]
    fn reject_wrong_version() {
        let result = parse_config("config_version = 99");
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn reject_invalid_schedule() {
        let config = r#"
            config_version = 1

            [[schedules]]
            user = "alice"
            frequency = "weekly"
            time = "09:00"
            days = []
        "#;

        match parse_config(config) {
            Err(ConfigError::ValidationFailed { errors }) => assert_eq!(errors.len(), 1),
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "config_version = 1").unwrap();
        writeln!(file, "[[schedules]]").unwrap();
        writeln!(file, "user = \"carol\"").unwrap();
        writeln!(file, "frequency = \"daily\"").unwrap();
        writeln!(file, "time = \"07:15\"").unwrap();

        let settings = load_config(file.path()).unwrap();
        assert_eq!(settings.schedules.len(), 1);
        assert_eq!(settings.schedules[0].rule.frequency().name(), "daily");
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
