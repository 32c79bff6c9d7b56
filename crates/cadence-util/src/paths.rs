//! Default paths for cadence
//!
//! Paths are user-writable by default:
//! - Config: `$XDG_CONFIG_HOME/cadence/config.toml` or `~/.config/cadence/config.toml`
//! - Data: `$XDG_DATA_HOME/cadence` or `~/.local/share/cadence`

use std::path::PathBuf;

/// Environment variable for overriding the config file path
pub const CADENCE_CONFIG_ENV: &str = "CADENCE_CONFIG";

/// Environment variable for overriding the data directory
pub const CADENCE_DATA_DIR_ENV: &str = "CADENCE_DATA_DIR";

/// Database filename within the data directory
pub const DATABASE_FILENAME: &str = "cadence.db";

const CONFIG_FILENAME: &str = "config.toml";

/// Application subdirectory name
const APP_DIR: &str = "cadence";

/// Get the default config file path.
///
/// Order of precedence:
/// 1. `$XDG_CONFIG_HOME/cadence/config.toml` (if XDG_CONFIG_HOME is set)
/// 2. `~/.config/cadence/config.toml`
/// 3. `/etc/cadence/config.toml` (fallback)
pub fn default_config_path() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(APP_DIR).join(CONFIG_FILENAME);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILENAME);
    }

    PathBuf::from("/etc").join(APP_DIR).join(CONFIG_FILENAME)
}

/// Get the default data directory.
///
/// Order of precedence:
/// 1. `$CADENCE_DATA_DIR` environment variable (if set)
/// 2. `$XDG_DATA_HOME/cadence` (if XDG_DATA_HOME is set)
/// 3. `~/.local/share/cadence` (fallback)
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(CADENCE_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

/// Get the data directory without checking the CADENCE_DATA_DIR env var.
/// Used for default values in configs where the env var is checked separately.
pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR);
    }

    // Last resort
    PathBuf::from("/tmp").join(APP_DIR).join("data")
}
