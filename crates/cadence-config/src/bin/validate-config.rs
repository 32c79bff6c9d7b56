//! Config validation CLI tool
//!
//! Validates a cadence configuration file and reports any errors.

use cadence_api::Frequency;
use cadence_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a cadence configuration file.");
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match cadence_config::load_config(&config_path) {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", cadence_config::CURRENT_CONFIG_VERSION);
            println!("  Default timezone: {}", settings.service.default_timezone);
            println!(
                "  Join window: {} min (starting soon {} min before)",
                settings.join_window.window_minutes, settings.join_window.starting_soon_minutes
            );
            println!("  Schedules: {}", settings.schedules.len());

            if !settings.schedules.is_empty() {
                println!();
                println!("Schedules:");
                for seed in &settings.schedules {
                    let rule = &seed.rule;
                    let detail = match rule.frequency() {
                        Frequency::Daily => "daily".to_string(),
                        Frequency::Weekly { days } => {
                            let names: Vec<String> = days.iter().map(|d| d.to_string()).collect();
                            format!("weekly ({})", names.join(", "))
                        }
                        Frequency::Monthly {
                            anchor_day: Some(day),
                        } => format!("monthly (day {})", day),
                        Frequency::Monthly { anchor_day: None } => {
                            "monthly (day of creation)".to_string()
                        }
                    };
                    println!(
                        "  - {} [{}] at {} {}",
                        seed.user_id,
                        detail,
                        rule.time(),
                        rule.timezone()
                    );
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                cadence_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                cadence_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                cadence_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                cadence_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        cadence_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
