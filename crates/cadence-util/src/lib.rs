//! Shared utilities for cadence
//!
//! This crate provides:
//! - ID types (UserId, ScheduleId, OccurrenceId, SessionContextId)
//! - Clock abstraction (system clock with mock time, manual clock for tests)
//! - Time-of-day and weekday-set types
//! - Default paths for config and data directories

mod ids;
mod paths;
mod time;

pub use ids::*;
pub use paths::*;
pub use time::*;
