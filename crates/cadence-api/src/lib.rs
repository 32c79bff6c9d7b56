//! Domain types for cadence
//!
//! This crate defines the values shared between the scheduler core, the
//! store and any caller:
//! - Recurrence rules (validated on construction)
//! - Schedule instances and their occurrences
//! - Occurrence lifecycle states and classifications
//! - Session contexts created on join

mod rule;
mod types;

pub use rule::*;
pub use types::*;
