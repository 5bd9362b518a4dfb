//! Shared domain types for Stepline.
//!
//! Defines the workflow definition model (steps, connections, triggers,
//! variable declarations), the instance execution state, and the append-only
//! execution log entry. Depends only on serde/uuid/chrono -- no IO crates.

pub mod error;
pub mod workflow;
