//! Terminal front end for the reconcile engine
//!
//! 1. Diffing - classified changes between desired and observed
//! 2. Planning - ordered actions
//! 3. Simulating - apply against an in-memory backend with progress

pub mod differ;
pub mod executor;
pub mod planner;

pub use differ::{DiffReport, display_diff};
pub use executor::{SimulateOptions, parse_failure, simulate};
pub use planner::display_plan;
