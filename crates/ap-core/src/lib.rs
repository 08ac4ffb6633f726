//! Core domain model for the agent pipeline.
//!
//! Holds everything that is pure data or pure transformation:
//! - Status model and per-issue pipeline state
//! - Case-insensitive name lookup used wherever board or agent names cross
//!   the tracker boundary
//! - The completion-marker and sub-issue title conventions
//! - The tracking table rendered into (and parsed back out of) issue bodies
//! - Configuration loading and per-tick refresh

pub mod config;
pub mod marker;
pub mod names;
pub mod tracking;
pub mod types;
