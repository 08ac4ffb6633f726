//! Agent pipeline daemon.
//!
//! Drives tracked issues through their agent stages:
//! - Pipeline state store and orchestrator (assignment, advancement, transitions)
//! - Hierarchical branch merge of agent output
//! - Completion detection, recovery and self-healing
//! - The polling loop and the HTTP status API

pub mod api;
pub mod api_error;
pub mod completion;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod merge;
pub mod orchestrator;
pub mod phases;
pub mod polling;
pub mod recovery;
pub mod store;
