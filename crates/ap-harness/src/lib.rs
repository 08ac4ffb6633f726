//! Reliability primitives for the pipeline daemon.
//!
//! Everything here is independent of the issue tracker:
//! - Bounded exponential-backoff retry, gated on an explicit idempotency flag
//! - Per-issue in-flight leases and the pending-assignment registry that keep
//!   overlapping poll ticks from double-assigning an agent
//! - Recovery cooldowns
//! - Cooperative shutdown

pub mod cooldown;
pub mod in_flight;
pub mod retry;
pub mod shutdown;
