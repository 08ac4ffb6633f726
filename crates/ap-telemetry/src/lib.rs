//! Logging and tracing setup for the agent pipeline daemon.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Spans**: trace ids and the `tick` / `issue` spans the polling loop runs in
//! - **Middleware**: `X-Request-Id` propagation for the HTTP API

pub mod logging;
pub mod middleware;
pub mod spans;
