use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Span wrapping one polling tick.
pub fn tick_span(tick: u64, trace_id: &str) -> tracing::Span {
    tracing::info_span!("tick", tick, trace_id = %trace_id)
}

/// Span wrapping the work done for one issue inside a phase.
pub fn issue_span(issue: u64, phase: &str) -> tracing::Span {
    tracing::info_span!("issue", issue, phase = %phase)
}
