//! Upward HTTP interface: read-only pipeline snapshots, the workflow
//! trigger and the polling status readout.

use std::sync::Arc;

use ap_core::types::{PipelineError, PipelineState};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::api_error::ApiError;
use crate::orchestrator::Orchestrator;
use crate::polling::{PollReport, PollingLoop};

pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub polling: Arc<PollingLoop>,
}

impl ApiState {
    pub fn new(polling: Arc<PollingLoop>) -> Self {
        Self {
            orchestrator: polling.orchestrator().clone(),
            polling,
        }
    }
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/pipelines", get(list_pipelines))
        .route("/api/pipelines/{issue}", get(get_pipeline))
        .route("/api/pipelines/{issue}/start", post(start_pipeline))
        .route("/api/polling/status", get(polling_status))
        .layer(axum::middleware::from_fn(
            ap_telemetry::middleware::request_id_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    tracked: usize,
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tracked: state.orchestrator.store().len().await,
    })
}

async fn list_pipelines(State(state): State<Arc<ApiState>>) -> Json<Vec<PipelineState>> {
    Json(state.orchestrator.store().snapshot().await)
}

async fn get_pipeline(
    State(state): State<Arc<ApiState>>,
    Path(issue): Path<u64>,
) -> Result<Json<PipelineState>, ApiError> {
    state
        .orchestrator
        .store()
        .get(issue)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("issue #{issue} is not tracked")))
}

async fn start_pipeline(
    State(state): State<Arc<ApiState>>,
    Path(issue): Path<u64>,
) -> Result<Json<PipelineState>, ApiError> {
    let started = state.orchestrator.start_workflow(issue).await?;
    Ok(Json(started))
}

#[derive(Debug, Serialize)]
struct IssueErrorView {
    issue: u64,
    halted: bool,
    last_error: PipelineError,
}

#[derive(Debug, Serialize)]
struct PollingStatusView {
    ticks: u64,
    running: bool,
    last_tick_at: Option<chrono::DateTime<chrono::Utc>>,
    last_report: Option<PollReport>,
    issue_errors: Vec<IssueErrorView>,
}

async fn polling_status(State(state): State<Arc<ApiState>>) -> Json<PollingStatusView> {
    let status = state.polling.status().await;
    let issue_errors = state
        .orchestrator
        .store()
        .snapshot()
        .await
        .into_iter()
        .filter_map(|s| {
            s.last_error.map(|last_error| IssueErrorView {
                issue: s.issue_number,
                halted: s.halted,
                last_error,
            })
        })
        .collect();
    Json(PollingStatusView {
        ticks: status.ticks,
        running: status.running,
        last_tick_at: status.last_tick_at,
        last_report: status.last_report,
        issue_errors,
    })
}
