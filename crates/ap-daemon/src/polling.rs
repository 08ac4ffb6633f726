use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ap_core::types::{ErrorKind, PipelineStatus};
use ap_harness::in_flight::{IssueLease, IssueLocks};
use ap_telemetry::spans::{generate_trace_id, issue_span, tick_span};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn, Instrument};

use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::phases::{Phase, PhaseOutcome};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A failure recorded during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueFailure {
    /// `None` for tick-level failures such as an unreadable board.
    pub issue: Option<u64>,
    pub phase: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of a single polling tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub tick: u64,
    pub trace_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub tracked: usize,
    pub reconstructed: usize,
    pub external_status_changes: usize,
    pub outputs_posted: usize,
    pub advanced: usize,
    pub transitions: usize,
    pub assignments: usize,
    pub reviews_requested: usize,
    pub recovered: usize,
    pub failures: usize,
    /// Issues skipped because an overlapping tick still holds them.
    pub skipped_in_flight: usize,
    pub errors: Vec<IssueFailure>,
}

impl PollReport {
    fn count(&mut self, outcome: PhaseOutcome) {
        match outcome {
            PhaseOutcome::Idle => {}
            PhaseOutcome::OutputsPosted => self.outputs_posted += 1,
            PhaseOutcome::Advanced => self.advanced += 1,
            PhaseOutcome::Transitioned => self.transitions += 1,
            PhaseOutcome::Assigned => self.assignments += 1,
            PhaseOutcome::ReviewRequested => self.reviews_requested += 1,
            PhaseOutcome::Recovered => self.recovered += 1,
        }
    }

    fn fail(&mut self, issue: Option<u64>, phase: &str, err: &OrchestratorError) {
        self.failures += 1;
        self.errors.push(IssueFailure {
            issue,
            phase: phase.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

/// Readout of the polling loop for the status API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollingStatus {
    pub ticks: u64,
    pub running: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_report: Option<PollReport>,
}

// ---------------------------------------------------------------------------
// PollingLoop
// ---------------------------------------------------------------------------

/// Runs the reconciliation tick over every tracked issue.
///
/// Issues are leased for the whole tick; an overlapping tick skips the
/// issues it cannot lease. Within a tick every phase finishes for all
/// issues before the next phase starts.
pub struct PollingLoop {
    orchestrator: Arc<Orchestrator>,
    locks: IssueLocks,
    ticks: AtomicU64,
    generation: AtomicU64,
    status: RwLock<PollingStatus>,
}

impl PollingLoop {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let generation = orchestrator.settings().generation;
        Self {
            orchestrator,
            locks: IssueLocks::new(),
            ticks: AtomicU64::new(0),
            generation: AtomicU64::new(generation),
            status: RwLock::new(PollingStatus::default()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub async fn status(&self) -> PollingStatus {
        self.status.read().await.clone()
    }

    /// Run one tick and return its report.
    pub async fn tick(&self) -> PollReport {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let trace_id = generate_trace_id();
        let span = tick_span(tick, &trace_id);

        self.status.write().await.running = true;
        let report = self.run_tick(tick, trace_id).instrument(span).await;

        let mut status = self.status.write().await;
        status.running = false;
        if tick >= status.ticks {
            status.ticks = tick;
            status.last_tick_at = report.started_at;
            status.last_report = Some(report.clone());
        }
        report
    }

    async fn run_tick(&self, tick: u64, trace_id: String) -> PollReport {
        let started = Instant::now();
        let mut report = PollReport {
            tick,
            trace_id,
            started_at: Some(Utc::now()),
            ..PollReport::default()
        };

        let settings = self.orchestrator.refresh_config();
        let previous = self.generation.swap(settings.generation, Ordering::SeqCst);
        if previous != settings.generation {
            self.orchestrator.resume_halted().await;
        }

        let board = match self.orchestrator.gateway().list_board_items().await {
            Ok(items) => items,
            Err(e) => {
                let err = OrchestratorError::from(e);
                error!(error = %err, "failed to read the project board, skipping tick");
                report.fail(None, "board", &err);
                report.duration_ms = started.elapsed().as_millis() as u64;
                return report;
            }
        };
        let board_status: BTreeMap<u64, PipelineStatus> = board
            .iter()
            .filter_map(|item| {
                let status = PipelineStatus::parse(item.status.as_deref()?)?;
                Some((item.issue, status))
            })
            .collect();

        let mut candidates: BTreeSet<u64> = board_status.keys().copied().collect();
        candidates.extend(self.orchestrator.store().issues().await);

        let mut leases: Vec<IssueLease> = Vec::new();
        for issue in candidates {
            match self.locks.try_acquire(issue) {
                Some(lease) => leases.push(lease),
                None => {
                    warn!(issue, "issue still held by an earlier tick, skipping");
                    report.skipped_in_flight += 1;
                }
            }
        }

        let concurrency = settings.config.polling.max_concurrent_issues.max(1);
        let mut active: Vec<u64> = Vec::new();
        let synced: Vec<(u64, Result<SyncOutcome, OrchestratorError>)> = stream::iter(leases.iter())
            .map(|lease| {
                let issue = lease.issue();
                let observed = board_status.get(&issue).copied();
                async move {
                    let result = self
                        .sync_issue(issue, observed)
                        .instrument(issue_span(issue, "sync"))
                        .await;
                    (issue, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (issue, result) in synced {
            match result {
                Ok(SyncOutcome::Untracked) => {}
                Ok(SyncOutcome::Released) => report.external_status_changes += 1,
                Ok(outcome) => {
                    match outcome {
                        SyncOutcome::Reconstructed => report.reconstructed += 1,
                        SyncOutcome::Accepted => report.external_status_changes += 1,
                        _ => {}
                    }
                    active.push(issue);
                }
                Err(e) => {
                    self.orchestrator.record_failure(issue, &e).await;
                    report.fail(Some(issue), "sync", &e);
                }
            }
        }
        active.sort_unstable();

        for phase in Phase::ALL {
            let results: Vec<(u64, Result<PhaseOutcome, OrchestratorError>)> = stream::iter(active.iter().copied())
                .map(|issue| async move {
                    let result = self
                        .orchestrator
                        .run_phase(phase, issue)
                        .instrument(issue_span(issue, phase.name()))
                        .await;
                    (issue, result)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let mut failed = BTreeSet::new();
            for (issue, result) in results {
                match result {
                    Ok(outcome) => report.count(outcome),
                    Err(e) => {
                        self.orchestrator.record_failure(issue, &e).await;
                        report.fail(Some(issue), phase.name(), &e);
                        failed.insert(issue);
                    }
                }
            }
            // A failed issue sits out the rest of the tick.
            active.retain(|issue| !failed.contains(issue));
        }

        for issue in &active {
            self.orchestrator
                .store()
                .update(*issue, |s| {
                    if s.last_error.as_ref().is_some_and(|e| e.kind == ErrorKind::Transient) {
                        s.clear_error();
                    }
                })
                .await;
        }
        drop(leases);

        report.tracked = self.orchestrator.store().len().await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            tracked = report.tracked,
            reconstructed = report.reconstructed,
            outputs_posted = report.outputs_posted,
            advanced = report.advanced,
            transitions = report.transitions,
            assignments = report.assignments,
            recovered = report.recovered,
            failures = report.failures,
            duration_ms = report.duration_ms,
            "tick complete"
        );
        report
    }

    /// Bring the in-memory state in line with the board.
    async fn sync_issue(
        &self,
        issue: u64,
        observed: Option<PipelineStatus>,
    ) -> Result<SyncOutcome, OrchestratorError> {
        match (self.orchestrator.store().get(issue).await, observed) {
            (Some(state), Some(observed)) if state.status != observed => {
                self.orchestrator
                    .accept_external_status(issue, observed)
                    .await?;
                if self.orchestrator.store().contains(issue).await {
                    Ok(SyncOutcome::Accepted)
                } else {
                    Ok(SyncOutcome::Released)
                }
            }
            (Some(_), _) => Ok(SyncOutcome::Tracked),
            (None, Some(observed)) if !observed.is_terminal() => {
                match self.orchestrator.reconstruct(issue, Some(observed)).await? {
                    Some(_) => Ok(SyncOutcome::Reconstructed),
                    None => Ok(SyncOutcome::Untracked),
                }
            }
            (None, _) => Ok(SyncOutcome::Untracked),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Tracked,
    Reconstructed,
    Accepted,
    /// Moved to a terminal status outside the pipeline; state dropped.
    Released,
    Untracked,
}
