use ap_core::tracking::{self, TrackingTable};
use ap_core::types::{AgentProgress, PipelineState, PipelineStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::orchestrator::{AssignmentResult, Orchestrator};

/// Why recovery left an issue alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealSkip {
    NotApplicable,
    Halted,
    PendingAssignment,
    CoolingDown,
    NotActiveInTable,
    RecentActivity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HealOutcome {
    Reassigned(AssignmentResult),
    Skipped(HealSkip),
}

/// Status implied by the table alone: the stage of the first row that is
/// not done.
fn infer_status(table: &TrackingTable) -> Option<PipelineStatus> {
    if let Some((status, _)) = table.active_agent() {
        if status.is_some() {
            return status;
        }
    }
    let unfinished = table
        .rows
        .iter()
        .find(|r| r.progress != AgentProgress::Done)
        .and_then(|r| r.status);
    match unfinished {
        Some(status) => Some(status),
        None if table.rows.is_empty() => None,
        None => Some(PipelineStatus::Done),
    }
}

impl Orchestrator {
    /// Rebuild an issue's state from the tracker.
    ///
    /// The tracking table gives the stage progress, `[agent]` sub-issue titles
    /// the sub-issue map, and the earliest open or merged PR the main branch.
    /// An issue without a table is untracked and yields `None`. A stage that
    /// turns out to be complete transitions immediately.
    pub async fn reconstruct(
        &self,
        issue: u64,
        board_status: Option<PipelineStatus>,
    ) -> Result<Option<PipelineState>> {
        let settings = self.settings();
        let body = self.gateway().get_issue_body(issue).await?;
        let Some(table) = tracking::parse(&body) else {
            debug!(issue, "no tracking table, issue is untracked");
            return Ok(None);
        };

        let Some(status) = board_status.or_else(|| infer_status(&table)) else {
            debug!(issue, "tracking table has no rows");
            return Ok(None);
        };
        if status.is_terminal() {
            return Ok(None);
        }

        let progress = table.progress_for(status, settings.mapping.agents_for(status));
        let complete = progress.is_complete() && !status.is_review();
        let mut state = progress.into_state(issue, status);
        if let Err(err) = state.check_invariants() {
            warn!(issue, error = %err, "tracking table progress is inconsistent, restarting stage");
            state.current_index = 0;
            state.completed_agents.clear();
        }
        state.sub_issues = self.sub_issue_map(issue, &settings).await?;
        state.main_branch = self.discover_main_branch(&state).await?;

        // An agent the table shows as running keeps running; recovery takes
        // over if it stays silent past the staleness window.
        if let Some(agent) = state.current_agent() {
            if table.progress_of(agent) == Some(AgentProgress::Active) {
                state.started_at = Some(Utc::now());
            }
        }

        info!(
            issue,
            status = %status,
            completed = state.current_index,
            of = state.agent_sequence.len(),
            sub_issues = state.sub_issues.len(),
            main_branch = state.main_branch.as_ref().map(|b| b.branch_name.as_str()).unwrap_or("<none>"),
            "pipeline state reconstructed"
        );
        self.store().insert(state).await;

        if complete {
            self.transition(issue).await?;
        }
        Ok(self.store().get(issue).await)
    }

    /// Most recent sign of life for the current agent: its assignment,
    /// a comment on its sub-issue, or an update to its pull request.
    async fn last_activity(
        &self,
        state: &PipelineState,
        agent: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let target = state.sub_issue_for(agent).unwrap_or(state.issue_number);
        let comments = self.gateway().get_issue_comments(target).await?;
        let last_comment = comments.iter().map(|c| c.created_at).max();
        let last_pr = self
            .find_child_pr(state, agent)
            .await?
            .map(|pr| pr.updated_at);
        Ok([state.started_at, last_comment, last_pr]
            .into_iter()
            .flatten()
            .max())
    }

    /// Re-assign the current agent of a stalled pipeline.
    ///
    /// Stalled means the tracking table shows the agent active, no live
    /// pending assignment exists, nothing happened within the staleness
    /// window, and the per-issue cooldown has elapsed.
    pub async fn self_heal(&self, issue: u64) -> Result<HealOutcome> {
        let settings = self.settings();
        let state = self.tracked(issue).await?;
        if state.status.is_terminal() || state.status.is_review() {
            return Ok(HealOutcome::Skipped(HealSkip::NotApplicable));
        }
        if state.halted {
            return Ok(HealOutcome::Skipped(HealSkip::Halted));
        }
        let Some(agent) = state.current_agent().map(str::to_string) else {
            return Ok(HealOutcome::Skipped(HealSkip::NotApplicable));
        };

        let now = Utc::now();
        let recovery = &settings.config.recovery;
        if self.pending().is_live(issue, now, recovery.staleness()) {
            return Ok(HealOutcome::Skipped(HealSkip::PendingAssignment));
        }
        if !self.cooldowns().is_eligible(issue, now, recovery.cooldown()) {
            return Ok(HealOutcome::Skipped(HealSkip::CoolingDown));
        }

        let body = self.gateway().get_issue_body(issue).await?;
        let active = tracking::parse(&body)
            .and_then(|table| table.progress_of(&agent))
            == Some(AgentProgress::Active);
        if !active {
            return Ok(HealOutcome::Skipped(HealSkip::NotActiveInTable));
        }

        if let Some(last) = self.last_activity(&state, &agent).await? {
            if now - last < recovery.staleness() {
                return Ok(HealOutcome::Skipped(HealSkip::RecentActivity));
            }
        }

        warn!(issue, agent = %agent, "pipeline stalled, re-assigning agent");
        self.cooldowns().record(issue, now);
        self.pending().release(issue);
        self.store().update(issue, |s| s.started_at = None).await;
        let result = self.assign_next(issue, state.status).await?;
        Ok(HealOutcome::Reassigned(result))
    }
}
