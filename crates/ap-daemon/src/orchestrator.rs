use std::collections::BTreeMap;
use std::sync::Arc;

use ap_core::config::{ConfigHandle, Settings};
use ap_core::marker::{parse_sub_issue_title, sub_issue_body, sub_issue_title};
use ap_core::tracking;
use ap_core::types::{MainBranchBinding, PipelineState, PipelineStatus};
use ap_harness::cooldown::RecoveryCooldowns;
use ap_harness::in_flight::PendingAssignments;
use ap_harness::retry::RetryPolicy;
use ap_integrations::gateway::IssueTracker;
use ap_integrations::types::{AssignmentRequest, CloseReason};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::gateway::Gateway;
use crate::store::PipelineStore;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AssignmentResult {
    Assigned {
        agent: String,
        target_issue: u64,
        base_branch: Option<String>,
    },
    /// Another tick already holds the assignment for this issue.
    AlreadyPending,
    StageComplete,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: PipelineStatus,
    pub to: PipelineStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Advance {
    /// The stage continues with the next agent.
    NextAgent(AssignmentResult),
    Transitioned(Transition),
    /// The agent was already recorded as done.
    AlreadyRecorded,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns the pipeline state of every tracked issue and every mutation of it.
///
/// All tracker calls go through [`Gateway`]. The tracking table in the parent
/// issue body is written before the in-memory state is committed, so a
/// restart can always rebuild what the store held.
pub struct Orchestrator {
    store: PipelineStore,
    gateway: Gateway,
    config: Arc<ConfigHandle>,
    pending: PendingAssignments,
    cooldowns: RecoveryCooldowns,
}

impl Orchestrator {
    pub fn new(tracker: Arc<dyn IssueTracker>, config: Arc<ConfigHandle>) -> Self {
        let policy = RetryPolicy::from(&config.current().config.retry);
        Self {
            store: PipelineStore::new(),
            gateway: Gateway::new(tracker, policy),
            config,
            pending: PendingAssignments::new(),
            cooldowns: RecoveryCooldowns::new(),
        }
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn pending(&self) -> &PendingAssignments {
        &self.pending
    }

    pub fn cooldowns(&self) -> &RecoveryCooldowns {
        &self.cooldowns
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.config.current()
    }

    /// Re-read configuration and apply the retry policy it carries.
    pub fn refresh_config(&self) -> Arc<Settings> {
        let settings = self.config.refresh();
        self.gateway
            .set_policy(RetryPolicy::from(&settings.config.retry));
        settings
    }

    pub(crate) async fn tracked(&self, issue: u64) -> Result<PipelineState> {
        self.store
            .get(issue)
            .await
            .ok_or(OrchestratorError::UnknownIssue(issue))
    }

    /// Render `state` into the parent issue body. Skips the write when
    /// nothing changed.
    pub(crate) async fn write_tracking(&self, state: &PipelineState) -> Result<()> {
        let settings = self.settings();
        let body = self.gateway.get_issue_body(state.issue_number).await?;
        let block = tracking::render(state, &settings.mapping);
        let updated = tracking::upsert_block(&body, &block);
        if updated != body {
            self.gateway
                .update_issue_body(state.issue_number, &updated)
                .await?;
            debug!(issue = state.issue_number, "tracking table updated");
        }
        Ok(())
    }

    /// Earliest open or merged PR across the issue and its sub-issues.
    pub(crate) async fn discover_main_branch(
        &self,
        state: &PipelineState,
    ) -> Result<Option<MainBranchBinding>> {
        let mut candidates = self.gateway.find_open_prs(state.issue_number).await?;
        for sub in state.sub_issues.values() {
            candidates.extend(self.gateway.find_open_prs(*sub).await?);
        }
        Ok(candidates
            .into_iter()
            .min_by_key(|pr| (pr.created_at, pr.number))
            .map(|pr| {
                let revision = pr.merge_commit_sha.or(pr.head_sha);
                MainBranchBinding::new(pr.branch, pr.number, revision)
            }))
    }

    /// The known binding, or one discovered from existing PRs and stored.
    pub(crate) async fn main_branch(&self, issue: u64) -> Result<Option<MainBranchBinding>> {
        let state = self.tracked(issue).await?;
        if state.main_branch.is_some() {
            return Ok(state.main_branch);
        }
        let discovered = self.discover_main_branch(&state).await?;
        if let Some(binding) = &discovered {
            info!(
                issue,
                branch = %binding.branch_name,
                pr = binding.source_pr,
                "main branch discovered"
            );
            let binding = binding.clone();
            self.store
                .update(issue, |s| {
                    s.main_branch.get_or_insert(binding);
                })
                .await;
        }
        Ok(discovered)
    }

    // -----------------------------------------------------------------------
    // assign_next
    // -----------------------------------------------------------------------

    /// Assign the current agent of `status` to its sub-issue.
    ///
    /// The pending claim is taken before the tracker call and released only
    /// if the call fails, so an overlapping tick sees `AlreadyPending`.
    pub async fn assign_next(&self, issue: u64, status: PipelineStatus) -> Result<AssignmentResult> {
        let state = self.tracked(issue).await?;
        if state.status != status {
            return Err(OrchestratorError::StatusMismatch {
                issue,
                expected: status,
                actual: state.status,
            });
        }
        if state.halted {
            debug!(issue, "assignment skipped, pipeline halted");
            return Ok(AssignmentResult::Halted);
        }
        let Some(agent) = state.current_agent().map(str::to_string) else {
            return Ok(AssignmentResult::StageComplete);
        };

        let now = Utc::now();
        if !self.pending.claim(issue, &agent, now) {
            return Ok(AssignmentResult::AlreadyPending);
        }

        match self.dispatch(&state, &agent).await {
            Ok((target_issue, base_branch)) => {
                self.store
                    .update(issue, |s| {
                        s.mark_assigned(now);
                        s.clear_error();
                    })
                    .await;
                info!(
                    issue,
                    agent = %agent,
                    target_issue,
                    base_branch = base_branch.as_deref().unwrap_or("<none>"),
                    "agent assigned"
                );
                Ok(AssignmentResult::Assigned {
                    agent,
                    target_issue,
                    base_branch,
                })
            }
            Err(e) => {
                self.pending.release(issue);
                warn!(issue, agent = %agent, error = %e, "assignment failed, claim released");
                Err(e)
            }
        }
    }

    async fn dispatch(&self, state: &PipelineState, agent: &str) -> Result<(u64, Option<String>)> {
        let settings = self.settings();
        let binding = self.main_branch(state.issue_number).await?;
        let target_issue = state.sub_issue_for(agent).unwrap_or(state.issue_number);
        let request = AssignmentRequest {
            worker: settings.config.pipeline.worker.clone(),
            agent: agent.to_string(),
            base_branch: binding.map(|b| b.branch_name),
        };
        self.gateway.assign_worker(target_issue, &request).await?;
        Ok((target_issue, request.base_branch))
    }

    // -----------------------------------------------------------------------
    // advance_on_completion
    // -----------------------------------------------------------------------

    /// Record `agent` as done, then transition or assign the next agent.
    ///
    /// The tracking table is written before the next agent is assigned.
    pub async fn advance_on_completion(&self, issue: u64, agent: &str) -> Result<Advance> {
        let mut state = self.tracked(issue).await?;
        if !state.complete_agent(agent)? {
            return Ok(Advance::AlreadyRecorded);
        }

        self.write_tracking(&state).await?;
        self.store.insert(state.clone()).await;
        self.pending.release(issue);
        info!(
            issue,
            agent,
            completed = state.current_index,
            of = state.agent_sequence.len(),
            "agent completed"
        );

        if let Some(sub) = state.sub_issue_for(agent) {
            if let Err(e) = self.gateway.close_issue(sub, CloseReason::Completed).await {
                warn!(issue, sub_issue = sub, error = %e, "failed to close sub-issue");
            }
        }

        if state.is_stage_complete() {
            self.transition(issue).await.map(Advance::Transitioned)
        } else {
            self.assign_next(issue, state.status)
                .await
                .map(Advance::NextAgent)
        }
    }

    // -----------------------------------------------------------------------
    // transition
    // -----------------------------------------------------------------------

    /// Move the issue to the next status that needs attention.
    ///
    /// Statuses without agents are skipped. Entering the review stage hands
    /// the primary PR to the reviewer instead of assigning an agent.
    pub async fn transition(&self, issue: u64) -> Result<Transition> {
        let settings = self.settings();
        let state = self.tracked(issue).await?;
        let from = state.status;
        let next = from
            .next()
            .ok_or(OrchestratorError::State(ap_core::types::StateError::StageComplete {
                status: from,
            }))?;
        let to = settings.mapping.first_active_from(next);

        self.gateway.update_status(issue, to).await?;
        info!(issue, from = %from, to = %to, "status transition");
        self.enter(state, to, &settings).await?;

        if to.is_review() {
            self.ensure_review(issue).await?;
        } else if !to.is_terminal() {
            self.assign_next(issue, to).await?;
        }
        Ok(Transition { from, to })
    }

    /// Reset `state` into `to` and persist it. A terminal status drops it.
    async fn enter(&self, mut state: PipelineState, to: PipelineStatus, settings: &Settings) -> Result<()> {
        let issue = state.issue_number;
        state.enter_status(to, settings.mapping.agents_for(to).to_vec());
        self.write_tracking(&state).await?;
        self.pending.release(issue);
        if to.is_terminal() {
            self.store.remove(issue).await;
            self.cooldowns.clear(issue);
            info!(issue, "pipeline finished");
        } else {
            self.store.insert(state).await;
        }
        Ok(())
    }

    /// Mark the primary PR ready and request a review. Returns `false` when
    /// the issue has no PR yet.
    pub async fn ensure_review(&self, issue: u64) -> Result<bool> {
        let settings = self.settings();
        let Some(binding) = self.main_branch(issue).await? else {
            warn!(issue, "review stage reached without a pull request");
            return Ok(false);
        };
        self.gateway
            .mark_pr_ready_for_review(binding.source_pr)
            .await?;
        self.gateway
            .request_review(binding.source_pr, &settings.config.pipeline.reviewer)
            .await?;
        self.store.update(issue, |s| s.review_requested = true).await;
        info!(issue, pr = binding.source_pr, reviewer = %settings.config.pipeline.reviewer, "review requested");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // External changes
    // -----------------------------------------------------------------------

    /// Adopt a status set outside the pipeline. The board is never written
    /// back; the stage starts fresh in the observed status.
    pub async fn accept_external_status(&self, issue: u64, observed: PipelineStatus) -> Result<bool> {
        let settings = self.settings();
        let state = self.tracked(issue).await?;
        if state.status == observed {
            return Ok(false);
        }
        warn!(
            issue,
            internal = %state.status,
            observed = %observed,
            "status changed outside the pipeline, accepting"
        );
        self.enter(state, observed, &settings).await?;
        Ok(true)
    }

    /// Lift fatal halts, e.g. after the configuration changed.
    pub async fn resume_halted(&self) -> usize {
        let mut resumed = 0;
        self.store
            .update_all(|s| {
                if s.halted {
                    s.resume();
                    resumed += 1;
                }
            })
            .await;
        if resumed > 0 {
            info!(resumed, "halted pipelines resumed");
        }
        resumed
    }

    /// Record a failure against the issue's state.
    pub async fn record_failure(&self, issue: u64, err: &OrchestratorError) {
        let kind = err.kind();
        if err.is_fatal() {
            error!(issue, error = %err, "fatal pipeline error, halting automatic assignment");
        } else {
            warn!(issue, error = %err, "transient pipeline error");
        }
        let message = err.to_string();
        self.store
            .update(issue, |s| s.record_error(kind, message))
            .await;
    }

    // -----------------------------------------------------------------------
    // start_workflow
    // -----------------------------------------------------------------------

    /// Put an issue under the pipeline.
    ///
    /// Creates the missing `[agent]` sub-issues, writes the tracking table,
    /// moves the issue to its first status with agents and assigns the first
    /// agent. A tracked issue is returned as is (and resumed if halted).
    pub async fn start_workflow(&self, issue: u64) -> Result<PipelineState> {
        if self.store.contains(issue).await {
            self.store
                .update(issue, |s| {
                    if s.halted {
                        s.resume();
                    }
                })
                .await;
            return self.tracked(issue).await;
        }

        let settings = self.settings();
        let summary = self.gateway.get_issue(issue).await?;
        if tracking::parse(&summary.body).is_some() {
            info!(issue, "tracking table present, reconstructing instead of starting");
            return self
                .reconstruct(issue, None)
                .await?
                .ok_or(OrchestratorError::UnknownIssue(issue));
        }

        let status = settings.mapping.first_active_from(PipelineStatus::Backlog);
        if status.is_terminal() {
            return Err(OrchestratorError::MissingMapping(
                "every status".to_string(),
            ));
        }

        let sub_issues = self.ensure_sub_issues(issue, &summary.title, &settings).await?;
        let mut state = PipelineState::new(issue, status, settings.mapping.agents_for(status).to_vec());
        state.sub_issues = sub_issues;

        let block = tracking::render(&state, &settings.mapping);
        self.gateway
            .update_issue_body(issue, &tracking::upsert_block(&summary.body, &block))
            .await?;
        self.store.insert(state).await;
        self.gateway.update_status(issue, status).await?;
        info!(issue, status = %status, "workflow started");

        if status.is_review() {
            self.ensure_review(issue).await?;
        } else {
            self.assign_next(issue, status).await?;
        }
        self.tracked(issue).await
    }

    /// Existing sub-issues by agent, creating the ones that are missing.
    async fn ensure_sub_issues(
        &self,
        issue: u64,
        title: &str,
        settings: &Settings,
    ) -> Result<BTreeMap<String, u64>> {
        let mut sub_issues = self.sub_issue_map(issue, settings).await?;
        for (_, agent) in settings.mapping.all_agents() {
            if sub_issues.contains_key(agent) {
                continue;
            }
            let number = self
                .gateway
                .create_sub_issue(issue, &sub_issue_title(agent, title), &sub_issue_body(agent, issue))
                .await?;
            debug!(issue, agent, sub_issue = number, "sub-issue created");
            sub_issues.insert(agent.to_string(), number);
        }
        Ok(sub_issues)
    }

    /// Sub-issues matched to configured agents by their `[agent]` title prefix.
    pub(crate) async fn sub_issue_map(
        &self,
        issue: u64,
        settings: &Settings,
    ) -> Result<BTreeMap<String, u64>> {
        let mut map = BTreeMap::new();
        for sub in self.gateway.list_sub_issues(issue).await? {
            let Some(name) = parse_sub_issue_title(&sub.title) else {
                continue;
            };
            match settings.mapping.canonical_agent(name) {
                Some(agent) => {
                    map.entry(agent.to_string()).or_insert(sub.number);
                }
                None => debug!(issue, sub_issue = sub.number, name, "sub-issue for unknown agent"),
            }
        }
        Ok(map)
    }
}
