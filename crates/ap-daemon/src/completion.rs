use ap_core::marker::is_completion_marker;
use ap_core::types::{PipelineState, PipelineStatus};
use ap_integrations::types::LinkedPullRequest;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::orchestrator::Orchestrator;

/// How an agent's completion was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum CompletionSignal {
    /// The completion marker was posted on `issue`.
    Marker { issue: u64 },
    /// The agent's pull request reports its work as finished.
    PullRequest { pr: u64 },
}

/// Which signals count for a detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Completion marker only.
    MarkerOnly,
    /// Marker, or the child PR reporting work finished.
    MarkerOrPullRequest,
}

impl Detection {
    /// Comment-producing stages accept either signal. The implementation
    /// stage is picked up from PR signals by its own phase.
    pub fn for_phase_zero(status: PipelineStatus) -> Self {
        if status == PipelineStatus::InProgress {
            Detection::MarkerOnly
        } else {
            Detection::MarkerOrPullRequest
        }
    }
}

impl Orchestrator {
    /// The PR an agent produced: the latest on its sub-issue, or on the parent
    /// when it has none (excluding the main-branch PR).
    pub async fn find_child_pr(
        &self,
        state: &PipelineState,
        agent: &str,
    ) -> Result<Option<LinkedPullRequest>> {
        let prs = match state.sub_issue_for(agent) {
            Some(sub) => self.gateway().find_open_prs(sub).await?,
            None => {
                let binding = state.main_branch.as_ref().map(|b| b.source_pr);
                self.gateway()
                    .find_open_prs(state.issue_number)
                    .await?
                    .into_iter()
                    .filter(|pr| Some(pr.number) != binding)
                    .collect()
            }
        };
        Ok(prs
            .into_iter()
            .max_by_key(|pr| (pr.created_at, pr.number)))
    }

    /// Look for the completion marker of `agent`, on its sub-issue when it
    /// has one and on the parent issue otherwise.
    pub async fn find_marker(&self, state: &PipelineState, agent: &str) -> Result<Option<u64>> {
        let target = state.sub_issue_for(agent).unwrap_or(state.issue_number);
        let comments = self.gateway().get_issue_comments(target).await?;
        Ok(comments
            .iter()
            .any(|c| is_completion_marker(&c.body, agent))
            .then_some(target))
    }

    /// Whether `agent` has finished, and how that was observed.
    pub async fn detect_completion(
        &self,
        state: &PipelineState,
        agent: &str,
        detection: Detection,
    ) -> Result<Option<CompletionSignal>> {
        if let Some(issue) = self.find_marker(state, agent).await? {
            return Ok(Some(CompletionSignal::Marker { issue }));
        }
        if detection == Detection::MarkerOnly {
            return Ok(None);
        }
        self.detect_pr_completion(state, agent).await
    }

    /// Completion from the child PR's state and timeline.
    pub async fn detect_pr_completion(
        &self,
        state: &PipelineState,
        agent: &str,
    ) -> Result<Option<CompletionSignal>> {
        match self.find_child_pr(state, agent).await? {
            Some(pr) if pr.work_finished() => Ok(Some(CompletionSignal::PullRequest { pr: pr.number })),
            Some(pr) => {
                debug!(
                    issue = state.issue_number,
                    agent,
                    pr = pr.number,
                    draft = pr.draft,
                    "pull request still in progress"
                );
                Ok(None)
            }
            None => {
                debug!(issue = state.issue_number, agent, "no pull request yet");
                Ok(None)
            }
        }
    }
}
