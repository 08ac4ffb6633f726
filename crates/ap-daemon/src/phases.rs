//! The six per-tick phases, each a named operation on one issue.
//!
//! The polling loop runs every phase over all tracked issues before moving
//! to the next one, so for a single issue the order is always 0 to 5.

use ap_core::types::{PipelineState, PipelineStatus};
use serde::Serialize;
use tracing::debug;

use crate::completion::Detection;
use crate::error::Result;
use crate::orchestrator::{Advance, AssignmentResult, Orchestrator};
use crate::recovery::HealOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PostOutputs,
    BacklogIntake,
    ReadyPipeline,
    InProgress,
    InReview,
    Recovery,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::PostOutputs,
        Phase::BacklogIntake,
        Phase::ReadyPipeline,
        Phase::InProgress,
        Phase::InReview,
        Phase::Recovery,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::PostOutputs => "post_outputs",
            Phase::BacklogIntake => "backlog_intake",
            Phase::ReadyPipeline => "ready_pipeline",
            Phase::InProgress => "in_progress",
            Phase::InReview => "in_review",
            Phase::Recovery => "recovery",
        }
    }
}

/// What a phase did for one issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Idle,
    OutputsPosted,
    Advanced,
    Transitioned,
    Assigned,
    ReviewRequested,
    Recovered,
}

impl From<Advance> for PhaseOutcome {
    fn from(advance: Advance) -> Self {
        match advance {
            Advance::Transitioned(_) => PhaseOutcome::Transitioned,
            Advance::NextAgent(_) | Advance::AlreadyRecorded => PhaseOutcome::Advanced,
        }
    }
}

impl From<AssignmentResult> for PhaseOutcome {
    fn from(result: AssignmentResult) -> Self {
        match result {
            AssignmentResult::Assigned { .. } => PhaseOutcome::Assigned,
            _ => PhaseOutcome::Idle,
        }
    }
}

impl Orchestrator {
    pub async fn run_phase(&self, phase: Phase, issue: u64) -> Result<PhaseOutcome> {
        let Some(state) = self.store().get(issue).await else {
            return Ok(PhaseOutcome::Idle);
        };
        match phase {
            Phase::PostOutputs => self.post_outputs(state).await,
            Phase::BacklogIntake => self.drive_stage(state, PipelineStatus::Backlog).await,
            Phase::ReadyPipeline => self.drive_stage(state, PipelineStatus::Ready).await,
            Phase::InProgress => self.drive_in_progress(state).await,
            Phase::InReview => self.verify_review(state).await,
            Phase::Recovery => match self.self_heal(issue).await? {
                HealOutcome::Reassigned(_) => Ok(PhaseOutcome::Recovered),
                HealOutcome::Skipped(reason) => {
                    debug!(issue, ?reason, "recovery not needed");
                    Ok(PhaseOutcome::Idle)
                }
            },
        }
    }

    /// Phase 0: merge and publish the output of an agent that has finished.
    async fn post_outputs(&self, state: PipelineState) -> Result<PhaseOutcome> {
        if state.status.is_terminal() || state.status.is_review() {
            return Ok(PhaseOutcome::Idle);
        }
        let Some(agent) = state.current_agent() else {
            return Ok(PhaseOutcome::Idle);
        };
        if state.outputs_posted.contains(agent) {
            return Ok(PhaseOutcome::Idle);
        }
        let detection = Detection::for_phase_zero(state.status);
        match self.detect_completion(&state, agent, detection).await? {
            Some(signal) => {
                debug!(issue = state.issue_number, agent, ?signal, "agent completion detected");
                self.merge_agent_output(state.issue_number, agent).await?;
                Ok(PhaseOutcome::OutputsPosted)
            }
            None => Ok(PhaseOutcome::Idle),
        }
    }

    /// Phases 1 and 2: advance past agents whose output is posted, and
    /// assign the current agent if nobody is working on it.
    async fn drive_stage(&self, state: PipelineState, status: PipelineStatus) -> Result<PhaseOutcome> {
        if state.status != status {
            return Ok(PhaseOutcome::Idle);
        }
        if state.is_stage_complete() {
            return self.transition(state.issue_number).await.map(|_| PhaseOutcome::Transitioned);
        }
        let Some(agent) = state.current_agent() else {
            return Ok(PhaseOutcome::Idle);
        };
        if state.outputs_posted.contains(agent) {
            let advance = self.advance_on_completion(state.issue_number, agent).await?;
            return Ok(advance.into());
        }
        self.assign_if_idle(&state).await
    }

    /// Phase 3: the implementation agent reports through its pull request.
    async fn drive_in_progress(&self, state: PipelineState) -> Result<PhaseOutcome> {
        if state.status != PipelineStatus::InProgress {
            return Ok(PhaseOutcome::Idle);
        }
        if state.is_stage_complete() {
            return self.transition(state.issue_number).await.map(|_| PhaseOutcome::Transitioned);
        }
        let Some(agent) = state.current_agent() else {
            return Ok(PhaseOutcome::Idle);
        };
        let issue = state.issue_number;

        if !state.outputs_posted.contains(agent) {
            if self.detect_pr_completion(&state, agent).await?.is_none() {
                return self.assign_if_idle(&state).await;
            }
            self.merge_agent_output(issue, agent).await?;
        }
        let advance = self.advance_on_completion(issue, agent).await?;
        Ok(advance.into())
    }

    /// Phase 4: the primary PR has a review requested; once merged, the
    /// issue is done.
    async fn verify_review(&self, state: PipelineState) -> Result<PhaseOutcome> {
        if !state.status.is_review() {
            return Ok(PhaseOutcome::Idle);
        }
        let issue = state.issue_number;
        let Some(binding) = self.main_branch(issue).await? else {
            debug!(issue, "in review without a pull request");
            return Ok(PhaseOutcome::Idle);
        };

        let pr = self.gateway().get_pull_request(binding.source_pr).await?;
        if pr.is_merged() {
            self.transition(issue).await?;
            return Ok(PhaseOutcome::Transitioned);
        }
        if pr.review_requested() {
            if !state.review_requested {
                self.store().update(issue, |s| s.review_requested = true).await;
            }
            return Ok(PhaseOutcome::Idle);
        }
        if self.ensure_review(issue).await? {
            Ok(PhaseOutcome::ReviewRequested)
        } else {
            Ok(PhaseOutcome::Idle)
        }
    }

    async fn assign_if_idle(&self, state: &PipelineState) -> Result<PhaseOutcome> {
        if state.started_at.is_some() || state.halted || self.pending().is_pending(state.issue_number) {
            return Ok(PhaseOutcome::Idle);
        }
        let result = self.assign_next(state.issue_number, state.status).await?;
        Ok(result.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_run_in_fixed_order() {
        let names: Vec<&str> = Phase::ALL.iter().map(Phase::name).collect();
        assert_eq!(
            names,
            vec![
                "post_outputs",
                "backlog_intake",
                "ready_pipeline",
                "in_progress",
                "in_review",
                "recovery"
            ]
        );
    }

    #[test]
    fn advance_maps_to_outcome() {
        let transitioned = Advance::Transitioned(crate::orchestrator::Transition {
            from: PipelineStatus::Backlog,
            to: PipelineStatus::Ready,
        });
        assert_eq!(PhaseOutcome::from(transitioned), PhaseOutcome::Transitioned);
        assert_eq!(
            PhaseOutcome::from(AssignmentResult::AlreadyPending),
            PhaseOutcome::Idle
        );
    }
}
