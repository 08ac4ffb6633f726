use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub token: Option<String>,
    pub owner: String,
    pub repo: String,
    /// Owner of the Projects v2 board; the repository owner when `None`.
    pub project_owner: Option<String>,
    pub project_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: IssueState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubIssue {
    pub number: u64,
    pub title: String,
    pub state: IssueState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

/// Pull-request timeline events the pipeline reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEvent {
    WorkStarted,
    WorkFinished,
    ReviewRequested,
    ReadyForReview,
    ConvertedToDraft,
    Other(String),
}

impl TimelineEvent {
    /// Map a GitHub timeline `event` name.
    pub fn from_event_name(name: &str) -> Self {
        match name {
            "copilot_work_started" => TimelineEvent::WorkStarted,
            "copilot_work_finished" => TimelineEvent::WorkFinished,
            "review_requested" => TimelineEvent::ReviewRequested,
            "ready_for_review" => TimelineEvent::ReadyForReview,
            "convert_to_draft" => TimelineEvent::ConvertedToDraft,
            other => TimelineEvent::Other(other.to_string()),
        }
    }

    /// Events that mean the coding agent has handed its work back.
    pub fn signals_work_finished(&self) -> bool {
        matches!(
            self,
            TimelineEvent::WorkFinished
                | TimelineEvent::ReviewRequested
                | TimelineEvent::ReadyForReview
        )
    }
}

/// A pull request linked to an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedPullRequest {
    pub number: u64,
    pub branch: String,
    pub base_branch: String,
    pub state: PrState,
    pub draft: bool,
    pub head_sha: Option<String>,
    pub merge_commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeline_events: Vec<TimelineEvent>,
}

impl LinkedPullRequest {
    pub fn is_open(&self) -> bool {
        self.state == PrState::Open
    }

    pub fn is_merged(&self) -> bool {
        self.state == PrState::Merged
    }

    /// The agent is done with this PR: a finishing timeline event, the PR
    /// has left draft, or it has already been merged.
    pub fn work_finished(&self) -> bool {
        self.is_merged()
            || (self.is_open() && !self.draft)
            || self
                .timeline_events
                .iter()
                .any(TimelineEvent::signals_work_finished)
    }

    pub fn review_requested(&self) -> bool {
        self.timeline_events
            .iter()
            .any(|e| *e == TimelineEvent::ReviewRequested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Completed,
    NotPlanned,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::NotPlanned => "not_planned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Squash => "squash",
            MergeStrategy::Merge => "merge",
            MergeStrategy::Rebase => "rebase",
        }
    }
}

/// Identifier of an accepted worker assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentId(pub String);

/// What to assign and where the worker should branch from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub worker: String,
    pub agent: String,
    pub base_branch: Option<String>,
}

/// An issue on the project board with its raw status column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardItem {
    pub issue: u64,
    pub title: String,
    pub status: Option<String>,
}

/// A file changed by a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrFile {
    pub filename: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(draft: bool, state: PrState, events: Vec<TimelineEvent>) -> LinkedPullRequest {
        LinkedPullRequest {
            number: 1,
            branch: "copilot/plan".into(),
            base_branch: "main".into(),
            state,
            draft,
            head_sha: None,
            merge_commit_sha: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            timeline_events: events,
        }
    }

    #[test]
    fn event_names_map_to_signals() {
        assert_eq!(
            TimelineEvent::from_event_name("copilot_work_finished"),
            TimelineEvent::WorkFinished
        );
        assert_eq!(
            TimelineEvent::from_event_name("labeled"),
            TimelineEvent::Other("labeled".into())
        );
        assert!(TimelineEvent::ReadyForReview.signals_work_finished());
        assert!(!TimelineEvent::WorkStarted.signals_work_finished());
    }

    #[test]
    fn draft_pr_without_events_is_not_finished() {
        assert!(!pr(true, PrState::Open, vec![TimelineEvent::WorkStarted]).work_finished());
        assert!(pr(true, PrState::Open, vec![TimelineEvent::WorkFinished]).work_finished());
        assert!(pr(false, PrState::Open, vec![]).work_finished());
        assert!(pr(true, PrState::Merged, vec![]).work_finished());
    }

    #[test]
    fn close_reason_wire_names() {
        assert_eq!(CloseReason::Completed.as_str(), "completed");
        assert_eq!(
            serde_json::to_string(&CloseReason::NotPlanned).unwrap(),
            "\"not_planned\""
        );
    }
}
