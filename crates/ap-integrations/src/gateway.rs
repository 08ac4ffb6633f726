use ap_core::types::PipelineStatus;
use ap_harness::retry::Retryable;
use async_trait::async_trait;

use crate::types::{
    AssignmentId, AssignmentRequest, BoardItem, CloseReason, IssueComment, IssueSummary,
    LinkedPullRequest, MergeStrategy, PrFile, SubIssue,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Network failure, rate limit or 5xx.
    #[error("transient tracker error: {0}")]
    Transient(String),
    /// The tracker did not accept the worker assignment. Retryable.
    #[error("assignment failed: {0}")]
    Assignment(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The request was rejected as malformed or conflicting.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::Assignment(_))
    }

    /// Needs an operator or configuration fix; not retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Permission(_) | GatewayError::Invalid(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }

    /// Classify an HTTP status returned by the tracker.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            403 if message.to_lowercase().contains("rate limit") => {
                GatewayError::Transient(message)
            }
            401 | 403 => GatewayError::Permission(message),
            404 | 410 => GatewayError::NotFound(message),
            408 | 429 => GatewayError::Transient(message),
            s if s >= 500 => GatewayError::Transient(message),
            _ => GatewayError::Invalid(message),
        }
    }
}

impl Retryable for GatewayError {
    fn is_transient(&self) -> bool {
        GatewayError::is_transient(self)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

// ---------------------------------------------------------------------------
// IssueTracker
// ---------------------------------------------------------------------------

/// Everything the pipeline needs from the issue tracker.
///
/// Issue and pull-request numbers share one namespace, as on GitHub.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn get_issue(&self, issue: u64) -> Result<IssueSummary>;

    /// Comments in creation order.
    async fn get_issue_comments(&self, issue: u64) -> Result<Vec<IssueComment>>;

    async fn get_issue_body(&self, issue: u64) -> Result<String>;

    async fn update_issue_body(&self, issue: u64, body: &str) -> Result<()>;

    async fn post_comment(&self, issue: u64, body: &str) -> Result<()>;

    /// Create an issue and link it as a sub-issue of `parent`.
    async fn create_sub_issue(&self, parent: u64, title: &str, body: &str) -> Result<u64>;

    async fn list_sub_issues(&self, parent: u64) -> Result<Vec<SubIssue>>;

    /// Closing an already closed issue succeeds.
    async fn close_issue(&self, issue: u64, reason: CloseReason) -> Result<()>;

    /// Hand `issue` to a worker. Fails with [`GatewayError::Assignment`] when
    /// the tracker did not take the assignment and with
    /// [`GatewayError::Permission`] when it never will.
    async fn assign_worker(&self, issue: u64, request: &AssignmentRequest) -> Result<AssignmentId>;

    /// Pull requests linked to `issue` that are open or merged.
    async fn find_open_prs(&self, issue: u64) -> Result<Vec<LinkedPullRequest>>;

    async fn get_pull_request(&self, pr: u64) -> Result<LinkedPullRequest>;

    /// Change the branch `pr` merges into. Setting the current base again
    /// succeeds.
    async fn update_pr_base(&self, pr: u64, base: &str) -> Result<()>;

    /// Merge and return the resulting head revision. Merging an already
    /// merged pull request succeeds.
    async fn merge_pr(&self, pr: u64, strategy: MergeStrategy) -> Result<String>;

    /// Deleting a branch that no longer exists succeeds.
    async fn delete_branch(&self, branch: &str) -> Result<()>;

    async fn mark_pr_ready_for_review(&self, pr: u64) -> Result<()>;

    async fn request_review(&self, pr: u64, reviewer: &str) -> Result<()>;

    /// Move `issue` to the `status` column of the project board.
    async fn update_status(&self, issue: u64, status: PipelineStatus) -> Result<()>;

    async fn list_board_items(&self) -> Result<Vec<BoardItem>>;

    async fn list_pr_files(&self, pr: u64) -> Result<Vec<PrFile>>;

    /// File content at `git_ref`, `None` when the path does not exist there.
    async fn get_file_content(&self, path: &str, git_ref: &str) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_classify() {
        assert!(GatewayError::from_status(502, "bad gateway").is_transient());
        assert!(GatewayError::from_status(429, "slow down").is_transient());
        assert!(GatewayError::from_status(403, "API rate limit exceeded").is_transient());
        assert!(GatewayError::from_status(403, "Resource not accessible").is_fatal());
        assert!(GatewayError::from_status(401, "Bad credentials").is_fatal());
        assert!(GatewayError::from_status(404, "Not Found").is_not_found());
        assert!(GatewayError::from_status(422, "Validation Failed").is_fatal());
    }

    #[test]
    fn not_found_is_neither_transient_nor_fatal() {
        let err = GatewayError::NotFound("gone".into());
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn assignment_errors_are_retryable() {
        let err = GatewayError::Assignment("worker busy".into());
        assert!(Retryable::is_transient(&err));
    }
}
