use std::sync::{Arc, RwLock};

use ap_core::types::PipelineStatus;
use ap_harness::retry::{Idempotency, RetryPolicy};
use ap_integrations::gateway::{IssueTracker, Result};
use ap_integrations::types::{
    AssignmentId, AssignmentRequest, BoardItem, CloseReason, IssueComment, IssueSummary,
    LinkedPullRequest, MergeStrategy, PrFile, SubIssue,
};

use Idempotency::{Idempotent, NonIdempotent};

/// The tracker as seen by the orchestrator.
///
/// Reads and idempotent writes (status update, retarget, merge, close,
/// branch delete) are retried with backoff. Creates, assignments and
/// comments run exactly once so a timeout can never duplicate them.
#[derive(Clone)]
pub struct Gateway {
    tracker: Arc<dyn IssueTracker>,
    policy: Arc<RwLock<RetryPolicy>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("policy", &self.policy())
            .finish()
    }
}

impl Gateway {
    pub fn new(tracker: Arc<dyn IssueTracker>, policy: RetryPolicy) -> Self {
        Self {
            tracker,
            policy: Arc::new(RwLock::new(policy)),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_policy(&self, policy: RetryPolicy) {
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub fn tracker(&self) -> &Arc<dyn IssueTracker> {
        &self.tracker
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    pub async fn get_issue(&self, issue: u64) -> Result<IssueSummary> {
        self.policy()
            .run("get_issue", Idempotent, || self.tracker.get_issue(issue))
            .await
    }

    pub async fn get_issue_comments(&self, issue: u64) -> Result<Vec<IssueComment>> {
        self.policy()
            .run("get_issue_comments", Idempotent, || {
                self.tracker.get_issue_comments(issue)
            })
            .await
    }

    pub async fn get_issue_body(&self, issue: u64) -> Result<String> {
        self.policy()
            .run("get_issue_body", Idempotent, || self.tracker.get_issue_body(issue))
            .await
    }

    pub async fn update_issue_body(&self, issue: u64, body: &str) -> Result<()> {
        self.policy()
            .run("update_issue_body", Idempotent, || {
                self.tracker.update_issue_body(issue, body)
            })
            .await
    }

    pub async fn post_comment(&self, issue: u64, body: &str) -> Result<()> {
        self.policy()
            .run("post_comment", NonIdempotent, || {
                self.tracker.post_comment(issue, body)
            })
            .await
    }

    pub async fn create_sub_issue(&self, parent: u64, title: &str, body: &str) -> Result<u64> {
        self.policy()
            .run("create_sub_issue", NonIdempotent, || {
                self.tracker.create_sub_issue(parent, title, body)
            })
            .await
    }

    pub async fn list_sub_issues(&self, parent: u64) -> Result<Vec<SubIssue>> {
        self.policy()
            .run("list_sub_issues", Idempotent, || {
                self.tracker.list_sub_issues(parent)
            })
            .await
    }

    pub async fn close_issue(&self, issue: u64, reason: CloseReason) -> Result<()> {
        self.policy()
            .run("close_issue", Idempotent, || {
                self.tracker.close_issue(issue, reason)
            })
            .await
    }

    pub async fn assign_worker(
        &self,
        issue: u64,
        request: &AssignmentRequest,
    ) -> Result<AssignmentId> {
        self.policy()
            .run("assign_worker", NonIdempotent, || {
                self.tracker.assign_worker(issue, request)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Pull requests
    // -----------------------------------------------------------------------

    pub async fn find_open_prs(&self, issue: u64) -> Result<Vec<LinkedPullRequest>> {
        self.policy()
            .run("find_open_prs", Idempotent, || self.tracker.find_open_prs(issue))
            .await
    }

    pub async fn get_pull_request(&self, pr: u64) -> Result<LinkedPullRequest> {
        self.policy()
            .run("get_pull_request", Idempotent, || {
                self.tracker.get_pull_request(pr)
            })
            .await
    }

    pub async fn merge_pr(&self, pr: u64, strategy: MergeStrategy) -> Result<String> {
        self.policy()
            .run("merge_pr", Idempotent, || self.tracker.merge_pr(pr, strategy))
            .await
    }

    pub async fn update_pr_base(&self, pr: u64, base: &str) -> Result<()> {
        self.policy()
            .run("update_pr_base", Idempotent, || {
                self.tracker.update_pr_base(pr, base)
            })
            .await
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.policy()
            .run("delete_branch", Idempotent, || {
                self.tracker.delete_branch(branch)
            })
            .await
    }

    pub async fn mark_pr_ready_for_review(&self, pr: u64) -> Result<()> {
        self.policy()
            .run("mark_pr_ready_for_review", Idempotent, || {
                self.tracker.mark_pr_ready_for_review(pr)
            })
            .await
    }

    pub async fn request_review(&self, pr: u64, reviewer: &str) -> Result<()> {
        self.policy()
            .run("request_review", Idempotent, || {
                self.tracker.request_review(pr, reviewer)
            })
            .await
    }

    pub async fn list_pr_files(&self, pr: u64) -> Result<Vec<PrFile>> {
        self.policy()
            .run("list_pr_files", Idempotent, || self.tracker.list_pr_files(pr))
            .await
    }

    pub async fn get_file_content(&self, path: &str, git_ref: &str) -> Result<Option<String>> {
        self.policy()
            .run("get_file_content", Idempotent, || {
                self.tracker.get_file_content(path, git_ref)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Board
    // -----------------------------------------------------------------------

    pub async fn update_status(&self, issue: u64, status: PipelineStatus) -> Result<()> {
        self.policy()
            .run("update_status", Idempotent, || {
                self.tracker.update_status(issue, status)
            })
            .await
    }

    pub async fn list_board_items(&self) -> Result<Vec<BoardItem>> {
        self.policy()
            .run("list_board_items", Idempotent, || {
                self.tracker.list_board_items()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_integrations::fake::{FakeOp, FakeTracker};
    use ap_integrations::gateway::GatewayError;
    use std::time::Duration;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn reads_are_retried() {
        let fake = Arc::new(FakeTracker::new());
        let issue = fake.add_issue("Login", "body");
        fake.fail_next(FakeOp::Body, GatewayError::Transient("502".into()));
        fake.fail_next(FakeOp::Body, GatewayError::Transient("502".into()));

        let gateway = Gateway::new(fake.clone(), quick_policy());
        assert_eq!(gateway.get_issue_body(issue).await.unwrap(), "body");
        assert_eq!(fake.calls(FakeOp::Body), 3);
    }

    #[tokio::test]
    async fn assignments_are_not_retried() {
        let fake = Arc::new(FakeTracker::new());
        let issue = fake.add_issue("Login", "");
        fake.fail_next(FakeOp::Assign, GatewayError::Assignment("timeout".into()));

        let gateway = Gateway::new(fake.clone(), quick_policy());
        let request = AssignmentRequest {
            worker: "copilot".into(),
            agent: "specify".into(),
            base_branch: None,
        };
        assert!(gateway.assign_worker(issue, &request).await.is_err());
        assert_eq!(fake.calls(FakeOp::Assign), 1);
        assert!(fake.assignments().is_empty());
    }

    #[tokio::test]
    async fn permission_errors_are_not_retried() {
        let fake = Arc::new(FakeTracker::new());
        fake.fail_always(FakeOp::UpdateStatus, GatewayError::Permission("403".into()));

        let gateway = Gateway::new(fake.clone(), quick_policy());
        let err = gateway
            .update_status(1, PipelineStatus::Ready)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(fake.calls(FakeOp::UpdateStatus), 1);
    }

    #[tokio::test]
    async fn policy_swap_takes_effect() {
        let fake = Arc::new(FakeTracker::new());
        let issue = fake.add_issue("Login", "body");
        let gateway = Gateway::new(fake.clone(), quick_policy());
        gateway.set_policy(RetryPolicy::none());

        fake.fail_next(FakeOp::Body, GatewayError::Transient("502".into()));
        assert!(gateway.get_issue_body(issue).await.is_err());
        assert_eq!(fake.calls(FakeOp::Body), 1);
        assert_eq!(gateway.policy().max_attempts, 1);
    }
}
