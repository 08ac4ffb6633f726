//! In-memory [`IssueTracker`] for tests.
//!
//! Issues, sub-issues, comments, pull requests, branch files and the project
//! board live in one mutex-guarded model. Every call is counted, failures can
//! be injected per operation or per operation and target number, and
//! assignments can be slowed down to simulate overlapping poll ticks.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ap_core::types::PipelineStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::gateway::{GatewayError, IssueTracker, Result};
use crate::types::{
    AssignmentId, AssignmentRequest, BoardItem, CloseReason, IssueComment, IssueState,
    IssueSummary, LinkedPullRequest, MergeStrategy, PrFile, PrState, SubIssue, TimelineEvent,
};

/// Operations that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FakeOp {
    GetIssue,
    Comments,
    Body,
    UpdateBody,
    PostComment,
    CreateSubIssue,
    ListSubIssues,
    Close,
    Assign,
    FindPrs,
    GetPr,
    UpdateBase,
    Merge,
    DeleteBranch,
    MarkReady,
    RequestReview,
    UpdateStatus,
    BoardItems,
    PrFiles,
    FileContent,
}

/// A recorded `assign_worker` call that succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAssignment {
    pub issue: u64,
    pub worker: String,
    pub agent: String,
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeIssue {
    title: String,
    body: String,
    state: IssueState,
    close_reason: Option<CloseReason>,
    comments: Vec<IssueComment>,
    sub_issues: Vec<u64>,
    assignees: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakePr {
    linked_issue: u64,
    pr: LinkedPullRequest,
    files: Vec<String>,
}

#[derive(Debug, Default)]
struct Model {
    issues: BTreeMap<u64, FakeIssue>,
    prs: BTreeMap<u64, FakePr>,
    board: BTreeMap<u64, String>,
    /// (ref, path) to content.
    files: HashMap<(String, String), String>,
    branches: BTreeSet<String>,
    deleted_branches: Vec<String>,
    next_number: u64,
    next_comment_id: u64,
    clock: Option<DateTime<Utc>>,
    calls: HashMap<FakeOp, usize>,
    fail_next: HashMap<FakeOp, VecDeque<GatewayError>>,
    fail_always: HashMap<FakeOp, GatewayError>,
    /// Failures for one issue or pull request number only.
    fail_target: HashMap<(FakeOp, u64), GatewayError>,
    assignments: Vec<RecordedAssignment>,
    merges_applied: Vec<u64>,
    ready_marked: Vec<u64>,
    review_requests: Vec<(u64, String)>,
    status_updates: Vec<(u64, String)>,
}

impl Model {
    /// Monotonic timestamps one second apart, starting at construction time.
    fn tick_clock(&mut self) -> DateTime<Utc> {
        let next = match self.clock {
            Some(t) => t + chrono::Duration::seconds(1),
            None => Utc::now(),
        };
        self.clock = Some(next);
        next
    }

    fn allocate_number(&mut self) -> u64 {
        self.next_number += 1;
        self.next_number
    }

    fn issue(&self, number: u64) -> Result<&FakeIssue> {
        self.issues
            .get(&number)
            .ok_or_else(|| GatewayError::NotFound(format!("issue #{number}")))
    }

    fn issue_mut(&mut self, number: u64) -> Result<&mut FakeIssue> {
        self.issues
            .get_mut(&number)
            .ok_or_else(|| GatewayError::NotFound(format!("issue #{number}")))
    }

    fn pr(&self, number: u64) -> Result<&FakePr> {
        self.prs
            .get(&number)
            .ok_or_else(|| GatewayError::NotFound(format!("pull request #{number}")))
    }

    fn pr_mut(&mut self, number: u64) -> Result<&mut FakePr> {
        self.prs
            .get_mut(&number)
            .ok_or_else(|| GatewayError::NotFound(format!("pull request #{number}")))
    }

    fn insert_issue(&mut self, number: u64, title: &str, body: &str) {
        self.next_number = self.next_number.max(number);
        self.issues.insert(
            number,
            FakeIssue {
                title: title.to_string(),
                body: body.to_string(),
                state: IssueState::Open,
                close_reason: None,
                comments: Vec::new(),
                sub_issues: Vec::new(),
                assignees: Vec::new(),
            },
        );
    }
}

#[derive(Debug, Default)]
pub struct FakeTracker {
    model: Mutex<Model>,
    assign_latency: Mutex<Option<Duration>>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&self) -> MutexGuard<'_, Model> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and return an injected failure, if any.
    fn enter(&self, op: FakeOp) -> Result<MutexGuard<'_, Model>> {
        let mut model = self.model();
        *model.calls.entry(op).or_default() += 1;
        if let Some(err) = model.fail_next.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if let Some(err) = model.fail_always.get(&op) {
            return Err(err.clone());
        }
        Ok(model)
    }

    /// [`Self::enter`] for a call addressed to one issue or pull request.
    fn enter_for(&self, op: FakeOp, target: u64) -> Result<MutexGuard<'_, Model>> {
        let model = self.enter(op)?;
        if let Some(err) = model.fail_target.get(&(op, target)) {
            return Err(err.clone());
        }
        Ok(model)
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    pub fn add_issue(&self, title: &str, body: &str) -> u64 {
        let mut model = self.model();
        let number = model.allocate_number();
        model.insert_issue(number, title, body);
        number
    }

    /// Add an issue and link it under `parent`.
    pub fn add_sub_issue(&self, parent: u64, title: &str, state: IssueState) -> u64 {
        let mut model = self.model();
        let number = model.allocate_number();
        model.insert_issue(number, title, "");
        if let Some(issue) = model.issues.get_mut(&number) {
            issue.state = state;
        }
        if let Some(parent) = model.issues.get_mut(&parent) {
            parent.sub_issues.push(number);
        }
        number
    }

    pub fn add_comment(&self, issue: u64, author: &str, body: &str) {
        let mut model = self.model();
        let created_at = model.tick_clock();
        model.next_comment_id += 1;
        let id = model.next_comment_id;
        if let Some(target) = model.issues.get_mut(&issue) {
            target.comments.push(IssueComment {
                id,
                author: author.to_string(),
                body: body.to_string(),
                created_at,
            });
        }
    }

    /// Shift every comment on `issue` into the past.
    pub fn backdate_comments(&self, issue: u64, by: chrono::Duration) {
        if let Some(target) = self.model().issues.get_mut(&issue) {
            for comment in &mut target.comments {
                comment.created_at -= by;
            }
        }
    }

    pub fn set_board_status(&self, issue: u64, status: &str) {
        self.model().board.insert(issue, status.to_string());
    }

    /// Open a draft pull request from `branch` into `base`, linked to `issue`.
    pub fn add_pull_request(&self, issue: u64, branch: &str, base: &str) -> u64 {
        let mut model = self.model();
        let number = model.allocate_number();
        let now = model.tick_clock();
        model.branches.insert(branch.to_string());
        model.prs.insert(
            number,
            FakePr {
                linked_issue: issue,
                pr: LinkedPullRequest {
                    number,
                    branch: branch.to_string(),
                    base_branch: base.to_string(),
                    state: PrState::Open,
                    draft: true,
                    head_sha: Some(format!("{branch}-head")),
                    merge_commit_sha: None,
                    created_at: now,
                    updated_at: now,
                    timeline_events: vec![TimelineEvent::WorkStarted],
                },
                files: Vec::new(),
            },
        );
        number
    }

    pub fn add_timeline_event(&self, pr: u64, event: TimelineEvent) {
        let mut model = self.model();
        let now = model.tick_clock();
        if let Some(entry) = model.prs.get_mut(&pr) {
            entry.pr.timeline_events.push(event);
            entry.pr.updated_at = now;
        }
    }

    pub fn set_pr_draft(&self, pr: u64, draft: bool) {
        if let Some(entry) = self.model().prs.get_mut(&pr) {
            entry.pr.draft = draft;
        }
    }

    pub fn set_pr_state(&self, pr: u64, state: PrState) {
        if let Some(entry) = self.model().prs.get_mut(&pr) {
            entry.pr.state = state;
        }
    }

    /// Add a file changed by `pr`, readable at the PR's head branch.
    pub fn add_pr_file(&self, pr: u64, path: &str, content: &str) {
        let mut model = self.model();
        let Some(entry) = model.prs.get_mut(&pr) else {
            return;
        };
        entry.files.push(path.to_string());
        let branch = entry.pr.branch.clone();
        model
            .files
            .insert((branch, path.to_string()), content.to_string());
    }

    pub fn fail_next(&self, op: FakeOp, err: GatewayError) {
        self.model().fail_next.entry(op).or_default().push_back(err);
    }

    pub fn fail_always(&self, op: FakeOp, err: GatewayError) {
        self.model().fail_always.insert(op, err);
    }

    /// Fail every `op` call addressed to `target` until cleared.
    pub fn fail_always_for(&self, op: FakeOp, target: u64, err: GatewayError) {
        self.model().fail_target.insert((op, target), err);
    }

    pub fn clear_failures(&self) {
        let mut model = self.model();
        model.fail_next.clear();
        model.fail_always.clear();
        model.fail_target.clear();
    }

    /// Delay every `assign_worker` call before it takes effect.
    pub fn set_assign_latency(&self, latency: Duration) {
        *self.assign_latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn calls(&self, op: FakeOp) -> usize {
        self.model().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn body(&self, issue: u64) -> Option<String> {
        self.model().issues.get(&issue).map(|i| i.body.clone())
    }

    pub fn comments(&self, issue: u64) -> Vec<String> {
        self.model()
            .issues
            .get(&issue)
            .map(|i| i.comments.iter().map(|c| c.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn issue_state(&self, issue: u64) -> Option<IssueState> {
        self.model().issues.get(&issue).map(|i| i.state)
    }

    pub fn close_reason(&self, issue: u64) -> Option<CloseReason> {
        self.model().issues.get(&issue).and_then(|i| i.close_reason)
    }

    pub fn sub_issue_numbers(&self, parent: u64) -> Vec<u64> {
        self.model()
            .issues
            .get(&parent)
            .map(|i| i.sub_issues.clone())
            .unwrap_or_default()
    }

    pub fn issue_title(&self, issue: u64) -> Option<String> {
        self.model().issues.get(&issue).map(|i| i.title.clone())
    }

    pub fn board_status(&self, issue: u64) -> Option<String> {
        self.model().board.get(&issue).cloned()
    }

    pub fn assignments(&self) -> Vec<RecordedAssignment> {
        self.model().assignments.clone()
    }

    pub fn merges_applied(&self) -> Vec<u64> {
        self.model().merges_applied.clone()
    }

    pub fn pr_state(&self, pr: u64) -> Option<PrState> {
        self.model().prs.get(&pr).map(|p| p.pr.state)
    }

    pub fn pr_base(&self, pr: u64) -> Option<String> {
        self.model().prs.get(&pr).map(|p| p.pr.base_branch.clone())
    }

    pub fn deleted_branches(&self) -> Vec<String> {
        self.model().deleted_branches.clone()
    }

    pub fn ready_marked(&self) -> Vec<u64> {
        self.model().ready_marked.clone()
    }

    pub fn review_requests(&self) -> Vec<(u64, String)> {
        self.model().review_requests.clone()
    }

    pub fn status_updates(&self) -> Vec<(u64, String)> {
        self.model().status_updates.clone()
    }

    pub fn file_at(&self, git_ref: &str, path: &str) -> Option<String> {
        self.model()
            .files
            .get(&(git_ref.to_string(), path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn get_issue(&self, issue: u64) -> Result<IssueSummary> {
        let model = self.enter_for(FakeOp::GetIssue, issue)?;
        let found = model.issue(issue)?;
        Ok(IssueSummary {
            number: issue,
            title: found.title.clone(),
            body: found.body.clone(),
            state: found.state,
        })
    }

    async fn get_issue_comments(&self, issue: u64) -> Result<Vec<IssueComment>> {
        let model = self.enter_for(FakeOp::Comments, issue)?;
        Ok(model.issue(issue)?.comments.clone())
    }

    async fn get_issue_body(&self, issue: u64) -> Result<String> {
        let model = self.enter_for(FakeOp::Body, issue)?;
        Ok(model.issue(issue)?.body.clone())
    }

    async fn update_issue_body(&self, issue: u64, body: &str) -> Result<()> {
        let mut model = self.enter_for(FakeOp::UpdateBody, issue)?;
        model.issue_mut(issue)?.body = body.to_string();
        Ok(())
    }

    async fn post_comment(&self, issue: u64, body: &str) -> Result<()> {
        let mut model = self.enter_for(FakeOp::PostComment, issue)?;
        let created_at = model.tick_clock();
        model.next_comment_id += 1;
        let id = model.next_comment_id;
        model.issue_mut(issue)?.comments.push(IssueComment {
            id,
            author: "agent-pipeline".into(),
            body: body.to_string(),
            created_at,
        });
        Ok(())
    }

    async fn create_sub_issue(&self, parent: u64, title: &str, body: &str) -> Result<u64> {
        let mut model = self.enter_for(FakeOp::CreateSubIssue, parent)?;
        model.issue(parent)?;
        let number = model.allocate_number();
        model.insert_issue(number, title, body);
        model.issue_mut(parent)?.sub_issues.push(number);
        Ok(number)
    }

    async fn list_sub_issues(&self, parent: u64) -> Result<Vec<SubIssue>> {
        let model = self.enter_for(FakeOp::ListSubIssues, parent)?;
        let parent = model.issue(parent)?;
        Ok(parent
            .sub_issues
            .iter()
            .filter_map(|n| {
                model.issues.get(n).map(|i| SubIssue {
                    number: *n,
                    title: i.title.clone(),
                    state: i.state,
                })
            })
            .collect())
    }

    async fn close_issue(&self, issue: u64, reason: CloseReason) -> Result<()> {
        let mut model = self.enter_for(FakeOp::Close, issue)?;
        let target = model.issue_mut(issue)?;
        if target.state == IssueState::Open {
            target.state = IssueState::Closed;
            target.close_reason = Some(reason);
        }
        Ok(())
    }

    async fn assign_worker(&self, issue: u64, request: &AssignmentRequest) -> Result<AssignmentId> {
        drop(self.enter_for(FakeOp::Assign, issue)?);

        let latency = *self.assign_latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut model = self.model();
        let target = model.issue_mut(issue)?;
        if !target.assignees.contains(&request.worker) {
            target.assignees.push(request.worker.clone());
        }
        model.assignments.push(RecordedAssignment {
            issue,
            worker: request.worker.clone(),
            agent: request.agent.clone(),
            base_branch: request.base_branch.clone(),
        });
        Ok(AssignmentId(format!("{issue}:{}", request.agent)))
    }

    async fn find_open_prs(&self, issue: u64) -> Result<Vec<LinkedPullRequest>> {
        let model = self.enter_for(FakeOp::FindPrs, issue)?;
        let mut prs: Vec<LinkedPullRequest> = model
            .prs
            .values()
            .filter(|p| p.linked_issue == issue && p.pr.state != PrState::Closed)
            .map(|p| p.pr.clone())
            .collect();
        prs.sort_by_key(|pr| (pr.created_at, pr.number));
        Ok(prs)
    }

    async fn get_pull_request(&self, pr: u64) -> Result<LinkedPullRequest> {
        let model = self.enter_for(FakeOp::GetPr, pr)?;
        Ok(model.pr(pr)?.pr.clone())
    }

    async fn update_pr_base(&self, pr: u64, base: &str) -> Result<()> {
        let mut model = self.enter_for(FakeOp::UpdateBase, pr)?;
        let now = model.tick_clock();
        let entry = model.pr_mut(pr)?;
        if entry.pr.base_branch == base {
            return Ok(());
        }
        if entry.pr.state != PrState::Open {
            return Err(GatewayError::Invalid(format!(
                "pull request #{pr} is not open"
            )));
        }
        entry.pr.base_branch = base.to_string();
        entry.pr.updated_at = now;
        Ok(())
    }

    async fn merge_pr(&self, pr: u64, _strategy: MergeStrategy) -> Result<String> {
        let mut model = self.enter_for(FakeOp::Merge, pr)?;
        let now = model.tick_clock();
        let entry = model.pr(pr)?.clone();
        match entry.pr.state {
            PrState::Merged => {
                return Ok(entry
                    .pr
                    .merge_commit_sha
                    .or(entry.pr.head_sha)
                    .unwrap_or_default())
            }
            PrState::Closed => {
                return Err(GatewayError::Invalid(format!(
                    "pull request #{pr} is closed"
                )))
            }
            PrState::Open => {}
        }

        let sha = format!("merge-{pr}");
        for path in &entry.files {
            let key = (entry.pr.branch.clone(), path.clone());
            if let Some(content) = model.files.get(&key).cloned() {
                model
                    .files
                    .insert((entry.pr.base_branch.clone(), path.clone()), content);
            }
        }
        let stored = model.pr_mut(pr)?;
        stored.pr.state = PrState::Merged;
        stored.pr.draft = false;
        stored.pr.merge_commit_sha = Some(sha.clone());
        stored.pr.updated_at = now;
        model.merges_applied.push(pr);
        Ok(sha)
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        let mut model = self.enter(FakeOp::DeleteBranch)?;
        if model.branches.remove(branch) {
            model.deleted_branches.push(branch.to_string());
            model.files.retain(|(git_ref, _), _| git_ref != branch);
        }
        Ok(())
    }

    async fn mark_pr_ready_for_review(&self, pr: u64) -> Result<()> {
        let mut model = self.enter_for(FakeOp::MarkReady, pr)?;
        let entry = model.pr_mut(pr)?;
        if entry.pr.draft {
            entry.pr.draft = false;
            entry.pr.timeline_events.push(TimelineEvent::ReadyForReview);
            model.ready_marked.push(pr);
        }
        Ok(())
    }

    async fn request_review(&self, pr: u64, reviewer: &str) -> Result<()> {
        let mut model = self.enter_for(FakeOp::RequestReview, pr)?;
        model
            .pr_mut(pr)?
            .pr
            .timeline_events
            .push(TimelineEvent::ReviewRequested);
        model.review_requests.push((pr, reviewer.to_string()));
        Ok(())
    }

    async fn update_status(&self, issue: u64, status: PipelineStatus) -> Result<()> {
        let mut model = self.enter_for(FakeOp::UpdateStatus, issue)?;
        let name = status.display_name().to_string();
        model.board.insert(issue, name.clone());
        model.status_updates.push((issue, name));
        Ok(())
    }

    async fn list_board_items(&self) -> Result<Vec<BoardItem>> {
        let model = self.enter(FakeOp::BoardItems)?;
        Ok(model
            .board
            .iter()
            .map(|(issue, status)| BoardItem {
                issue: *issue,
                title: model
                    .issues
                    .get(issue)
                    .map(|i| i.title.clone())
                    .unwrap_or_default(),
                status: Some(status.clone()),
            })
            .collect())
    }

    async fn list_pr_files(&self, pr: u64) -> Result<Vec<PrFile>> {
        let model = self.enter_for(FakeOp::PrFiles, pr)?;
        Ok(model
            .pr(pr)?
            .files
            .iter()
            .map(|f| PrFile {
                filename: f.clone(),
                status: "added".into(),
            })
            .collect())
    }

    async fn get_file_content(&self, path: &str, git_ref: &str) -> Result<Option<String>> {
        let model = self.enter(FakeOp::FileContent)?;
        Ok(model
            .files
            .get(&(git_ref.to_string(), path.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_moves_files_and_is_idempotent() {
        let fake = FakeTracker::new();
        let issue = fake.add_issue("Login", "");
        let pr = fake.add_pull_request(issue, "copilot/plan", "copilot/main");
        fake.add_pr_file(pr, "specs/plan.md", "# Plan");

        let first = fake.merge_pr(pr, MergeStrategy::Squash).await.unwrap();
        let second = fake.merge_pr(pr, MergeStrategy::Squash).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.merges_applied(), vec![pr]);
        assert_eq!(fake.calls(FakeOp::Merge), 2);
        assert_eq!(
            fake.file_at("copilot/main", "specs/plan.md").as_deref(),
            Some("# Plan")
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let fake = FakeTracker::new();
        let issue = fake.add_issue("Login", "body");
        fake.fail_next(FakeOp::Body, GatewayError::Transient("boom".into()));

        assert!(fake.get_issue_body(issue).await.is_err());
        assert_eq!(fake.get_issue_body(issue).await.unwrap(), "body");
        assert_eq!(fake.calls(FakeOp::Body), 2);
    }

    #[tokio::test]
    async fn closed_prs_are_not_linked() {
        let fake = FakeTracker::new();
        let issue = fake.add_issue("Login", "");
        let open = fake.add_pull_request(issue, "a", "main");
        let closed = fake.add_pull_request(issue, "b", "main");
        fake.set_pr_state(closed, PrState::Closed);

        let prs = fake.find_open_prs(issue).await.unwrap();
        assert_eq!(prs.iter().map(|p| p.number).collect::<Vec<_>>(), vec![open]);
    }

    #[tokio::test]
    async fn deleting_missing_branch_succeeds() {
        let fake = FakeTracker::new();
        fake.delete_branch("never-existed").await.unwrap();
        assert!(fake.deleted_branches().is_empty());
    }

    #[tokio::test]
    async fn targeted_failures_leave_other_issues_alone() {
        let fake = FakeTracker::new();
        let broken = fake.add_issue("Broken", "a");
        let healthy = fake.add_issue("Healthy", "b");
        fake.fail_always_for(FakeOp::Body, broken, GatewayError::Transient("boom".into()));

        assert!(fake.get_issue_body(broken).await.is_err());
        assert_eq!(fake.get_issue_body(healthy).await.unwrap(), "b");
        fake.clear_failures();
        assert_eq!(fake.get_issue_body(broken).await.unwrap(), "a");
    }

    #[tokio::test]
    async fn retargeted_pull_request_merges_into_new_base() {
        let fake = FakeTracker::new();
        let issue = fake.add_issue("Login", "");
        let pr = fake.add_pull_request(issue, "copilot/tasks", "main");
        fake.add_pr_file(pr, "specs/tasks.md", "# Tasks");

        fake.update_pr_base(pr, "copilot/plan").await.unwrap();
        fake.merge_pr(pr, MergeStrategy::Squash).await.unwrap();

        assert_eq!(fake.pr_base(pr).as_deref(), Some("copilot/plan"));
        assert!(fake.file_at("main", "specs/tasks.md").is_none());
        assert_eq!(
            fake.file_at("copilot/plan", "specs/tasks.md").as_deref(),
            Some("# Tasks")
        );
        assert!(fake.update_pr_base(pr, "main").await.is_err());
    }
}
