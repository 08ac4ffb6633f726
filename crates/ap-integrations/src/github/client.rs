use ap_core::config::{CredentialProvider, IntegrationConfig};
use ap_core::types::PipelineStatus;
use async_trait::async_trait;
use octocrab::Octocrab;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::gateway::{self, GatewayError, IssueTracker};
use crate::types::{
    AssignmentId, AssignmentRequest, BoardItem, CloseReason, GitHubConfig, IssueComment,
    IssueSummary, LinkedPullRequest, MergeStrategy, PrFile, SubIssue,
};

use super::projects::ProjectCache;
use super::{issues, projects, pull_requests};

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub API error: {0}")]
    Api(#[from] octocrab::Error),

    #[error("missing GitHub token: set {0} or pass it in GitHubConfig")]
    MissingToken(String),

    #[error("missing repository setting: {0}")]
    MissingSetting(&'static str),
}

pub type Result<T> = std::result::Result<T, GitHubError>;

/// Map an octocrab failure onto the gateway taxonomy.
pub(crate) fn classify(err: octocrab::Error) -> GatewayError {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            GatewayError::from_status(source.status_code.as_u16(), source.message.clone())
        }
        _ => GatewayError::Transient(err.to_string()),
    }
}

#[derive(Debug)]
pub struct GitHubClient {
    pub(crate) octocrab: Octocrab,
    pub(crate) owner: String,
    pub(crate) repo: String,
    pub(crate) project_owner: String,
    pub(crate) project_number: Option<u64>,
    pub(crate) project: RwLock<Option<ProjectCache>>,
}

impl GitHubClient {
    /// Create a client from an explicit [`GitHubConfig`].
    pub fn new(config: GitHubConfig) -> Result<Self> {
        let token = config
            .token
            .ok_or_else(|| GitHubError::MissingToken("GITHUB_TOKEN".into()))?;

        let octocrab = Octocrab::builder().personal_token(token).build()?;

        Ok(Self {
            octocrab,
            project_owner: config.project_owner.unwrap_or_else(|| config.owner.clone()),
            owner: config.owner,
            repo: config.repo,
            project_number: config.project_number,
            project: RwLock::new(None),
        })
    }

    /// Create a client from the `[integrations]` config section, reading the
    /// token from the environment variable it names.
    pub fn from_integrations(integrations: &IntegrationConfig) -> Result<Self> {
        let token = CredentialProvider::github_token(integrations)
            .ok_or_else(|| GitHubError::MissingToken(integrations.github_token_env.clone()))?;
        let owner = integrations
            .github_owner
            .clone()
            .ok_or(GitHubError::MissingSetting("integrations.github_owner"))?;
        let repo = integrations
            .github_repo
            .clone()
            .ok_or(GitHubError::MissingSetting("integrations.github_repo"))?;

        Self::new(GitHubConfig {
            token: Some(token),
            owner,
            repo,
            project_owner: integrations.project_owner.clone(),
            project_number: integrations.project_number,
        })
    }

    pub fn inner(&self) -> &Octocrab {
        &self.octocrab
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub(crate) fn repo_route(&self, rest: &str) -> String {
        format!("/repos/{}/{}/{}", self.owner, self.repo, rest)
    }
}

#[async_trait]
impl IssueTracker for GitHubClient {
    async fn get_issue(&self, issue: u64) -> gateway::Result<IssueSummary> {
        issues::get_issue(self, issue).await
    }

    async fn get_issue_comments(&self, issue: u64) -> gateway::Result<Vec<IssueComment>> {
        issues::list_comments(self, issue).await
    }

    async fn get_issue_body(&self, issue: u64) -> gateway::Result<String> {
        Ok(issues::get_issue(self, issue).await?.body)
    }

    async fn update_issue_body(&self, issue: u64, body: &str) -> gateway::Result<()> {
        issues::update_body(self, issue, body).await
    }

    async fn post_comment(&self, issue: u64, body: &str) -> gateway::Result<()> {
        issues::create_comment(self, issue, body).await
    }

    async fn create_sub_issue(&self, parent: u64, title: &str, body: &str) -> gateway::Result<u64> {
        issues::create_sub_issue(self, parent, title, body).await
    }

    async fn list_sub_issues(&self, parent: u64) -> gateway::Result<Vec<SubIssue>> {
        issues::list_sub_issues(self, parent).await
    }

    async fn close_issue(&self, issue: u64, reason: CloseReason) -> gateway::Result<()> {
        issues::close_issue(self, issue, reason).await
    }

    async fn assign_worker(
        &self,
        issue: u64,
        request: &AssignmentRequest,
    ) -> gateway::Result<AssignmentId> {
        issues::assign_worker(self, issue, request).await
    }

    async fn find_open_prs(&self, issue: u64) -> gateway::Result<Vec<LinkedPullRequest>> {
        pull_requests::find_linked_pull_requests(self, issue).await
    }

    async fn get_pull_request(&self, pr: u64) -> gateway::Result<LinkedPullRequest> {
        pull_requests::get_pull_request(self, pr).await
    }

    async fn update_pr_base(&self, pr: u64, base: &str) -> gateway::Result<()> {
        pull_requests::update_base(self, pr, base).await
    }

    async fn merge_pr(&self, pr: u64, strategy: MergeStrategy) -> gateway::Result<String> {
        pull_requests::merge_pull_request(self, pr, strategy).await
    }

    async fn delete_branch(&self, branch: &str) -> gateway::Result<()> {
        pull_requests::delete_branch(self, branch).await
    }

    async fn mark_pr_ready_for_review(&self, pr: u64) -> gateway::Result<()> {
        pull_requests::mark_ready_for_review(self, pr).await
    }

    async fn request_review(&self, pr: u64, reviewer: &str) -> gateway::Result<()> {
        pull_requests::request_review(self, pr, reviewer).await
    }

    async fn update_status(&self, issue: u64, status: PipelineStatus) -> gateway::Result<()> {
        projects::update_status(self, issue, status).await
    }

    async fn list_board_items(&self) -> gateway::Result<Vec<BoardItem>> {
        projects::list_board_items(self).await
    }

    async fn list_pr_files(&self, pr: u64) -> gateway::Result<Vec<PrFile>> {
        pull_requests::list_pr_files(self, pr).await
    }

    async fn get_file_content(&self, path: &str, git_ref: &str) -> gateway::Result<Option<String>> {
        pull_requests::get_file_content(self, path, git_ref).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token: Option<&str>) -> GitHubConfig {
        GitHubConfig {
            token: token.map(str::to_string),
            owner: "acme".into(),
            repo: "widgets".into(),
            project_owner: None,
            project_number: Some(3),
        }
    }

    #[tokio::test]
    async fn client_creation_with_config() {
        let client = GitHubClient::new(config(Some("ghp_test_token"))).unwrap();
        assert_eq!(client.owner(), "acme");
        assert_eq!(client.repo(), "widgets");
        assert_eq!(client.project_owner, "acme");
        assert_eq!(client.repo_route("issues/4"), "/repos/acme/widgets/issues/4");
    }

    #[test]
    fn client_creation_missing_token() {
        assert!(matches!(
            GitHubClient::new(config(None)),
            Err(GitHubError::MissingToken(_))
        ));
    }

    #[test]
    fn integrations_without_repo_are_rejected() {
        let integrations = IntegrationConfig {
            github_token_env: "AP_TEST_TOKEN_THAT_IS_NEVER_SET".into(),
            ..IntegrationConfig::default()
        };
        assert!(matches!(
            GitHubClient::from_integrations(&integrations),
            Err(GitHubError::MissingToken(_))
        ));
    }
}
