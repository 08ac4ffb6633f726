use ap_core::config::Settings;
use ap_core::marker::{artifact_comment, completion_marker, has_artifact, is_completion_marker};
use ap_core::types::MainBranchBinding;
use ap_integrations::types::{CloseReason, LinkedPullRequest, MergeStrategy};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::orchestrator::Orchestrator;

/// What one run of the merge protocol did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// The agent's pull request, if it had one.
    pub pr: Option<u64>,
    /// Set when this run merged the PR into the main branch.
    pub merged_into: Option<String>,
    /// The PR became the issue's main branch.
    pub established_main_branch: bool,
    pub artifacts_posted: usize,
    pub marker_posted: bool,
}

impl Orchestrator {
    /// Fold `agent`'s output into the issue's main branch and publish it.
    ///
    /// 1. Locate the agent's child PR.
    /// 2. Retarget it to the main branch if it points elsewhere, squash-merge
    ///    it and delete its branch. The first PR of an issue becomes the main
    ///    branch instead.
    /// 3. Wait for the merge to propagate.
    /// 4. Post artifact files from the main branch, then the completion
    ///    marker, on the agent's sub-issue.
    /// 5. Close the sub-issue.
    ///
    /// Safe to re-run: an already merged PR is not merged again, artifacts
    /// carry a sentinel and the marker is posted only if absent.
    pub async fn merge_agent_output(&self, issue: u64, agent: &str) -> Result<MergeOutcome> {
        let settings = self.settings();
        let state = self.tracked(issue).await?;
        let target_issue = state.sub_issue_for(agent).unwrap_or(issue);
        let mut outcome = MergeOutcome::default();

        let child = self.find_child_pr(&state, agent).await?;
        let mut binding = state.main_branch.clone();
        if binding.is_none() && child.is_some() {
            binding = self.main_branch(issue).await?;
        }

        let mut artifact_ref = None;
        if let Some(pr) = &child {
            outcome.pr = Some(pr.number);
            match binding.as_mut() {
                None => {
                    info!(
                        issue,
                        agent,
                        pr = pr.number,
                        branch = %pr.branch,
                        "first pull request becomes the main branch"
                    );
                    binding = Some(MainBranchBinding::new(
                        pr.branch.clone(),
                        pr.number,
                        pr.head_sha.clone(),
                    ));
                    outcome.established_main_branch = true;
                    artifact_ref = Some(pr.branch.clone());
                }
                Some(main) if main.source_pr == pr.number => {
                    outcome.established_main_branch = state.main_branch.is_none();
                    artifact_ref = Some(main.branch_name.clone());
                }
                Some(main) => {
                    self.merge_child(issue, agent, pr, main, &settings, &mut outcome)
                        .await?;
                    artifact_ref = Some(main.branch_name.clone());
                }
            }
            if let Some(main) = &binding {
                let main = main.clone();
                self.store()
                    .update(issue, |s| s.main_branch = Some(main))
                    .await;
            }
        }

        if let (Some(pr), Some(git_ref)) = (&child, &artifact_ref) {
            outcome.artifacts_posted = self
                .post_artifacts(target_issue, agent, pr.number, git_ref, &settings)
                .await?;
        }

        let comments = self.gateway().get_issue_comments(target_issue).await?;
        if !comments.iter().any(|c| is_completion_marker(&c.body, agent)) {
            self.gateway()
                .post_comment(target_issue, &completion_marker(agent))
                .await?;
            outcome.marker_posted = true;
        }

        if target_issue != issue {
            self.gateway()
                .close_issue(target_issue, CloseReason::Completed)
                .await?;
        }

        self.store()
            .update(issue, |s| {
                s.outputs_posted.insert(agent.to_string());
            })
            .await;
        info!(
            issue,
            agent,
            pr = ?outcome.pr,
            merged_into = ?outcome.merged_into,
            artifacts = outcome.artifacts_posted,
            "agent output posted"
        );
        Ok(outcome)
    }

    async fn merge_child(
        &self,
        issue: u64,
        agent: &str,
        pr: &LinkedPullRequest,
        main: &mut MainBranchBinding,
        settings: &Settings,
        outcome: &mut MergeOutcome,
    ) -> Result<()> {
        if pr.is_merged() {
            debug!(issue, agent, pr = pr.number, "pull request already merged");
            if let Some(sha) = &pr.merge_commit_sha {
                main.advance(sha.clone());
            }
        } else {
            if pr.base_branch != main.branch_name {
                info!(
                    issue,
                    agent,
                    pr = pr.number,
                    from = %pr.base_branch,
                    to = %main.branch_name,
                    "retargeting pull request to the main branch"
                );
                // Never merge into any other base: a failed retarget aborts
                // the merge and surfaces as this issue's error.
                if let Err(err) = self
                    .gateway()
                    .update_pr_base(pr.number, &main.branch_name)
                    .await
                {
                    warn!(
                        issue,
                        agent,
                        pr = pr.number,
                        base = %pr.base_branch,
                        error = %err,
                        "cannot retarget pull request, refusing to merge"
                    );
                    return Err(err.into());
                }
            }
            let revision = self
                .gateway()
                .merge_pr(pr.number, MergeStrategy::Squash)
                .await?;
            main.advance(revision);
            outcome.merged_into = Some(main.branch_name.clone());
            info!(
                issue,
                agent,
                pr = pr.number,
                into = %main.branch_name,
                "child pull request merged"
            );
        }

        if pr.branch != main.branch_name {
            self.gateway().delete_branch(&pr.branch).await?;
        }

        let delay = settings.config.polling.merge_propagation_delay();
        if outcome.merged_into.is_some() && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Post each artifact file changed by `pr` as a comment on `target_issue`,
    /// reading the content at `git_ref`. Returns how many were posted.
    async fn post_artifacts(
        &self,
        target_issue: u64,
        agent: &str,
        pr: u64,
        git_ref: &str,
        settings: &Settings,
    ) -> Result<usize> {
        let files = self.gateway().list_pr_files(pr).await?;
        let existing: Vec<String> = self
            .gateway()
            .get_issue_comments(target_issue)
            .await?
            .into_iter()
            .map(|c| c.body)
            .collect();

        let mut posted = 0;
        for file in files {
            if file.status == "removed" || !settings.config.pipeline.is_artifact(&file.filename) {
                continue;
            }
            if has_artifact(existing.iter().map(String::as_str), agent, &file.filename) {
                continue;
            }
            let Some(content) = self
                .gateway()
                .get_file_content(&file.filename, git_ref)
                .await?
            else {
                debug!(path = %file.filename, git_ref, "artifact not found on branch");
                continue;
            };
            self.gateway()
                .post_comment(target_issue, &artifact_comment(agent, &file.filename, &content))
                .await?;
            posted += 1;
        }
        Ok(posted)
    }
}
