use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::gateway::{GatewayError, Result};
use crate::types::{LinkedPullRequest, MergeStrategy, PrFile, PrState, TimelineEvent};

use super::client::{classify, GitHubClient};
use super::projects::graphql;

const TIMELINE_PAGE_SIZE: usize = 100;
const MAX_TIMELINE_PAGES: u32 = 10;

const MARK_READY_MUTATION: &str = r#"
mutation($id: ID!) {
  markPullRequestReadyForReview(input: { pullRequestId: $id }) {
    pullRequest { number isDraft }
  }
}"#;

async fn timeline(client: &GitHubClient, number: u64) -> Result<Vec<Value>> {
    let route = client.repo_route(&format!("issues/{number}/timeline"));
    let mut events = Vec::new();
    for page in 1..=MAX_TIMELINE_PAGES {
        let batch: Vec<Value> = client
            .octocrab
            .get(
                route.as_str(),
                Some(&json!({ "per_page": TIMELINE_PAGE_SIZE, "page": page })),
            )
            .await
            .map_err(classify)?;
        let len = batch.len();
        events.extend(batch);
        if len < TIMELINE_PAGE_SIZE {
            break;
        }
    }
    Ok(events)
}

/// Pull requests cross-referenced from the issue timeline, open or merged,
/// oldest first.
pub async fn find_linked_pull_requests(
    client: &GitHubClient,
    issue: u64,
) -> Result<Vec<LinkedPullRequest>> {
    let full_name = format!("{}/{}", client.owner, client.repo);
    let numbers: BTreeSet<u64> = timeline(client, issue)
        .await?
        .iter()
        .filter(|e| e.get("event").and_then(Value::as_str) == Some("cross-referenced"))
        .filter_map(|e| {
            let source = e.pointer("/source/issue")?;
            source.get("pull_request")?;
            let same_repo = source
                .pointer("/repository/full_name")
                .and_then(Value::as_str)
                .map_or(true, |name| name.eq_ignore_ascii_case(&full_name));
            if same_repo {
                source.get("number").and_then(Value::as_u64)
            } else {
                None
            }
        })
        .collect();

    let mut prs = Vec::with_capacity(numbers.len());
    for number in numbers {
        let pr = get_pull_request(client, number).await?;
        if pr.state != PrState::Closed {
            prs.push(pr);
        }
    }
    prs.sort_by_key(|pr| (pr.created_at, pr.number));
    Ok(prs)
}

pub async fn get_pull_request(client: &GitHubClient, number: u64) -> Result<LinkedPullRequest> {
    let pr = client
        .octocrab
        .pulls(&client.owner, &client.repo)
        .get(number)
        .await
        .map_err(classify)?;

    let events = timeline(client, number)
        .await?
        .iter()
        .filter_map(|e| e.get("event").and_then(Value::as_str))
        .map(TimelineEvent::from_event_name)
        .collect();

    Ok(convert(pr, events))
}

/// Point a pull request at a new base branch.
pub async fn update_base(client: &GitHubClient, number: u64, base: &str) -> Result<()> {
    let route = client.repo_route(&format!("pulls/{number}"));
    let payload = json!({ "base": base });
    let _: Value = client
        .octocrab
        .patch(route, Some(&payload))
        .await
        .map_err(classify)?;
    debug!(pr = number, base, "pull request retargeted");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct MergeResponse {
    sha: String,
}

/// Merge a pull request. An already merged PR is reported as success.
pub async fn merge_pull_request(
    client: &GitHubClient,
    number: u64,
    strategy: MergeStrategy,
) -> Result<String> {
    let route = client.repo_route(&format!("pulls/{number}/merge"));
    let body = json!({ "merge_method": strategy.as_str() });

    match client
        .octocrab
        .put::<MergeResponse, _, _>(route, Some(&body))
        .await
    {
        Ok(merged) => Ok(merged.sha),
        Err(e) => {
            let err = classify(e);
            let pr = get_pull_request(client, number).await?;
            if pr.is_merged() {
                debug!(pr = number, "merge already applied");
                Ok(pr.merge_commit_sha.or(pr.head_sha).unwrap_or_default())
            } else {
                Err(err)
            }
        }
    }
}

/// Delete a branch ref. Missing refs are treated as already deleted.
pub async fn delete_branch(client: &GitHubClient, branch: &str) -> Result<()> {
    let route = client.repo_route(&format!("git/refs/heads/{branch}"));
    match client.octocrab._delete(route, None::<&()>).await {
        Ok(response) => {
            let status = response.status().as_u16();
            if status < 300 || status == 404 || status == 422 {
                Ok(())
            } else {
                Err(GatewayError::from_status(
                    status,
                    format!("deleting branch {branch}"),
                ))
            }
        }
        Err(e) => match classify(e) {
            GatewayError::NotFound(_) => Ok(()),
            GatewayError::Invalid(message) if message.contains("Reference does not exist") => {
                Ok(())
            }
            other => Err(other),
        },
    }
}

pub async fn mark_ready_for_review(client: &GitHubClient, number: u64) -> Result<()> {
    let pr = client
        .octocrab
        .pulls(&client.owner, &client.repo)
        .get(number)
        .await
        .map_err(classify)?;
    if pr.draft != Some(true) {
        return Ok(());
    }
    let node_id = pr
        .node_id
        .ok_or_else(|| GatewayError::Invalid(format!("pull request #{number} has no node id")))?;

    graphql(client, MARK_READY_MUTATION, json!({ "id": node_id })).await?;
    Ok(())
}

pub async fn request_review(client: &GitHubClient, number: u64, reviewer: &str) -> Result<()> {
    let route = client.repo_route(&format!("pulls/{number}/requested_reviewers"));
    let payload = json!({ "reviewers": [reviewer] });
    let _: Value = client
        .octocrab
        .post(route, Some(&payload))
        .await
        .map_err(classify)?;
    Ok(())
}

/// List files changed in a pull request.
pub async fn list_pr_files(client: &GitHubClient, number: u64) -> Result<Vec<PrFile>> {
    let files = client
        .octocrab
        .pulls(&client.owner, &client.repo)
        .list_files(number)
        .await
        .map_err(classify)?;

    Ok(files
        .into_iter()
        .map(|f| PrFile {
            filename: f.filename,
            status: format!("{:?}", f.status).to_lowercase(),
        })
        .collect())
}

pub async fn get_file_content(
    client: &GitHubClient,
    path: &str,
    git_ref: &str,
) -> Result<Option<String>> {
    let fetched = client
        .octocrab
        .repos(&client.owner, &client.repo)
        .get_content()
        .path(path)
        .r#ref(git_ref)
        .send()
        .await;

    match fetched {
        Ok(mut items) => Ok(items
            .take_items()
            .into_iter()
            .next()
            .and_then(|content| content.decoded_content())),
        Err(e) => match classify(e) {
            GatewayError::NotFound(_) => Ok(None),
            other => Err(other),
        },
    }
}

// ---- internal helpers -------------------------------------------------------

fn convert(
    pr: octocrab::models::pulls::PullRequest,
    timeline_events: Vec<TimelineEvent>,
) -> LinkedPullRequest {
    let state = if pr.merged_at.is_some() {
        PrState::Merged
    } else {
        match pr.state {
            Some(octocrab::models::IssueState::Closed) => PrState::Closed,
            _ => PrState::Open,
        }
    };

    let created_at = pr.created_at.unwrap_or_else(chrono::Utc::now);
    let updated_at = pr.updated_at.unwrap_or(created_at);

    LinkedPullRequest {
        number: pr.number,
        branch: pr.head.ref_field.clone(),
        base_branch: pr.base.ref_field.clone(),
        state,
        draft: pr.draft.unwrap_or(false),
        head_sha: Some(pr.head.sha.clone()),
        merge_commit_sha: pr.merge_commit_sha,
        created_at,
        updated_at,
        timeline_events,
    }
}
