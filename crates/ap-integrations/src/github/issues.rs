use ap_core::names::names_match;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::gateway::{GatewayError, Result};
use crate::types::{
    AssignmentId, AssignmentRequest, CloseReason, IssueComment, IssueState, IssueSummary,
    SubIssue,
};

use super::client::{classify, GitHubClient};

/// Get a single issue by number.
pub async fn get_issue(client: &GitHubClient, number: u64) -> Result<IssueSummary> {
    let issue = client
        .octocrab
        .issues(&client.owner, &client.repo)
        .get(number)
        .await
        .map_err(classify)?;

    Ok(IssueSummary {
        number: issue.number,
        title: issue.title,
        body: issue.body.unwrap_or_default(),
        state: map_state(issue.state),
    })
}

/// All comments on an issue, oldest first.
pub async fn list_comments(client: &GitHubClient, number: u64) -> Result<Vec<IssueComment>> {
    let first = client
        .octocrab
        .issues(&client.owner, &client.repo)
        .list_comments(number)
        .per_page(100)
        .send()
        .await
        .map_err(classify)?;
    let comments = client.octocrab.all_pages(first).await.map_err(classify)?;

    Ok(comments
        .into_iter()
        .map(|c| IssueComment {
            id: c.id.into_inner(),
            author: c.user.login,
            body: c.body.unwrap_or_default(),
            created_at: c.created_at,
        })
        .collect())
}

pub async fn update_body(client: &GitHubClient, number: u64, body: &str) -> Result<()> {
    client
        .octocrab
        .issues(&client.owner, &client.repo)
        .update(number)
        .body(body)
        .send()
        .await
        .map_err(classify)?;
    Ok(())
}

pub async fn create_comment(client: &GitHubClient, number: u64, body: &str) -> Result<()> {
    client
        .octocrab
        .issues(&client.owner, &client.repo)
        .create_comment(number, body)
        .await
        .map_err(classify)?;
    Ok(())
}

/// Create an issue and attach it to `parent` through the sub-issues API.
pub async fn create_sub_issue(
    client: &GitHubClient,
    parent: u64,
    title: &str,
    body: &str,
) -> Result<u64> {
    let issue = client
        .octocrab
        .issues(&client.owner, &client.repo)
        .create(title)
        .body(body)
        .send()
        .await
        .map_err(classify)?;

    let route = client.repo_route(&format!("issues/{parent}/sub_issues"));
    let payload = json!({ "sub_issue_id": issue.id.into_inner() });
    let linked: std::result::Result<serde_json::Value, _> =
        client.octocrab.post(route, Some(&payload)).await;
    if let Err(e) = linked {
        warn!(parent, sub_issue = issue.number, "sub-issue created but not linked");
        return Err(classify(e));
    }
    Ok(issue.number)
}

#[derive(Debug, Deserialize)]
struct RawSubIssue {
    number: u64,
    title: String,
    state: String,
}

pub async fn list_sub_issues(client: &GitHubClient, parent: u64) -> Result<Vec<SubIssue>> {
    let route = client.repo_route(&format!("issues/{parent}/sub_issues"));
    let raw: Vec<RawSubIssue> = client
        .octocrab
        .get(route, Some(&json!({ "per_page": 100 })))
        .await
        .map_err(classify)?;

    Ok(raw
        .into_iter()
        .map(|s| SubIssue {
            number: s.number,
            title: s.title,
            state: if s.state.eq_ignore_ascii_case("closed") {
                IssueState::Closed
            } else {
                IssueState::Open
            },
        })
        .collect())
}

pub async fn close_issue(client: &GitHubClient, number: u64, reason: CloseReason) -> Result<()> {
    let route = client.repo_route(&format!("issues/{number}"));
    let payload = json!({ "state": "closed", "state_reason": reason.as_str() });
    let _: serde_json::Value = client
        .octocrab
        .patch(route, Some(&payload))
        .await
        .map_err(classify)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

#[derive(Debug, Deserialize)]
struct AssigneesResponse {
    #[serde(default)]
    assignees: Vec<Login>,
}

/// Assign the coding agent, pointing it at `base_branch` when one is known.
pub async fn assign_worker(
    client: &GitHubClient,
    number: u64,
    request: &AssignmentRequest,
) -> Result<AssignmentId> {
    let route = client.repo_route(&format!("issues/{number}/assignees"));
    let mut payload = json!({
        "assignees": [request.worker],
        "agent_assignment": {
            "target_repo": format!("{}/{}", client.owner, client.repo),
            "custom_agent": request.agent,
        },
    });
    if let Some(base) = &request.base_branch {
        payload["agent_assignment"]["base_branch"] = json!(base);
    }

    let response: AssigneesResponse = client
        .octocrab
        .post(route, Some(&payload))
        .await
        .map_err(|e| match classify(e) {
            GatewayError::Transient(message) => GatewayError::Assignment(message),
            other => other,
        })?;

    let worker = request.worker.to_lowercase();
    let assigned = response.assignees.iter().any(|a| {
        names_match(&a.login, &request.worker) || a.login.to_lowercase().contains(&worker)
    });
    if !assigned {
        return Err(GatewayError::Assignment(format!(
            "{} was not assigned to #{number}",
            request.worker
        )));
    }

    Ok(AssignmentId(format!("{number}:{}", request.agent)))
}

fn map_state(state: octocrab::models::IssueState) -> IssueState {
    match state {
        octocrab::models::IssueState::Closed => IssueState::Closed,
        _ => IssueState::Open,
    }
}
