//! Projects v2 board access over GraphQL.
//!
//! The board is the source of each issue's status column. Project, field and
//! option ids are looked up once and cached on the client; item ids are
//! refreshed whenever the board is listed.

use std::collections::HashMap;

use ap_core::names::names_match;
use ap_core::types::PipelineStatus;
use serde_json::{json, Value};
use tracing::debug;

use crate::gateway::{GatewayError, Result};
use crate::types::BoardItem;

use super::client::{classify, GitHubClient};

const MAX_ITEM_PAGES: usize = 50;

const PROJECT_QUERY: &str = r#"
query($owner: String!, $number: Int!) {
  repositoryOwner(login: $owner) {
    ... on ProjectV2Owner {
      projectV2(number: $number) {
        id
        field(name: "Status") {
          ... on ProjectV2SingleSelectField { id options { id name } }
        }
      }
    }
  }
}"#;

const ITEMS_QUERY: &str = r#"
query($project: ID!, $cursor: String) {
  node(id: $project) {
    ... on ProjectV2 {
      items(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id
          fieldValueByName(name: "Status") {
            ... on ProjectV2ItemFieldSingleSelectValue { name }
          }
          content {
            ... on Issue { number title repository { nameWithOwner } }
          }
        }
      }
    }
  }
}"#;

const UPDATE_STATUS_MUTATION: &str = r#"
mutation($project: ID!, $item: ID!, $field: ID!, $option: String!) {
  updateProjectV2ItemFieldValue(input: {
    projectId: $project, itemId: $item, fieldId: $field,
    value: { singleSelectOptionId: $option }
  }) {
    projectV2Item { id }
  }
}"#;

#[derive(Debug, Clone, Default)]
pub struct ProjectCache {
    pub project_id: String,
    pub status_field_id: String,
    /// Column name to option id.
    pub options: Vec<(String, String)>,
    /// Issue number to project item id.
    pub items: HashMap<u64, String>,
}

impl ProjectCache {
    fn option_for(&self, status: PipelineStatus) -> Option<&str> {
        self.options
            .iter()
            .find(|(name, _)| names_match(name, status.display_name()))
            .map(|(_, id)| id.as_str())
    }
}

/// Run a GraphQL document, turning an `errors` array into a gateway error.
pub(crate) async fn graphql(client: &GitHubClient, query: &str, variables: Value) -> Result<Value> {
    let response: Value = client
        .octocrab
        .graphql(&json!({ "query": query, "variables": variables }))
        .await
        .map_err(classify)?;
    check_graphql_errors(&response)?;
    Ok(response)
}

fn check_graphql_errors(response: &Value) -> Result<()> {
    let Some(errors) = response.get("errors").and_then(Value::as_array) else {
        return Ok(());
    };
    if errors.is_empty() {
        return Ok(());
    }
    let message = errors
        .iter()
        .filter_map(|e| e.get("message").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("; ");
    let lower = message.to_lowercase();
    Err(if lower.contains("rate limit") {
        GatewayError::Transient(message)
    } else if lower.contains("could not resolve") {
        GatewayError::NotFound(message)
    } else if lower.contains("permission") || lower.contains("not accessible") {
        GatewayError::Permission(message)
    } else {
        GatewayError::Invalid(message)
    })
}

async fn project(client: &GitHubClient) -> Result<ProjectCache> {
    if let Some(cached) = client.project.read().await.as_ref() {
        return Ok(cached.clone());
    }

    let number = client.project_number.ok_or_else(|| {
        GatewayError::Invalid("integrations.project_number is not configured".into())
    })?;
    let response = graphql(
        client,
        PROJECT_QUERY,
        json!({ "owner": client.project_owner, "number": number }),
    )
    .await?;

    let project = response
        .pointer("/data/repositoryOwner/projectV2")
        .filter(|p| !p.is_null())
        .ok_or_else(|| {
            GatewayError::NotFound(format!(
                "project {number} of {} not found",
                client.project_owner
            ))
        })?;
    let project_id = string_at(project, "/id")?;
    let status_field_id = string_at(project, "/field/id")?;
    let options = project
        .pointer("/field/options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|o| {
                    Some((
                        o.get("name")?.as_str()?.to_string(),
                        o.get("id")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    let cache = ProjectCache {
        project_id,
        status_field_id,
        options,
        items: HashMap::new(),
    };
    *client.project.write().await = Some(cache.clone());
    Ok(cache)
}

fn string_at(value: &Value, pointer: &str) -> Result<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Invalid(format!("project response has no {pointer}")))
}

/// Every issue of this repository on the board, with its status column.
pub async fn list_board_items(client: &GitHubClient) -> Result<Vec<BoardItem>> {
    let meta = project(client).await?;
    let full_name = format!("{}/{}", client.owner, client.repo);

    let mut board = Vec::new();
    let mut item_ids = HashMap::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_ITEM_PAGES {
        let response = graphql(
            client,
            ITEMS_QUERY,
            json!({ "project": meta.project_id, "cursor": cursor }),
        )
        .await?;
        let Some(items) = response.pointer("/data/node/items") else {
            break;
        };

        for node in items
            .get("nodes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(content) = node.get("content").filter(|c| !c.is_null()) else {
                continue;
            };
            let repo = content
                .pointer("/repository/nameWithOwner")
                .and_then(Value::as_str);
            if !repo.is_some_and(|r| r.eq_ignore_ascii_case(&full_name)) {
                continue;
            }
            let Some(number) = content.get("number").and_then(Value::as_u64) else {
                continue;
            };
            if let Some(item_id) = node.get("id").and_then(Value::as_str) {
                item_ids.insert(number, item_id.to_string());
            }
            board.push(BoardItem {
                issue: number,
                title: content
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status: node
                    .pointer("/fieldValueByName/name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        let has_next = items
            .pointer("/pageInfo/hasNextPage")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        cursor = items
            .pointer("/pageInfo/endCursor")
            .and_then(Value::as_str)
            .map(str::to_string);
        if !has_next || cursor.is_none() {
            break;
        }
    }

    if let Some(cache) = client.project.write().await.as_mut() {
        cache.items = item_ids;
    }
    debug!(items = board.len(), "listed project board");
    Ok(board)
}

/// Set the board status column of `issue`.
pub async fn update_status(
    client: &GitHubClient,
    issue: u64,
    status: PipelineStatus,
) -> Result<()> {
    let mut meta = project(client).await?;
    if !meta.items.contains_key(&issue) {
        list_board_items(client).await?;
        meta = project(client).await?;
    }

    let item = meta
        .items
        .get(&issue)
        .ok_or_else(|| GatewayError::NotFound(format!("issue #{issue} is not on the board")))?;
    let option = meta
        .option_for(status)
        .ok_or_else(|| GatewayError::Invalid(format!("board has no column named {status}")))?;

    graphql(
        client,
        UPDATE_STATUS_MUTATION,
        json!({
            "project": meta.project_id,
            "item": item,
            "field": meta.status_field_id,
            "option": option,
        }),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphql_errors_are_classified() {
        let ok = json!({ "data": {} });
        assert!(check_graphql_errors(&ok).is_ok());

        let limited = json!({ "errors": [{ "message": "API rate limit exceeded" }] });
        assert!(check_graphql_errors(&limited).unwrap_err().is_transient());

        let missing = json!({ "errors": [{ "message": "Could not resolve to a node" }] });
        assert!(check_graphql_errors(&missing).unwrap_err().is_not_found());
    }

    #[test]
    fn option_lookup_ignores_case() {
        let cache = ProjectCache {
            options: vec![
                ("Todo".into(), "a".into()),
                ("in progress".into(), "b".into()),
            ],
            ..ProjectCache::default()
        };
        assert_eq!(cache.option_for(PipelineStatus::InProgress), Some("b"));
        assert_eq!(cache.option_for(PipelineStatus::Done), None);
    }
}
