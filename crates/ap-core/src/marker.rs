//! Completion-marker protocol and the text conventions around it.
//!
//! An agent finishes by posting `"<agent>: Done!"` as a comment on its
//! sub-issue. Sub-issues are titled `"[<agent>] <parent title>"`, and artifact
//! comments carry a hidden sentinel so they can be recognised on re-runs.

use crate::names::names_match;

/// The comment an agent posts when its stage is finished.
pub fn completion_marker(agent: &str) -> String {
    format!("{agent}: Done!")
}

/// Whether `body` contains the completion marker for `agent` on a line of
/// its own. Case-insensitive; the trailing `!` is optional.
pub fn is_completion_marker(body: &str, agent: &str) -> bool {
    body.lines().any(|line| {
        let line = line.trim();
        let line = line.strip_suffix('!').unwrap_or(line);
        match line.rsplit_once(':') {
            Some((name, done)) => {
                done.trim().eq_ignore_ascii_case("done") && names_match(name, agent)
            }
            None => false,
        }
    })
}

/// Title for the sub-issue dedicated to `agent`.
pub fn sub_issue_title(agent: &str, parent_title: &str) -> String {
    format!("[{agent}] {parent_title}")
}

/// Extract the agent name from a sub-issue title such as `"[plan] Add login"`.
pub fn parse_sub_issue_title(title: &str) -> Option<&str> {
    let rest = title.trim_start().strip_prefix('[')?;
    let (agent, _) = rest.split_once(']')?;
    let agent = agent.trim();
    if agent.is_empty() {
        None
    } else {
        Some(agent)
    }
}

/// Body for a sub-issue created by the workflow trigger.
pub fn sub_issue_body(agent: &str, parent_issue: u64) -> String {
    format!(
        "Sub-issue for agent `{agent}` of #{parent_issue}.\n\n\
         Post `{marker}` here when the work is finished.",
        marker = completion_marker(agent)
    )
}

// ---------------------------------------------------------------------------
// Artifact comments
// ---------------------------------------------------------------------------

/// Hidden sentinel identifying an artifact comment.
pub fn artifact_sentinel(agent: &str, path: &str) -> String {
    format!("<!-- pipeline-artifact agent=\"{agent}\" path=\"{path}\" -->")
}

/// Comment body carrying one generated file.
pub fn artifact_comment(agent: &str, path: &str, content: &str) -> String {
    format!(
        "{sentinel}\n### `{path}`\n\n{content}",
        sentinel = artifact_sentinel(agent, path)
    )
}

/// Whether any of `bodies` already carries the artifact for `agent`/`path`.
pub fn has_artifact<'a>(bodies: impl IntoIterator<Item = &'a str>, agent: &str, path: &str) -> bool {
    let sentinel = artifact_sentinel(agent, path);
    bodies.into_iter().any(|body| body.contains(&sentinel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_matches_own_agent_only() {
        let body = completion_marker("specify");
        assert_eq!(body, "specify: Done!");
        assert!(is_completion_marker(&body, "specify"));
        assert!(is_completion_marker(&body, "Specify"));
        assert!(!is_completion_marker(&body, "plan"));
    }

    #[test]
    fn marker_tolerates_surrounding_text() {
        let body = "Finished the plan.\n\n  plan: done  \nThanks";
        assert!(is_completion_marker(body, "plan"));
        assert!(!is_completion_marker("plan is not done yet", "plan"));
        assert!(!is_completion_marker("plan: Done? maybe", "plan"));
    }

    #[test]
    fn sub_issue_titles_round_trip() {
        let title = sub_issue_title("tasks", "Add login page");
        assert_eq!(title, "[tasks] Add login page");
        assert_eq!(parse_sub_issue_title(&title), Some("tasks"));
        assert_eq!(parse_sub_issue_title("Add login page"), None);
        assert_eq!(parse_sub_issue_title("[] nothing"), None);
    }

    #[test]
    fn artifact_detection_uses_sentinel() {
        let comment = artifact_comment("plan", "specs/plan.md", "# Plan");
        assert!(has_artifact([comment.as_str()], "plan", "specs/plan.md"));
        assert!(!has_artifact([comment.as_str()], "plan", "specs/other.md"));
        assert!(!has_artifact(["# Plan"], "plan", "specs/plan.md"));
    }
}
