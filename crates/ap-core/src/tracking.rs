//! The pipeline tracking table embedded in a parent issue body.
//!
//! The table is the durable record of pipeline progress: it is rewritten on
//! every agent hand-off and parsed back on restart. Rendering is
//! deterministic (no timestamps) so unchanged state never produces a body
//! edit.
//!
//! ```text
//! ## Agent Pipeline
//!
//! | # | Status | Agent | State |
//! |---|--------|-------|-------|
//! | 1 | Backlog | `specify` | ✅ Done |
//! | 2 | Ready | `plan` | 🔄 Active |
//! | 3 | Ready | `tasks` | ⏳ Pending |
//! ```

use std::fmt::Write as _;

use crate::names::names_match;
use crate::types::{AgentMapping, AgentProgress, PipelineState, PipelineStatus};

pub const HEADING: &str = "## Agent Pipeline";

const HEADER_ROW: &str = "| # | Status | Agent | State |";
const SEPARATOR_ROW: &str = "|---|--------|-------|-------|";

// ---------------------------------------------------------------------------
// Parsed form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRow {
    /// `None` when the status cell was edited into something unrecognised.
    pub status: Option<PipelineStatus>,
    pub agent: String,
    pub progress: AgentProgress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingTable {
    pub rows: Vec<TrackingRow>,
}

/// Progress of a single stage recovered from the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageProgress {
    pub agents: Vec<String>,
    pub completed: Vec<String>,
    pub current_index: usize,
}

impl StageProgress {
    pub fn is_complete(&self) -> bool {
        self.current_index >= self.agents.len()
    }

    /// Build a [`PipelineState`] positioned at this progress.
    pub fn into_state(self, issue_number: u64, status: PipelineStatus) -> PipelineState {
        let mut state = PipelineState::new(issue_number, status, self.agents);
        state.current_index = self.current_index;
        state.completed_agents = self.completed;
        state
    }
}

impl TrackingTable {
    /// Agents listed for `status`, in table order.
    pub fn agents_for(&self, status: PipelineStatus) -> Vec<&str> {
        self.rows
            .iter()
            .filter(|r| r.status == Some(status))
            .map(|r| r.agent.as_str())
            .collect()
    }

    /// Recover the progress of `status`.
    ///
    /// The table's own agent list wins; `configured` is used when the table
    /// has no rows for the stage. Only the leading run of `Done` rows counts
    /// as completed, so a stray `Done` after a `Pending` row is ignored.
    pub fn progress_for(&self, status: PipelineStatus, configured: &[String]) -> StageProgress {
        let rows: Vec<&TrackingRow> = self
            .rows
            .iter()
            .filter(|r| r.status == Some(status))
            .collect();

        let agents: Vec<String> = if rows.is_empty() {
            configured.to_vec()
        } else {
            rows.iter().map(|r| r.agent.clone()).collect()
        };

        let completed: Vec<String> = agents
            .iter()
            .take_while(|agent| {
                rows.iter()
                    .find(|r| names_match(&r.agent, agent))
                    .is_some_and(|r| r.progress == AgentProgress::Done)
            })
            .cloned()
            .collect();

        StageProgress {
            current_index: completed.len(),
            agents,
            completed,
        }
    }

    /// The first row marked active.
    pub fn active_agent(&self) -> Option<(Option<PipelineStatus>, &str)> {
        self.rows
            .iter()
            .find(|r| r.progress == AgentProgress::Active)
            .map(|r| (r.status, r.agent.as_str()))
    }

    pub fn progress_of(&self, agent: &str) -> Option<AgentProgress> {
        self.rows
            .iter()
            .find(|r| names_match(&r.agent, agent))
            .map(|r| r.progress)
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn progress_label(progress: AgentProgress) -> &'static str {
    match progress {
        AgentProgress::Done => "✅ Done",
        AgentProgress::Active => "🔄 Active",
        AgentProgress::Pending => "⏳ Pending",
    }
}

/// Render the tracking block for `state`.
///
/// Earlier stages render as done, later stages as pending, and the current
/// stage from the state's own sequence.
pub fn render(state: &PipelineState, mapping: &AgentMapping) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{HEADING}");
    out.push('\n');
    let _ = writeln!(out, "{HEADER_ROW}");
    let _ = writeln!(out, "{SEPARATOR_ROW}");

    let mut number = 0usize;
    let mut row = |out: &mut String, status: PipelineStatus, agent: &str, progress| {
        number += 1;
        let _ = writeln!(
            out,
            "| {number} | {status} | `{agent}` | {label} |",
            label = progress_label(progress)
        );
    };

    for status in PipelineStatus::ALL {
        if status == state.status && !status.is_terminal() {
            for (index, agent) in state.agent_sequence.iter().enumerate() {
                row(&mut out, status, agent, state.progress_at(index));
            }
            continue;
        }
        let progress = if status < state.status || state.status.is_terminal() {
            AgentProgress::Done
        } else {
            AgentProgress::Pending
        };
        for agent in mapping.agents_for(status) {
            row(&mut out, status, agent, progress);
        }
    }

    out.push('\n');
    let _ = writeln!(out, "- **Status:** {}", state.status);
    match state.current_agent() {
        Some(agent) if !state.status.is_terminal() => {
            let _ = writeln!(out, "- **Active agent:** `{agent}`");
        }
        _ => {
            let _ = writeln!(out, "- **Active agent:** none");
        }
    }
    if let Some(binding) = &state.main_branch {
        let _ = writeln!(
            out,
            "- **Main branch:** `{}` (#{})",
            binding.branch_name, binding.source_pr
        );
    }
    out
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Byte range of the tracking block.
///
/// The block runs from the heading over blank lines, table rows and
/// `- **Key:**` summary bullets. It ends at the first other line, which
/// includes a heading of any level.
fn find_block(body: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    let mut start = None;
    for line in body.split_inclusive('\n') {
        let trimmed = line.trim();
        match start {
            None if trimmed.eq_ignore_ascii_case(HEADING) => start = Some(offset),
            Some(s) if !is_block_line(trimmed) => return Some((s, offset)),
            _ => {}
        }
        offset += line.len();
    }
    start.map(|s| (s, body.len()))
}

fn is_block_line(trimmed: &str) -> bool {
    trimmed.is_empty() || trimmed.starts_with('|') || trimmed.starts_with("- **")
}

/// Read a state cell. The label must be exactly one of the known words,
/// optionally decorated with its emoji.
fn parse_progress(cell: &str) -> AgentProgress {
    let word = cell
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    match word.as_str() {
        "done" => AgentProgress::Done,
        "active" => AgentProgress::Active,
        "" => match cell.trim() {
            "✅" => AgentProgress::Done,
            "🔄" => AgentProgress::Active,
            _ => AgentProgress::Pending,
        },
        _ => AgentProgress::Pending,
    }
}

fn parse_row(line: &str) -> Option<TrackingRow> {
    let inner = line.trim().strip_prefix('|')?;
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    let cells: Vec<&str> = inner.split('|').map(str::trim).collect();

    if cells.first().is_some_and(|c| *c == "#") {
        return None;
    }
    if cells
        .iter()
        .all(|c| c.chars().all(|ch| matches!(ch, '-' | ':' | ' ')))
    {
        return None;
    }
    if cells.len() < 3 {
        return None;
    }

    let agent = cells[2].trim_matches('`').trim();
    if agent.is_empty() {
        return None;
    }
    Some(TrackingRow {
        status: PipelineStatus::parse(cells[1]),
        agent: agent.to_string(),
        progress: cells
            .get(3)
            .map(|c| parse_progress(c))
            .unwrap_or(AgentProgress::Pending),
    })
}

/// Parse the tracking block out of an issue body.
///
/// Returns `None` when the heading is absent. Rows that cannot be read are
/// skipped or treated as pending; parsing never fails outright.
pub fn parse(body: &str) -> Option<TrackingTable> {
    let (start, end) = find_block(body)?;
    let rows = body[start..end].lines().filter_map(parse_row).collect();
    Some(TrackingTable { rows })
}

/// Replace the tracking block in `body` with `block`, or append it.
pub fn upsert_block(body: &str, block: &str) -> String {
    match find_block(body) {
        Some((start, end)) => {
            let mut out = String::with_capacity(body.len() + block.len());
            out.push_str(&body[..start]);
            out.push_str(block);
            if end < body.len() {
                out.push('\n');
            }
            out.push_str(&body[end..]);
            out
        }
        None if body.trim().is_empty() => block.to_string(),
        None => format!("{}\n\n{}", body.trim_end(), block),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MainBranchBinding;

    fn ready_state() -> PipelineState {
        PipelineState::new(
            12,
            PipelineStatus::Ready,
            vec!["plan".into(), "tasks".into()],
        )
    }

    #[test]
    fn render_marks_stages_relative_to_status() {
        let mut state = ready_state();
        state.complete_agent("plan").unwrap();
        let block = render(&state, &AgentMapping::default());

        assert!(block.starts_with(HEADING));
        assert!(block.contains("| 1 | Backlog | `specify` | ✅ Done |"));
        assert!(block.contains("| 2 | Ready | `plan` | ✅ Done |"));
        assert!(block.contains("| 3 | Ready | `tasks` | 🔄 Active |"));
        assert!(block.contains("| 4 | In Progress | `implement` | ⏳ Pending |"));
        assert!(block.contains("- **Active agent:** `tasks`"));
    }

    #[test]
    fn render_is_deterministic() {
        let mut state = ready_state();
        state.main_branch = Some(MainBranchBinding::new("copilot/plan-12", 40, None));
        let mapping = AgentMapping::default();
        assert_eq!(render(&state, &mapping), render(&state, &mapping));
    }

    #[test]
    fn done_status_renders_everything_done() {
        let state = PipelineState::new(3, PipelineStatus::Done, Vec::new());
        let table = parse(&render(&state, &AgentMapping::default())).unwrap();
        assert_eq!(table.rows.len(), 4);
        assert!(table.rows.iter().all(|r| r.progress == AgentProgress::Done));
    }

    #[test]
    fn parse_missing_heading_is_none() {
        assert!(parse("Just a regular issue body").is_none());
    }

    #[test]
    fn parse_treats_garbled_state_as_pending() {
        let body = "## Agent Pipeline\n\n\
                    | # | Status | Agent | State |\n\
                    |---|---|---|---|\n\
                    | 1 | ready | `plan` | ✅ Done |\n\
                    | 2 | READY | tasks | ???? |\n\
                    | 3 | Ready |\n\
                    | broken row without pipes\n";
        let table = parse(body).unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1].agent, "tasks");
        assert_eq!(table.rows[1].progress, AgentProgress::Pending);
        assert_eq!(table.rows[1].status, Some(PipelineStatus::Ready));
    }

    #[test]
    fn progress_counts_only_leading_done_rows() {
        let body = "## Agent Pipeline\n\
                    | 1 | Ready | `plan` | ⏳ Pending |\n\
                    | 2 | Ready | `tasks` | ✅ Done |\n";
        let table = parse(body).unwrap();
        let progress = table.progress_for(PipelineStatus::Ready, &[]);
        assert_eq!(progress.current_index, 0);
        assert!(progress.completed.is_empty());
    }

    #[test]
    fn progress_falls_back_to_configured_agents() {
        let table = TrackingTable::default();
        let progress =
            table.progress_for(PipelineStatus::Ready, &["plan".into(), "tasks".into()]);
        assert_eq!(progress.agents, vec!["plan", "tasks"]);
        assert_eq!(progress.current_index, 0);
    }

    #[test]
    fn upsert_replaces_existing_block_only() {
        let body = "Intro text\n\n## Agent Pipeline\n\n| 1 | Ready | `old` | ⏳ Pending |\n\n## Notes\nkeep me\n";
        let block = render(&ready_state(), &AgentMapping::default());
        let updated = upsert_block(body, &block);

        assert!(updated.starts_with("Intro text\n\n## Agent Pipeline"));
        assert!(!updated.contains("`old`"));
        assert!(updated.ends_with("## Notes\nkeep me\n"));
        assert_eq!(upsert_block(&updated, &block), updated);
    }

    #[test]
    fn upsert_appends_when_missing() {
        let block = render(&ready_state(), &AgentMapping::default());
        let updated = upsert_block("Describe the feature.\n", &block);
        assert_eq!(updated, format!("Describe the feature.\n\n{block}"));
        assert_eq!(upsert_block(&updated, &block), updated);
        assert_eq!(upsert_block("", &block), block);
    }

    #[test]
    fn upsert_keeps_lower_level_sections_after_the_block() {
        let block = render(&ready_state(), &AgentMapping::default());
        let body = format!("Intro\n\n{block}\n### Notes\nkeep me\n\nPlain paragraph.\n");
        let updated = upsert_block(&body, &block);
        assert_eq!(updated, body);

        let parsed = parse(&updated).unwrap();
        assert_eq!(parsed.rows.len(), 4);

        let trailing = format!("{block}Operator remark without a heading.\n");
        let updated = upsert_block(&trailing, &block);
        assert!(updated.ends_with("\nOperator remark without a heading.\n"));
        assert_eq!(upsert_block(&updated, &block), updated);
    }

    #[test]
    fn progress_words_must_match_exactly() {
        assert_eq!(parse_progress("✅ Done"), AgentProgress::Done);
        assert_eq!(parse_progress("done"), AgentProgress::Done);
        assert_eq!(parse_progress("✅"), AgentProgress::Done);
        assert_eq!(parse_progress("🔄 Active"), AgentProgress::Active);
        assert_eq!(parse_progress("🔄"), AgentProgress::Active);
        assert_eq!(parse_progress("not done"), AgentProgress::Pending);
        assert_eq!(parse_progress("inactive"), AgentProgress::Pending);
        assert_eq!(parse_progress("⏳ Pending"), AgentProgress::Pending);
    }
}
