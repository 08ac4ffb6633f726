use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::names::{names_match, NameKey};

// ---------------------------------------------------------------------------
// PipelineStatus
// ---------------------------------------------------------------------------

/// Board column an issue sits in.
///
/// Ordered: an issue moves forward through the variants in declaration order.
/// Serialized using the board's display spelling ("In Progress").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PipelineStatus {
    Backlog,
    Ready,
    InProgress,
    InReview,
    Done,
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 5] = [
        PipelineStatus::Backlog,
        PipelineStatus::Ready,
        PipelineStatus::InProgress,
        PipelineStatus::InReview,
        PipelineStatus::Done,
    ];

    /// The spelling used on the board and in the tracking table.
    pub fn display_name(&self) -> &'static str {
        match self {
            PipelineStatus::Backlog => "Backlog",
            PipelineStatus::Ready => "Ready",
            PipelineStatus::InProgress => "In Progress",
            PipelineStatus::InReview => "In Review",
            PipelineStatus::Done => "Done",
        }
    }

    /// Parse a board column name, ignoring case and separators.
    pub fn parse(name: &str) -> Option<Self> {
        let key = NameKey::new(name);
        Self::ALL
            .into_iter()
            .find(|s| NameKey::new(s.display_name()) == key)
    }

    /// The following column, or `None` from `Done`.
    pub fn next(&self) -> Option<Self> {
        match self {
            PipelineStatus::Backlog => Some(PipelineStatus::Ready),
            PipelineStatus::Ready => Some(PipelineStatus::InProgress),
            PipelineStatus::InProgress => Some(PipelineStatus::InReview),
            PipelineStatus::InReview => Some(PipelineStatus::Done),
            PipelineStatus::Done => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Done)
    }

    /// Review columns get a code review instead of another coding agent.
    pub fn is_review(&self) -> bool {
        matches!(self, PipelineStatus::InReview)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pipeline status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for PipelineStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl From<PipelineStatus> for String {
    fn from(status: PipelineStatus) -> Self {
        status.display_name().to_string()
    }
}

impl TryFrom<String> for PipelineStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ---------------------------------------------------------------------------
// AgentProgress
// ---------------------------------------------------------------------------

/// Per-agent annotation in the tracking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentProgress {
    Pending,
    Active,
    Done,
}

impl fmt::Display for AgentProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentProgress::Pending => "Pending",
            AgentProgress::Active => "Active",
            AgentProgress::Done => "Done",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// MainBranchBinding
// ---------------------------------------------------------------------------

/// The branch every agent of an issue builds on and merges into.
///
/// Set by the first code change produced for the issue. Only
/// `head_revision` moves afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainBranchBinding {
    pub branch_name: String,
    pub source_pr: u64,
    pub head_revision: Option<String>,
}

impl MainBranchBinding {
    pub fn new(
        branch_name: impl Into<String>,
        source_pr: u64,
        head_revision: Option<String>,
    ) -> Self {
        Self {
            branch_name: branch_name.into(),
            source_pr,
            head_revision,
        }
    }

    /// Record the revision produced by merging a child branch.
    pub fn advance(&mut self, revision: impl Into<String>) {
        self.head_revision = Some(revision.into());
    }
}

// ---------------------------------------------------------------------------
// AgentMapping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("agent_mappings key {0:?} is not a known status")]
    UnknownStatus(String),
    #[error("agent_mappings key {0:?} appears more than once")]
    DuplicateStatus(String),
    #[error("agent name {agent:?} under {status} is not valid")]
    InvalidAgentName { status: String, agent: String },
    #[error("agent {0:?} is configured more than once")]
    DuplicateAgent(String),
}

/// Ordered agents per status column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMapping {
    stages: BTreeMap<PipelineStatus, Vec<String>>,
}

impl Default for AgentMapping {
    fn default() -> Self {
        let mut stages = BTreeMap::new();
        stages.insert(PipelineStatus::Backlog, vec!["specify".to_string()]);
        stages.insert(
            PipelineStatus::Ready,
            vec!["plan".to_string(), "tasks".to_string()],
        );
        stages.insert(PipelineStatus::InProgress, vec!["implement".to_string()]);
        Self { stages }
    }
}

impl AgentMapping {
    /// Build from configuration keyed by board column names.
    ///
    /// Keys are matched case-insensitively; every agent name must be unique
    /// across all stages since sub-issue titles are keyed by agent alone.
    pub fn from_names(raw: &BTreeMap<String, Vec<String>>) -> Result<Self, MappingError> {
        let mut stages = BTreeMap::new();
        let mut seen_agents = BTreeSet::new();

        for (key, agents) in raw {
            let status = PipelineStatus::parse(key)
                .ok_or_else(|| MappingError::UnknownStatus(key.clone()))?;
            if stages.contains_key(&status) {
                return Err(MappingError::DuplicateStatus(key.clone()));
            }

            let mut sequence = Vec::with_capacity(agents.len());
            for agent in agents {
                let trimmed = agent.trim();
                if !is_valid_agent_name(trimmed) {
                    return Err(MappingError::InvalidAgentName {
                        status: key.clone(),
                        agent: agent.clone(),
                    });
                }
                if !seen_agents.insert(NameKey::new(trimmed)) {
                    return Err(MappingError::DuplicateAgent(trimmed.to_string()));
                }
                sequence.push(trimmed.to_string());
            }
            stages.insert(status, sequence);
        }

        Ok(Self { stages })
    }

    /// Agents configured for `status`, empty when none are.
    pub fn agents_for(&self, status: PipelineStatus) -> &[String] {
        self.stages.get(&status).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The configured spelling of `agent`.
    pub fn canonical_agent(&self, agent: &str) -> Option<&str> {
        self.stages
            .values()
            .flatten()
            .find(|a| names_match(a, agent))
            .map(String::as_str)
    }

    /// Every `(status, agent)` pair in pipeline order.
    pub fn all_agents(&self) -> impl Iterator<Item = (PipelineStatus, &str)> {
        self.stages
            .iter()
            .flat_map(|(status, agents)| agents.iter().map(move |a| (*status, a.as_str())))
    }

    /// The first status reachable from `status` (inclusive) that needs
    /// attention: it has agents, is a review column, or is terminal.
    pub fn first_active_from(&self, status: PipelineStatus) -> PipelineStatus {
        let mut candidate = status;
        loop {
            if candidate.is_terminal()
                || candidate.is_review()
                || !self.agents_for(candidate).is_empty()
            {
                return candidate;
            }
            match candidate.next() {
                Some(next) => candidate = next,
                None => return candidate,
            }
        }
    }

    /// Raw form suitable for writing back into configuration.
    pub fn to_names(&self) -> BTreeMap<String, Vec<String>> {
        self.stages
            .iter()
            .map(|(status, agents)| (status.display_name().to_string(), agents.clone()))
            .collect()
    }
}

fn is_valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| matches!(c, '|' | '[' | ']' | '`' | '\n' | '\r'))
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retried on the next tick.
    Transient,
    /// Needs a configuration or operator fix.
    Fatal,
}

/// Last failure recorded against an issue, surfaced in the polling status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("agent {actual:?} cannot complete before {expected:?}")]
    OutOfOrder { expected: String, actual: String },
    #[error("stage {status} is already complete")]
    StageComplete { status: PipelineStatus },
    #[error("completed agents {completed:?} do not match the first {index} of {sequence:?}")]
    Inconsistent {
        completed: Vec<String>,
        sequence: Vec<String>,
        index: usize,
    },
}

/// Pipeline progress for one parent issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub issue_number: u64,
    pub status: PipelineStatus,
    pub agent_sequence: Vec<String>,
    /// Position in `agent_sequence`; equal to its length once the stage is done.
    pub current_index: usize,
    pub completed_agents: Vec<String>,
    /// When the current agent was assigned. `None` until an assignment succeeds.
    pub started_at: Option<DateTime<Utc>>,
    /// Agent name to dedicated sub-issue number, for every stage.
    pub sub_issues: BTreeMap<String, u64>,
    pub main_branch: Option<MainBranchBinding>,
    /// Agents whose outputs were merged and posted in this process.
    pub outputs_posted: BTreeSet<String>,
    pub review_requested: bool,
    /// Automatic assignment is suspended after a fatal error.
    pub halted: bool,
    pub last_error: Option<PipelineError>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(issue_number: u64, status: PipelineStatus, agents: Vec<String>) -> Self {
        Self {
            issue_number,
            status,
            agent_sequence: agents,
            current_index: 0,
            completed_agents: Vec::new(),
            started_at: None,
            sub_issues: BTreeMap::new(),
            main_branch: None,
            outputs_posted: BTreeSet::new(),
            review_requested: false,
            halted: false,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// The agent currently expected to be working.
    pub fn current_agent(&self) -> Option<&str> {
        self.agent_sequence
            .get(self.current_index)
            .map(String::as_str)
    }

    pub fn is_stage_complete(&self) -> bool {
        self.current_index >= self.agent_sequence.len()
    }

    pub fn progress_at(&self, index: usize) -> AgentProgress {
        if index < self.current_index {
            AgentProgress::Done
        } else if index == self.current_index {
            AgentProgress::Active
        } else {
            AgentProgress::Pending
        }
    }

    pub fn is_completed(&self, agent: &str) -> bool {
        self.completed_agents.iter().any(|a| names_match(a, agent))
    }

    /// Mark `agent` done and move to the next one.
    ///
    /// Only the current agent may complete. Completing an agent that is
    /// already done is a no-op returning `Ok(false)`.
    pub fn complete_agent(&mut self, agent: &str) -> Result<bool, StateError> {
        if self.is_completed(agent) {
            return Ok(false);
        }
        let current = match self.current_agent() {
            Some(current) => current.to_string(),
            None => {
                return Err(StateError::StageComplete {
                    status: self.status,
                })
            }
        };
        if !names_match(&current, agent) {
            return Err(StateError::OutOfOrder {
                expected: current,
                actual: agent.to_string(),
            });
        }

        self.completed_agents.push(current);
        self.current_index += 1;
        self.started_at = None;
        self.touch();
        Ok(true)
    }

    /// Move to `status` with a fresh sequence.
    pub fn enter_status(&mut self, status: PipelineStatus, agents: Vec<String>) {
        self.status = status;
        self.agent_sequence = agents;
        self.current_index = 0;
        self.completed_agents.clear();
        self.outputs_posted.clear();
        self.started_at = None;
        self.review_requested = false;
        self.touch();
    }

    pub fn mark_assigned(&mut self, at: DateTime<Utc>) {
        self.started_at = Some(at);
        self.touch();
    }

    /// Sub-issue for `agent`, matched case-insensitively.
    pub fn sub_issue_for(&self, agent: &str) -> Option<u64> {
        self.sub_issues
            .iter()
            .find(|(name, _)| names_match(name, agent))
            .map(|(_, number)| *number)
    }

    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if kind == ErrorKind::Fatal {
            self.halted = true;
        }
        self.last_error = Some(PipelineError {
            kind,
            message: message.into(),
            at: Utc::now(),
        });
        self.touch();
    }

    pub fn clear_error(&mut self) {
        if self.last_error.is_some() {
            self.last_error = None;
            self.touch();
        }
    }

    /// Lift a fatal halt so the issue is picked up again.
    pub fn resume(&mut self) {
        self.halted = false;
        self.clear_error();
    }

    /// `completed_agents` must be exactly the first `current_index` agents.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let consistent = self.current_index <= self.agent_sequence.len()
            && self.completed_agents.len() == self.current_index
            && self
                .completed_agents
                .iter()
                .zip(&self.agent_sequence)
                .all(|(done, expected)| names_match(done, expected));
        if consistent {
            Ok(())
        } else {
            Err(StateError::Inconsistent {
                completed: self.completed_agents.clone(),
                sequence: self.agent_sequence.clone(),
                index: self.current_index,
            })
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_state() -> PipelineState {
        PipelineState::new(
            7,
            PipelineStatus::Ready,
            vec!["plan".into(), "tasks".into()],
        )
    }

    #[test]
    fn status_parse_accepts_board_spellings() {
        assert_eq!(PipelineStatus::parse("in progress"), Some(PipelineStatus::InProgress));
        assert_eq!(PipelineStatus::parse("IN_REVIEW"), Some(PipelineStatus::InReview));
        assert_eq!(PipelineStatus::parse("backlog"), Some(PipelineStatus::Backlog));
        assert_eq!(PipelineStatus::parse("Blocked"), None);
    }

    #[test]
    fn status_serializes_as_display_name() {
        let json = serde_json::to_string(&PipelineStatus::InProgress).unwrap();
        assert_eq!(json, "\"In Progress\"");
        let parsed: PipelineStatus = serde_json::from_str("\"in-review\"").unwrap();
        assert_eq!(parsed, PipelineStatus::InReview);
        assert!(serde_json::from_str::<PipelineStatus>("\"nope\"").is_err());
    }

    #[test]
    fn status_order_ends_at_done() {
        let mut status = PipelineStatus::Backlog;
        let mut visited = vec![status];
        while let Some(next) = status.next() {
            visited.push(next);
            status = next;
        }
        assert_eq!(visited, PipelineStatus::ALL.to_vec());
        assert!(status.is_terminal());
    }

    #[test]
    fn complete_agent_advances_in_order() {
        let mut state = ready_state();
        assert_eq!(state.current_agent(), Some("plan"));
        assert!(state.complete_agent("Plan").unwrap());
        assert_eq!(state.current_index, 1);
        assert_eq!(state.completed_agents, vec!["plan".to_string()]);
        assert_eq!(state.current_agent(), Some("tasks"));
        state.check_invariants().unwrap();
    }

    #[test]
    fn complete_agent_rejects_out_of_order() {
        let mut state = ready_state();
        let err = state.complete_agent("tasks").unwrap_err();
        assert_eq!(
            err,
            StateError::OutOfOrder {
                expected: "plan".into(),
                actual: "tasks".into()
            }
        );
        assert_eq!(state.current_index, 0);
    }

    #[test]
    fn complete_agent_twice_is_noop() {
        let mut state = ready_state();
        state.complete_agent("plan").unwrap();
        assert!(!state.complete_agent("plan").unwrap());
        assert_eq!(state.current_index, 1);
    }

    #[test]
    fn completing_past_the_end_is_an_error() {
        let mut state = ready_state();
        state.complete_agent("plan").unwrap();
        state.complete_agent("tasks").unwrap();
        assert!(state.is_stage_complete());
        assert!(matches!(
            state.complete_agent("implement"),
            Err(StateError::StageComplete { .. })
        ));
    }

    #[test]
    fn enter_status_resets_progress() {
        let mut state = ready_state();
        state.complete_agent("plan").unwrap();
        state.review_requested = true;
        state.enter_status(PipelineStatus::InProgress, vec!["implement".into()]);
        assert_eq!(state.current_index, 0);
        assert!(state.completed_agents.is_empty());
        assert!(!state.review_requested);
        assert_eq!(state.current_agent(), Some("implement"));
    }

    #[test]
    fn progress_marks_done_active_pending() {
        let mut state = PipelineState::new(
            1,
            PipelineStatus::Ready,
            vec!["a".into(), "b".into(), "c".into()],
        );
        state.complete_agent("a").unwrap();
        assert_eq!(state.progress_at(0), AgentProgress::Done);
        assert_eq!(state.progress_at(1), AgentProgress::Active);
        assert_eq!(state.progress_at(2), AgentProgress::Pending);
    }

    #[test]
    fn fatal_error_halts() {
        let mut state = ready_state();
        state.record_error(ErrorKind::Transient, "rate limited");
        assert!(!state.halted);
        state.record_error(ErrorKind::Fatal, "permission denied");
        assert!(state.halted);
        state.resume();
        assert!(!state.halted);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn invariant_check_catches_drift() {
        let mut state = ready_state();
        state.current_index = 1;
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn mapping_lookup_is_case_insensitive() {
        let mut raw = BTreeMap::new();
        raw.insert("backlog".to_string(), vec!["Specify".to_string()]);
        raw.insert("IN PROGRESS".to_string(), vec!["implement".to_string()]);
        let mapping = AgentMapping::from_names(&raw).unwrap();

        assert_eq!(mapping.agents_for(PipelineStatus::Backlog), ["Specify".to_string()]);
        assert_eq!(
            mapping.agents_for(PipelineStatus::InProgress),
            ["implement".to_string()]
        );
        assert!(mapping.agents_for(PipelineStatus::Ready).is_empty());
        assert_eq!(mapping.canonical_agent("specify"), Some("Specify"));
        assert_eq!(mapping.canonical_agent("IMPLEMENT"), Some("implement"));
    }

    #[test]
    fn mapping_rejects_unknown_status_and_duplicates() {
        let mut raw = BTreeMap::new();
        raw.insert("Blocked".to_string(), vec!["x".to_string()]);
        assert!(matches!(
            AgentMapping::from_names(&raw),
            Err(MappingError::UnknownStatus(_))
        ));

        let mut raw = BTreeMap::new();
        raw.insert("Backlog".to_string(), vec!["plan".to_string()]);
        raw.insert("Ready".to_string(), vec!["PLAN".to_string()]);
        assert!(matches!(
            AgentMapping::from_names(&raw),
            Err(MappingError::DuplicateAgent(_))
        ));

        let mut raw = BTreeMap::new();
        raw.insert("Ready".to_string(), vec!["bad|name".to_string()]);
        assert!(matches!(
            AgentMapping::from_names(&raw),
            Err(MappingError::InvalidAgentName { .. })
        ));
    }

    #[test]
    fn first_active_skips_empty_stages() {
        let mut raw = BTreeMap::new();
        raw.insert("Backlog".to_string(), vec!["specify".to_string()]);
        raw.insert("In Progress".to_string(), vec!["implement".to_string()]);
        let mapping = AgentMapping::from_names(&raw).unwrap();

        assert_eq!(
            mapping.first_active_from(PipelineStatus::Ready),
            PipelineStatus::InProgress
        );
        assert_eq!(
            mapping.first_active_from(PipelineStatus::InReview),
            PipelineStatus::InReview
        );
    }

    #[test]
    fn default_mapping_matches_documented_pipeline() {
        let mapping = AgentMapping::default();
        let all: Vec<_> = mapping.all_agents().map(|(_, a)| a.to_string()).collect();
        assert_eq!(all, vec!["specify", "plan", "tasks", "implement"]);
    }
}
