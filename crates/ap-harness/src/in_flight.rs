use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

// ---------------------------------------------------------------------------
// PendingAssignments
// ---------------------------------------------------------------------------

/// An assignment that has been claimed but whose agent has not finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingAssignment {
    pub agent: String,
    pub claimed_at: DateTime<Utc>,
}

/// Registry of issues with an assignment in flight.
///
/// A claim is taken synchronously before the tracker call is issued and is
/// released only when the call fails or the agent completes. Two ticks
/// racing on the same issue therefore cannot both issue the assignment.
#[derive(Debug, Clone, Default)]
pub struct PendingAssignments {
    inner: Arc<DashMap<u64, PendingAssignment>>,
}

impl PendingAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `issue` for `agent`. Returns `false` if a claim already exists.
    pub fn claim(&self, issue: u64, agent: &str, now: DateTime<Utc>) -> bool {
        match self.inner.entry(issue) {
            Entry::Occupied(existing) => {
                debug!(
                    issue,
                    agent,
                    pending = %existing.get().agent,
                    "assignment already pending"
                );
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingAssignment {
                    agent: agent.to_string(),
                    claimed_at: now,
                });
                true
            }
        }
    }

    pub fn release(&self, issue: u64) -> Option<PendingAssignment> {
        self.inner.remove(&issue).map(|(_, pending)| pending)
    }

    pub fn get(&self, issue: u64) -> Option<PendingAssignment> {
        self.inner.get(&issue).map(|entry| entry.value().clone())
    }

    pub fn is_pending(&self, issue: u64) -> bool {
        self.inner.contains_key(&issue)
    }

    /// Pending claim younger than `window` at `now`.
    pub fn is_live(&self, issue: u64, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.inner
            .get(&issue)
            .is_some_and(|entry| now - entry.claimed_at < window)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

// ---------------------------------------------------------------------------
// IssueLocks
// ---------------------------------------------------------------------------

/// Per-issue exclusion between overlapping ticks.
///
/// A tick holds an [`IssueLease`] while it runs the phases for one issue;
/// a second tick finding the lease taken skips that issue.
#[derive(Debug, Clone, Default)]
pub struct IssueLocks {
    held: Arc<DashMap<u64, DateTime<Utc>>>,
}

impl IssueLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, issue: u64) -> Option<IssueLease> {
        match self.held.entry(issue) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Some(IssueLease {
                    issue,
                    held: Arc::clone(&self.held),
                })
            }
        }
    }

}

/// Released on drop.
#[derive(Debug)]
pub struct IssueLease {
    issue: u64,
    held: Arc<DashMap<u64, DateTime<Utc>>>,
}

impl IssueLease {
    pub fn issue(&self) -> u64 {
        self.issue
    }
}

impl Drop for IssueLease {
    fn drop(&mut self) {
        self.held.remove(&self.issue);
    }
}
