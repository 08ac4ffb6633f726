use std::collections::HashMap;
use std::sync::Arc;

use ap_core::types::PipelineState;
use tokio::sync::RwLock;

/// In-memory map from issue number to its pipeline state.
///
/// Rebuilt from the tracker on restart; nothing here is persisted.
#[derive(Debug, Clone, Default)]
pub struct PipelineStore {
    inner: Arc<RwLock<HashMap<u64, PipelineState>>>,
}

impl PipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, issue: u64) -> Option<PipelineState> {
        self.inner.read().await.get(&issue).cloned()
    }

    pub async fn contains(&self, issue: u64) -> bool {
        self.inner.read().await.contains_key(&issue)
    }

    pub async fn insert(&self, state: PipelineState) -> Option<PipelineState> {
        self.inner.write().await.insert(state.issue_number, state)
    }

    /// Apply `f` to the state of `issue`, if tracked.
    pub async fn update<R>(&self, issue: u64, f: impl FnOnce(&mut PipelineState) -> R) -> Option<R> {
        self.inner.write().await.get_mut(&issue).map(f)
    }

    /// Apply `f` to every tracked state.
    pub async fn update_all(&self, mut f: impl FnMut(&mut PipelineState)) {
        for state in self.inner.write().await.values_mut() {
            f(state);
        }
    }

    pub async fn remove(&self, issue: u64) -> Option<PipelineState> {
        self.inner.write().await.remove(&issue)
    }

    /// All states ordered by issue number.
    pub async fn snapshot(&self) -> Vec<PipelineState> {
        let mut states: Vec<PipelineState> = self.inner.read().await.values().cloned().collect();
        states.sort_by_key(|s| s.issue_number);
        states
    }

    pub async fn issues(&self) -> Vec<u64> {
        let mut issues: Vec<u64> = self.inner.read().await.keys().copied().collect();
        issues.sort_unstable();
        issues
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::types::PipelineStatus;

    #[tokio::test]
    async fn update_only_touches_tracked_issues() {
        let store = PipelineStore::new();
        store
            .insert(PipelineState::new(7, PipelineStatus::Ready, vec!["plan".into()]))
            .await;

        let hit = store.update(7, |s| s.mark_assigned(chrono::Utc::now())).await;
        let miss = store.update(8, |s| s.halted = true).await;
        assert!(hit.is_some());
        assert!(miss.is_none());
        assert!(store.get(7).await.unwrap().started_at.is_some());
        assert_eq!(store.issues().await, vec![7]);
    }

    #[tokio::test]
    async fn snapshot_is_ordered() {
        let store = PipelineStore::new();
        for issue in [30, 10, 20] {
            store
                .insert(PipelineState::new(issue, PipelineStatus::Backlog, vec![]))
                .await;
        }
        let order: Vec<u64> = store.snapshot().await.iter().map(|s| s.issue_number).collect();
        assert_eq!(order, vec![10, 20, 30]);
        assert!(store.remove(20).await.is_some());
        assert_eq!(store.len().await, 2);
    }
}
