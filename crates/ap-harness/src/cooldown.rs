use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Last automatic recovery attempt per issue.
///
/// An issue re-assigned at `T` is not eligible again before `T + window`.
#[derive(Debug, Clone, Default)]
pub struct RecoveryCooldowns {
    last_attempt: Arc<DashMap<u64, DateTime<Utc>>>,
}

impl RecoveryCooldowns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_eligible(&self, issue: u64, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        match self.last_attempt.get(&issue) {
            Some(last) => now - *last >= window,
            None => true,
        }
    }

    pub fn record(&self, issue: u64, at: DateTime<Utc>) {
        self.last_attempt.insert(issue, at);
    }

    pub fn last_attempt(&self, issue: u64) -> Option<DateTime<Utc>> {
        self.last_attempt.get(&issue).map(|at| *at)
    }

    pub fn clear(&self, issue: u64) {
        self.last_attempt.remove(&issue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_eligible_inside_window() {
        let cooldowns = RecoveryCooldowns::new();
        let window = chrono::Duration::minutes(5);
        let t = Utc::now();

        assert!(cooldowns.is_eligible(1, t, window));
        cooldowns.record(1, t);
        assert!(!cooldowns.is_eligible(1, t, window));
        assert!(!cooldowns.is_eligible(1, t + chrono::Duration::seconds(299), window));
        assert!(cooldowns.is_eligible(1, t + chrono::Duration::minutes(5), window));
    }

    #[test]
    fn issues_cool_down_independently() {
        let cooldowns = RecoveryCooldowns::new();
        let window = chrono::Duration::minutes(5);
        let t = Utc::now();
        cooldowns.record(1, t);
        assert!(cooldowns.is_eligible(2, t, window));
        cooldowns.clear(1);
        assert!(cooldowns.is_eligible(1, t, window));
    }
}
