use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ap_harness::in_flight::{IssueLocks, PendingAssignments};
use ap_harness::retry::{Idempotency, RetryPolicy, Retryable};

#[derive(Debug)]
struct Flaky;

impl std::fmt::Display for Flaky {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("flaky")
    }
}

impl Retryable for Flaky {
    fn is_transient(&self) -> bool {
        true
    }
}

/// Two concurrent tasks race to claim and "assign" the same issue.
#[tokio::test]
async fn overlapping_claims_issue_one_assignment() {
    let pending = PendingAssignments::new();
    let assignments = Arc::new(AtomicU32::new(0));

    let race = |pending: PendingAssignments, assignments: Arc<AtomicU32>| async move {
        if pending.claim(77, "plan", chrono::Utc::now()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assignments.fetch_add(1, Ordering::SeqCst);
        }
    };

    tokio::join!(
        race(pending.clone(), assignments.clone()),
        race(pending.clone(), assignments.clone()),
    );

    assert_eq!(assignments.load(Ordering::SeqCst), 1);
    assert!(pending.is_pending(77));
}

#[tokio::test]
async fn lease_spans_awaits_and_blocks_second_tick() {
    let locks = IssueLocks::new();
    let lease = locks.try_acquire(10).expect("tick one acquires");

    let other = locks.clone();
    let second = tokio::spawn(async move { other.try_acquire(10).is_some() })
        .await
        .expect("join");
    assert!(!second);

    drop(lease);
    assert!(locks.try_acquire(10).is_some());
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let policy = RetryPolicy {
        max_attempts: 4,
        initial_backoff: Duration::from_millis(1),
        multiplier: 2.0,
        max_backoff: Duration::from_millis(2),
    };
    let count = AtomicU32::new(0);
    let calls = &count;
    let result: Result<(), Flaky> = policy
        .run("merge", Idempotency::Idempotent, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky)
        })
        .await;
    assert!(result.is_err());
    assert_eq!(count.load(Ordering::SeqCst), 4);
}
