//! Self-healing, halting and resumption.

use std::sync::Arc;

use ap_core::config::{Config, ConfigHandle, StaticSource};
use ap_core::types::ErrorKind;
use ap_daemon::orchestrator::{AssignmentResult, Orchestrator};
use ap_daemon::polling::PollingLoop;
use ap_daemon::recovery::{HealOutcome, HealSkip};
use ap_integrations::fake::{FakeOp, FakeTracker};
use ap_integrations::gateway::GatewayError;
use chrono::{Duration, Utc};

fn quick_config() -> Config {
    let mut config = Config::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config.polling.merge_propagation_delay_ms = 0;
    config
}

fn setup() -> (Arc<FakeTracker>, Arc<Orchestrator>, StaticSource) {
    let fake = Arc::new(FakeTracker::new());
    let source = StaticSource::new(quick_config());
    let handle = Arc::new(ConfigHandle::new(source.clone()).unwrap());
    let orch = Arc::new(Orchestrator::new(fake.clone(), handle));
    (fake, orch, source)
}

/// Make the current assignment look abandoned two hours ago.
async fn go_stale(orch: &Orchestrator, issue: u64, agent: &str) {
    let long_ago = Utc::now() - Duration::hours(2);
    orch.pending().release(issue);
    assert!(orch.pending().claim(issue, agent, long_ago));
    orch.store()
        .update(issue, |s| s.started_at = Some(long_ago))
        .await;
}

#[tokio::test]
async fn live_assignment_is_left_alone() {
    let (fake, orch, _) = setup();
    let issue = fake.add_issue("Add login", "");
    orch.start_workflow(issue).await.unwrap();

    let outcome = orch.self_heal(issue).await.unwrap();
    assert_eq!(outcome, HealOutcome::Skipped(HealSkip::PendingAssignment));
    assert_eq!(fake.assignments().len(), 1);
    assert_eq!(orch.pending().get(issue).unwrap().agent, "specify");
}

#[tokio::test]
async fn stalled_agent_is_reassigned_once_per_cooldown() {
    let (fake, orch, _) = setup();
    let issue = fake.add_issue("Add login", "");
    let started = orch.start_workflow(issue).await.unwrap();
    let specify = started.sub_issue_for("specify").unwrap();

    go_stale(&orch, issue, "specify").await;
    let outcome = orch.self_heal(issue).await.unwrap();
    assert_eq!(
        outcome,
        HealOutcome::Reassigned(AssignmentResult::Assigned {
            agent: "specify".into(),
            target_issue: specify,
            base_branch: None,
        })
    );
    assert_eq!(fake.assignments().len(), 2);
    assert!(orch.cooldowns().last_attempt(issue).is_some());

    go_stale(&orch, issue, "specify").await;
    let outcome = orch.self_heal(issue).await.unwrap();
    assert_eq!(outcome, HealOutcome::Skipped(HealSkip::CoolingDown));
    assert_eq!(fake.assignments().len(), 2);
}

#[tokio::test]
async fn recent_comment_counts_as_activity() {
    let (fake, orch, _) = setup();
    let issue = fake.add_issue("Add login", "");
    let started = orch.start_workflow(issue).await.unwrap();
    let specify = started.sub_issue_for("specify").unwrap();

    fake.add_comment(specify, "copilot", "Drafting the requirements now.");
    go_stale(&orch, issue, "specify").await;
    let outcome = orch.self_heal(issue).await.unwrap();
    assert_eq!(outcome, HealOutcome::Skipped(HealSkip::RecentActivity));

    fake.backdate_comments(specify, Duration::hours(2));
    let outcome = orch.self_heal(issue).await.unwrap();
    assert!(matches!(outcome, HealOutcome::Reassigned(_)));
}

#[tokio::test]
async fn recovery_phase_reports_reassignment() {
    let (fake, orch, _) = setup();
    let polling = PollingLoop::new(orch.clone());
    let issue = fake.add_issue("Add login", "");
    orch.start_workflow(issue).await.unwrap();

    go_stale(&orch, issue, "specify").await;
    let report = polling.tick().await;
    assert_eq!(report.recovered, 1);
    assert_eq!(fake.assignments().len(), 2);

    let next = polling.tick().await;
    assert_eq!(next.recovered, 0);
}

#[tokio::test]
async fn fatal_error_halts_until_config_changes() {
    let (fake, orch, source) = setup();
    let polling = PollingLoop::new(orch.clone());
    let issue = fake.add_issue("Add login", "");
    fake.fail_always(FakeOp::Assign, GatewayError::Permission("no access".into()));

    assert!(orch.start_workflow(issue).await.is_err());
    let report = polling.tick().await;
    assert_eq!(report.failures, 1);
    assert_eq!(report.errors[0].kind, ErrorKind::Fatal);
    assert_eq!(report.errors[0].phase, "backlog_intake");

    let state = orch.store().get(issue).await.unwrap();
    assert!(state.halted);
    assert_eq!(state.last_error.unwrap().kind, ErrorKind::Fatal);

    let attempts = fake.calls(FakeOp::Assign);
    let report = polling.tick().await;
    assert_eq!(report.failures, 0);
    assert_eq!(fake.calls(FakeOp::Assign), attempts, "halted issues are not assigned");
    assert_eq!(
        orch.self_heal(issue).await.unwrap(),
        HealOutcome::Skipped(HealSkip::Halted)
    );

    fake.clear_failures();
    let mut fixed = quick_config();
    fixed.pipeline.worker = "copilot-swe-agent".into();
    source.replace(fixed);
    let report = polling.tick().await;
    assert_eq!(report.assignments, 1);

    let state = orch.store().get(issue).await.unwrap();
    assert!(!state.halted);
    assert!(state.last_error.is_none());
    assert_eq!(fake.assignments()[0].worker, "copilot-swe-agent");
}

#[tokio::test]
async fn transient_failure_is_retried_and_cleared() {
    let (fake, orch, _) = setup();
    let polling = PollingLoop::new(orch.clone());
    let issue = fake.add_issue("Add login", "");
    orch.start_workflow(issue).await.unwrap();

    fake.fail_next(FakeOp::Comments, GatewayError::Transient("502".into()));
    let report = polling.tick().await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(orch.store().get(issue).await.unwrap().last_error.is_none());
}
