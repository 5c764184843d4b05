// End-to-end scenario tests for the activity coordinator, driving it the
// same way a real lease-agent/lease-acquirer pair would: register, push
// lease events, then exercise run_activity/start_activity and observe the
// outcomes. No mocked coordinator internals — this talks only to the public
// `CoordinatorHandle` surface, the same boundary a real caller sees.

use std::collections::BTreeSet;
use std::time::Duration;

use activity_coordinator::{
    ActivityOptions, ActivityToken, CoordinatorConfig, CoordinatorError, CoordinatorHandle, Domain,
    EpochToken, LeaseHolder, NamePath, QuorumExpr, RunActivityError, StartedActivity,
    TerminationReason,
};
use tokio::sync::oneshot;
use tokio::time::timeout;

fn nodes(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn short_timeout(ms: u64) -> ActivityOptions {
    ActivityOptions { quorum_timeout: Some(Duration::from_millis(ms)), ..Default::default() }
}

#[tokio::test]
async fn happy_path_majority_quorum_runs_activity_to_completion() {
    let handle = CoordinatorHandle::spawn("n1", CoordinatorConfig::default());
    let agent = handle.register_agent().await.expect("agent should register");
    let acquirer = handle.register_acquirer().await.expect("acquirer should register");
    handle.update_membership(nodes(&["n1", "n2", "n3"])).await.unwrap();
    agent.local_lease_granted(LeaseHolder::new("n1", EpochToken::new(vec![1]))).await.unwrap();
    acquirer.lease_acquired("n1".to_string()).await.unwrap();
    acquirer.lease_acquired("n2".to_string()).await.unwrap();

    let result = timeout(
        Duration::from_secs(2),
        handle.run_activity(None, "rebalance", "x", QuorumExpr::Majority, ActivityOptions::default(), |_token, _cancel| async {
            42
        }),
    )
    .await
    .expect("run_activity should not hang");

    assert_eq!(result.unwrap(), 42);
}

#[tokio::test]
async fn quorum_timeout_reports_observed_remote_leases() {
    let handle = CoordinatorHandle::spawn("n1", CoordinatorConfig::default());
    let agent = handle.register_agent().await.expect("agent should register");
    let acquirer = handle.register_acquirer().await.expect("acquirer should register");
    handle.update_membership(nodes(&["n1", "n2", "n3"])).await.unwrap();
    agent.local_lease_granted(LeaseHolder::new("n1", EpochToken::new(vec![1]))).await.unwrap();
    acquirer.lease_acquired("n1".to_string()).await.unwrap();

    let result = timeout(
        Duration::from_secs(2),
        handle.run_activity(None, "rebalance", "x", QuorumExpr::Majority, short_timeout(50), |_token, _cancel| async {
            42
        }),
    )
    .await
    .expect("run_activity should resolve once its own quorum_timeout fires");

    match result {
        Err(RunActivityError::Admission(CoordinatorError::NoQuorum { observed_remote_leases, .. })) => {
            assert_eq!(observed_remote_leases, vec!["n1".to_string()]);
        }
        other => panic!("expected NoQuorum, got {other:?}"),
    }
}

#[tokio::test]
async fn unsafe_timeout_admits_activity_without_remote_quorum() {
    let handle = CoordinatorHandle::spawn("n1", CoordinatorConfig::default());
    let agent = handle.register_agent().await.expect("agent should register");
    let acquirer = handle.register_acquirer().await.expect("acquirer should register");
    handle.update_membership(nodes(&["n1", "n2", "n3"])).await.unwrap();
    agent.local_lease_granted(LeaseHolder::new("n1", EpochToken::new(vec![1]))).await.unwrap();
    acquirer.lease_acquired("n1".to_string()).await.unwrap();

    let options = ActivityOptions {
        quorum_timeout: Some(Duration::from_millis(50)),
        unsafe_mode: true,
        ..Default::default()
    };
    let result = timeout(
        Duration::from_secs(2),
        handle.run_activity(None, "rebalance", "x", QuorumExpr::Majority, options, |_token, _cancel| async {
            "ran"
        }),
    )
    .await
    .expect("run_activity should not hang");

    assert_eq!(result.unwrap(), "ran");
}

#[tokio::test]
async fn unsafe_timeout_never_admits_without_local_lease() {
    let handle = CoordinatorHandle::spawn("n1", CoordinatorConfig::default());
    // No agent registered at all: have_lease(Leader, ..) can never hold.
    let options = ActivityOptions {
        quorum_timeout: Some(Duration::from_millis(30)),
        unsafe_mode: true,
        ..Default::default()
    };
    let result = timeout(
        Duration::from_secs(2),
        handle.run_activity(None, "rebalance", "x", QuorumExpr::Majority, options, |_token, _cancel| async { 1 }),
    )
    .await
    .expect("run_activity should not hang");

    assert!(matches!(result, Err(RunActivityError::Admission(CoordinatorError::NoQuorum { .. }))));
}

#[tokio::test]
async fn quorum_loss_mid_activity_terminates_with_quorum_lost_reason() {
    let handle = CoordinatorHandle::spawn("n1", CoordinatorConfig::default());
    let agent = handle.register_agent().await.expect("agent should register");
    let acquirer = handle.register_acquirer().await.expect("acquirer should register");
    handle.update_membership(nodes(&["n1", "n2", "n3"])).await.unwrap();
    agent.local_lease_granted(LeaseHolder::new("n1", EpochToken::new(vec![1]))).await.unwrap();
    acquirer.lease_acquired("n1".to_string()).await.unwrap();
    acquirer.lease_acquired("n2".to_string()).await.unwrap();

    let started = handle
        .start_activity(
            None,
            "rebalance",
            None,
            "long-running",
            QuorumExpr::Majority,
            ActivityOptions::default(),
            |_token, cancel| async move {
                cancel.cancelled().await;
            },
        )
        .await
        .expect("activity should be admitted under a held majority");

    let StartedActivity::Supervised { reason_rx, .. } = started else {
        panic!("expected a supervised activity outside bypass mode");
    };

    acquirer.lease_lost("n2".to_string()).await.unwrap();

    let reason = timeout(Duration::from_secs(2), reason_rx)
        .await
        .expect("termination reason should arrive promptly")
        .expect("reason channel should not be dropped");

    assert_eq!(reason, TerminationReason::QuorumLost { detail: "lease_lost(n2)".to_string() });
}

#[tokio::test]
async fn domain_conflict_rejects_competing_top_level_start_but_allows_nested_call() {
    let handle = CoordinatorHandle::spawn("n1", CoordinatorConfig::default());
    let agent = handle.register_agent().await.expect("agent should register");
    let _acquirer = handle.register_acquirer().await.expect("acquirer should register");
    handle.update_membership(nodes(&["n1"])).await.unwrap();
    agent.local_lease_granted(LeaseHolder::new("n1", EpochToken::new(vec![1]))).await.unwrap();

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (proceed_tx, proceed_rx) = oneshot::channel::<()>();
    let (nested_result_tx, nested_result_rx) = oneshot::channel::<Result<(), CoordinatorError>>();

    let nested_handle = handle.clone();
    let started = handle
        .start_activity(
            None,
            "rebalance",
            None,
            "r1",
            QuorumExpr::Follower,
            ActivityOptions::default(),
            move |token, cancel| async move {
                let _ = started_tx.send(());
                let _ = proceed_rx.await;
                let nested = nested_handle
                    .start_activity(
                        Some(&token),
                        "rebalance",
                        None,
                        "r1-nested",
                        QuorumExpr::Follower,
                        ActivityOptions::default(),
                        |_token, _cancel| async {},
                    )
                    .await
                    .map(|_| ());
                let _ = nested_result_tx.send(nested);
                cancel.cancelled().await;
            },
        )
        .await
        .expect("r1 should be admitted");
    let StartedActivity::Supervised { .. } = started else {
        panic!("expected a supervised activity outside bypass mode");
    };

    started_rx.await.expect("r1 should signal it has started");

    let conflicting = handle
        .start_activity(
            None,
            "rebalance",
            None,
            "r2",
            QuorumExpr::Follower,
            ActivityOptions::default(),
            |_token, _cancel| async {},
        )
        .await;
    assert!(matches!(conflicting, Err(CoordinatorError::DomainConflict { .. })));

    proceed_tx.send(()).expect("r1 should still be waiting on proceed_rx");
    let nested_result = timeout(Duration::from_secs(2), nested_result_rx)
        .await
        .expect("nested call should resolve promptly")
        .expect("nested result channel should not be dropped");
    assert!(nested_result.is_ok(), "nested start under the same domain token should succeed: {nested_result:?}");
}

#[tokio::test]
async fn agent_death_terminates_all_activities_and_local_lease_becomes_undefined() {
    let handle = CoordinatorHandle::spawn("n1", CoordinatorConfig::default());
    let agent = handle.register_agent().await.expect("agent should register");
    let acquirer = handle.register_acquirer().await.expect("acquirer should register");
    handle.update_membership(nodes(&["n1"])).await.unwrap();
    agent.local_lease_granted(LeaseHolder::new("n1", EpochToken::new(vec![1]))).await.unwrap();

    let mut reason_rxs = Vec::new();
    for name in ["a", "b"] {
        let started = handle
            .start_activity(
                None,
                "rebalance",
                None,
                name,
                QuorumExpr::Follower,
                ActivityOptions::default(),
                |_token, cancel| async move {
                    cancel.cancelled().await;
                },
            )
            .await
            .expect("follower activity should be admitted under a held local lease");
        let StartedActivity::Supervised { reason_rx, .. } = started else {
            panic!("expected a supervised activity outside bypass mode");
        };
        reason_rxs.push(reason_rx);
    }

    agent.die().await;

    for reason_rx in reason_rxs {
        let reason = timeout(Duration::from_secs(2), reason_rx)
            .await
            .expect("termination reason should arrive promptly")
            .expect("reason channel should not be dropped");
        assert_eq!(reason, TerminationReason::LocalLeaseExpired);
    }

    let result = timeout(
        Duration::from_secs(2),
        handle.run_activity(None, "rebalance", "c", QuorumExpr::Follower, short_timeout(50), |_token, _cancel| async { 1 }),
    )
    .await
    .expect("run_activity should resolve once its own quorum_timeout fires");
    assert!(matches!(result, Err(RunActivityError::Admission(CoordinatorError::NoQuorum { .. }))));

    // The acquirer was never touched, so it should still be able to push
    // lease events without a wrong_pid error.
    acquirer.lease_acquired("n2".to_string()).await.unwrap();
}

#[tokio::test]
async fn switch_quorum_is_idempotent() {
    let handle = CoordinatorHandle::spawn("n1", CoordinatorConfig::default());
    let agent = handle.register_agent().await.expect("agent should register");
    let _acquirer = handle.register_acquirer().await.expect("acquirer should register");
    handle.update_membership(nodes(&["n1"])).await.unwrap();
    agent.local_lease_granted(LeaseHolder::new("n1", EpochToken::new(vec![1]))).await.unwrap();

    let started = handle
        .start_activity(
            None,
            "rebalance",
            None,
            "r1",
            QuorumExpr::Follower,
            ActivityOptions::default(),
            |_token, cancel| async move {
                cancel.cancelled().await;
            },
        )
        .await
        .expect("start_activity should be admitted");
    let worker_id = match started {
        StartedActivity::Supervised { worker_id, .. } => worker_id,
        StartedActivity::Bypassed { .. } => panic!("expected a supervised activity"),
    };

    let ctx_token = ActivityToken::fresh(Domain::from("rebalance"), NamePath::new("r1"), false);

    handle
        .switch_quorum(worker_id, &ctx_token, QuorumExpr::Follower, ActivityOptions::default())
        .await
        .expect("first switch_quorum should succeed");
    handle
        .switch_quorum(worker_id, &ctx_token, QuorumExpr::Follower, ActivityOptions::default())
        .await
        .expect("repeating the same switch_quorum should be idempotent");
}

#[tokio::test]
async fn bypass_mode_runs_activity_regardless_of_lease_state() {
    let mut config = CoordinatorConfig::default();
    config.bypass_forced = true;
    let handle = CoordinatorHandle::spawn("n1", config);
    // No agent, no acquirer, no membership: a non-bypassed coordinator
    // would never admit this.
    let result = handle
        .run_activity(None, "rebalance", "x", QuorumExpr::Majority, ActivityOptions::default(), |_token, _cancel| async { 7 })
        .await;
    assert_eq!(result.unwrap(), 7);
}
