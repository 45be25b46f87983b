//! Layout membership and management-plane scenarios.

use std::time::Duration;

use fault_harness::sim::SimFlavor;
use fault_harness::{HarnessError, PollSettings, Symmetry};
use fault_types::ClusterStatus;
use tokio_util::sync::CancellationToken;

use crate::fixtures::deploy_sim;

/// Removing a server shrinks the layout; adding it back restores it.
#[tokio::test]
async fn remove_then_re_add_server() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let node2 = cluster.node(2).unwrap().id().clone();

    let removed = cluster.remove_node(2).await.unwrap();
    assert_eq!(removed.servers.len(), 2);
    assert!(!removed.contains(&node2));
    assert_eq!(removed.epoch, 1);

    let added = cluster.add_node(2).await.unwrap();
    assert_eq!(added.servers.len(), 3);
    assert!(added.contains(&node2));
    assert_eq!(added.epoch, 2);

    let stable = cluster.poller().wait_for_stable().await.unwrap();
    assert_eq!(stable.snapshot.layout.servers.len(), 3);

    deployment.teardown().await.unwrap();
}

/// Membership calls for nodes already in the requested state are no-ops.
#[tokio::test]
async fn membership_changes_are_idempotent() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;

    let layout = cluster.add_node(1).await.unwrap();
    assert_eq!(layout.epoch, 0);
    assert_eq!(layout.servers.len(), 3);

    cluster.remove_node(1).await.unwrap();
    let again = cluster.remove_node(1).await.unwrap();
    assert_eq!(again.epoch, 1);
    assert_eq!(again.servers.len(), 2);

    deployment.teardown().await.unwrap();
}

/// Epochs never go backwards across any sequence of faults and repairs.
#[tokio::test]
async fn epoch_is_monotonic() {
    let deployment = deploy_sim(4, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();

    let mut epochs = vec![cluster.layout().await.unwrap().epoch];

    epochs.push(cluster.remove_node(3).await.unwrap().epoch);

    injector
        .disconnect(0, &[1, 2], Symmetry::Symmetric)
        .await
        .unwrap();
    epochs.push(poller.wait_for_unresponsive_count(1).await.unwrap().snapshot.layout.epoch);

    injector
        .reconnect(0, &[1, 2], Symmetry::Symmetric)
        .await
        .unwrap();
    epochs.push(poller.wait_for_unresponsive_count(0).await.unwrap().snapshot.layout.epoch);

    epochs.push(cluster.add_node(3).await.unwrap().epoch);
    epochs.push(poller.wait_for_stable().await.unwrap().snapshot.layout.epoch);

    assert_eq!(epochs, vec![0, 1, 2, 3, 4, 4]);
    assert!(epochs.windows(2).all(|w| w[0] <= w[1]));

    deployment.teardown().await.unwrap();
}

/// Adding a stopped node fails with the layout that was observed.
#[tokio::test]
async fn adding_a_stopped_node_fails() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();

    cluster.remove_node(2).await.unwrap();
    injector.stop(2).await.unwrap();

    let err = cluster.add_node(2).await.unwrap_err();
    match err {
        HarnessError::MembershipOperationFailure {
            operation,
            observed,
            ..
        } => {
            assert_eq!(operation, "add");
            assert_eq!(observed.unwrap().servers.len(), 2);
        }
        other => panic!("unexpected error: {}", other),
    }

    injector.start(2).await.unwrap();
    cluster.add_node(2).await.unwrap();
    cluster.poller().wait_for_stable().await.unwrap();

    deployment.teardown().await.unwrap();
}

/// Reset reaches the node through the management API.
#[tokio::test]
async fn reset_running_node() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let node1 = cluster.node(1).unwrap().id().clone();

    cluster.reset_node(1).await.unwrap();
    assert_eq!(deployment.fabric.resets(&node1), 1);

    cluster.injector().kill(1).await.unwrap();
    assert!(cluster.reset_node(1).await.is_err());
    assert_eq!(deployment.fabric.resets(&node1), 1);

    deployment.teardown().await.unwrap();
}

/// Slow failure detection needs several polls before the layout moves.
#[tokio::test]
async fn lagging_detection_is_absorbed_by_polling() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    cluster.poller().wait_for_stable().await.unwrap();
    deployment.fabric.set_detection_lag(4);

    cluster.injector().kill(2).await.unwrap();
    let success = cluster.poller().wait_for_degraded().await.unwrap();
    assert!(success.attempts > 1);
    assert_eq!(success.snapshot.layout.unresponsive_servers.len(), 1);

    deployment.teardown().await.unwrap();
}

/// A management outage surfaces as a timeout carrying the last error.
#[tokio::test]
async fn management_outage_times_out_with_last_error() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    deployment.fabric.set_management_down(true);

    let poller = cluster
        .poller()
        .with_settings(PollSettings::new(Duration::from_millis(10), Duration::from_millis(100)));
    match poller.wait_for_stable().await.unwrap_err() {
        HarnessError::OperationTimeout {
            attempts,
            last_snapshot,
            last_error,
            ..
        } => {
            assert!(attempts >= 2);
            assert!(last_snapshot.is_none());
            assert!(last_error.unwrap().contains("down"));
        }
        other => panic!("unexpected error: {}", other),
    }

    deployment.fabric.set_management_down(false);
    cluster.poller().wait_for_stable().await.unwrap();
    deployment.teardown().await.unwrap();
}

/// A timed-out wait reports the last snapshot it saw.
#[tokio::test]
async fn unmet_condition_times_out_with_last_snapshot() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;

    let poller = cluster
        .poller()
        .with_settings(PollSettings::new(Duration::from_millis(10), Duration::from_millis(60)));
    match poller.wait_for_unavailable().await.unwrap_err() {
        HarnessError::OperationTimeout { last_snapshot, .. } => {
            assert_eq!(last_snapshot.unwrap().status.overall, ClusterStatus::Stable);
        }
        other => panic!("unexpected error: {}", other),
    }

    deployment.teardown().await.unwrap();
}

/// Cancelling a wait ends it promptly.
#[tokio::test]
async fn cancelled_wait_returns_early() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let token = CancellationToken::new();
    let poller = cluster.poller_with(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = poller.wait_for_unavailable().await.unwrap_err();
    assert!(matches!(err, HarnessError::Cancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    canceller.await.unwrap();

    deployment.teardown().await.unwrap();
}
