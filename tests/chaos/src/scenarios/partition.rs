//! Partition, link-failure and rotation scenarios.
//!
//! Every fault is healed at the end of the test and the cluster is expected
//! to converge back to zero unresponsive servers.

use fault_harness::sim::SimFlavor;
use fault_harness::{LinkRotation, Symmetry};
use fault_types::{ClusterStatus, NodeStatus};

use crate::fixtures::deploy_sim;

/// Isolating node0 from its two peers marks exactly node0.
#[tokio::test]
async fn isolate_one_node_of_three() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();
    let node0 = cluster.node(0).unwrap().id().clone();

    injector
        .disconnect(0, &[1, 2], Symmetry::Symmetric)
        .await
        .unwrap();
    let success = poller.wait_for_unresponsive_count(1).await.unwrap();
    let layout = &success.snapshot.layout;
    assert_eq!(layout.unresponsive_servers.len(), 1);
    assert!(layout.is_unresponsive(&node0));
    assert_eq!(layout.epoch, 1);
    assert_eq!(success.snapshot.status.overall, ClusterStatus::Degraded);

    injector
        .reconnect(0, &[1, 2], Symmetry::Symmetric)
        .await
        .unwrap();
    let healed = poller.wait_for_unresponsive_count(0).await.unwrap();
    assert_eq!(healed.snapshot.layout.epoch, 2);
    poller.wait_for_stable().await.unwrap();

    deployment.teardown().await.unwrap();
}

/// Each node in turn: partition, detect, heal, recover.
#[tokio::test]
async fn partition_and_heal_each_node() {
    let deployment = deploy_sim(5, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();

    for index in 0..cluster.len() {
        let id = cluster.node(index).unwrap().id().clone();

        injector.partition(index).await.unwrap();
        let down = poller.wait_for_unresponsive(&id).await.unwrap();
        assert_eq!(down.snapshot.layout.unresponsive_servers.len(), 1);

        injector.heal(index).await.unwrap();
        poller.wait_for_responsive(&id).await.unwrap();
        poller.wait_for_unresponsive_count(0).await.unwrap();
        assert!(cluster.node(index).unwrap().disconnected_peers().is_empty());
    }

    deployment.teardown().await.unwrap();
}

/// A single broken link marks its larger endpoint, every time.
#[tokio::test]
async fn single_link_failure_marks_larger_endpoint() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();
    let node1 = cluster.node(1).unwrap().id().clone();

    for _ in 0..3 {
        injector.link_failure(0, 1).await.unwrap();
        let success = poller.wait_for_unresponsive_count(1).await.unwrap();
        assert!(success.snapshot.layout.is_unresponsive(&node1));

        injector.heal_link(0, 1).await.unwrap();
        poller.wait_for_unresponsive_count(0).await.unwrap();
    }

    deployment.teardown().await.unwrap();
}

/// Reconnecting peers that were never disconnected changes nothing.
#[tokio::test]
async fn reconnect_and_start_are_idempotent() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let before = cluster.snapshot().await.unwrap().layout.epoch;

    injector
        .reconnect(0, &[1, 2], Symmetry::Symmetric)
        .await
        .unwrap();
    injector.start(1).await.unwrap();
    injector.start(1).await.unwrap();

    let after = cluster.poller().wait_for_stable().await.unwrap();
    assert_eq!(after.snapshot.layout.epoch, before);
    assert_eq!(
        cluster.node(1).unwrap().commanded_status(),
        NodeStatus::Running
    );

    deployment.teardown().await.unwrap();
}

/// Disconnecting the same peers twice records them once.
#[tokio::test]
async fn repeated_disconnect_tracks_peers_once() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();

    injector.disconnect(0, &[1], Symmetry::OneWay).await.unwrap();
    injector.disconnect(0, &[1, 2], Symmetry::OneWay).await.unwrap();
    assert_eq!(cluster.node(0).unwrap().disconnected_peers().len(), 2);
    assert_eq!(deployment.fabric.blocked_by(cluster.node(0).unwrap().id()).len(), 2);

    injector.reconnect(0, &[1, 2], Symmetry::OneWay).await.unwrap();
    assert!(cluster.node(0).unwrap().disconnected_peers().is_empty());
    cluster.poller().wait_for_unresponsive_count(0).await.unwrap();

    deployment.teardown().await.unwrap();
}

/// Restarting a container drops its firewall rules.
#[tokio::test]
async fn container_restart_clears_partition() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();

    injector.partition(2).await.unwrap();
    poller.wait_for_unresponsive_count(1).await.unwrap();

    injector.stop(2).await.unwrap();
    injector.start(2).await.unwrap();
    assert!(cluster.node(2).unwrap().disconnected_peers().is_empty());

    // Peers still hold their own rules against node2.
    injector.heal(2).await.unwrap();
    poller.wait_for_unresponsive_count(0).await.unwrap();

    deployment.teardown().await.unwrap();
}

/// Rotating a single broken link around a ring keeps one node marked.
#[tokio::test]
async fn ring_rotation_keeps_one_unresponsive() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();
    let ids = cluster.endpoints();

    let mut rotation = LinkRotation::ring(3);
    for _ in 0..6 {
        let (a, b) = rotation.next_step(&injector).await.unwrap().unwrap();
        let loser = if ids[a] > ids[b] { &ids[a] } else { &ids[b] };
        let success = poller
            .wait_for_layout("single marked loser", |layout| {
                layout.unresponsive_servers.len() == 1 && layout.is_unresponsive(loser)
            })
            .await
            .unwrap();
        assert_eq!(success.snapshot.status.overall, ClusterStatus::Degraded);
    }

    rotation.finish(&injector).await.unwrap();
    assert!(rotation.active().is_none());
    poller.wait_for_unresponsive_count(0).await.unwrap();

    deployment.teardown().await.unwrap();
}

/// Paused nodes are detected and come back on resume.
#[tokio::test]
async fn pause_and_resume() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();
    let node2 = cluster.node(2).unwrap().id().clone();

    injector.pause(2).await.unwrap();
    poller.wait_for_unresponsive(&node2).await.unwrap();

    injector.resume(2).await.unwrap();
    poller.wait_for_responsive(&node2).await.unwrap();
    poller.wait_for_stable().await.unwrap();

    deployment.teardown().await.unwrap();
}
