//! Scenarios against real infrastructure.
//!
//! The fixture file is named by `FAULTLINE_FIXTURE`; see `tests/chaos/fixtures/`.
//! Every test tears its cluster down, and they share one daemon or lab, so
//! they run serially.
//!
//! Run: `cargo test -p chaos-tests real_backends -- --ignored`

// Helpers only used by #[ignore] tests
#![allow(dead_code, unused_imports)]

use std::path::PathBuf;

use fault_harness::{
    BackendSpec, ClusterGroup, ClusterOrchestrator, FaultOp, FixtureSpec, Symmetry,
};
use fault_types::Reliability;
use serial_test::serial;

use crate::fixtures::deploy_from_env;

fn bundled(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name)
}

async fn deploy() -> (ClusterOrchestrator, ClusterGroup) {
    let (orchestrator, cluster) = deploy_from_env().await.expect("deploy fixture");
    cluster
        .poller()
        .wait_for_stable()
        .await
        .expect("fresh cluster should be stable");
    (orchestrator, cluster)
}

async fn teardown(orchestrator: ClusterOrchestrator, mut cluster: ClusterGroup) {
    orchestrator
        .teardown(&mut cluster)
        .await
        .expect("teardown failed");
}

/// The fixture files shipped with the suite stay valid.
#[test]
fn bundled_fixtures_parse() {
    let docker = FixtureSpec::from_file(&bundled("docker-3.toml")).unwrap();
    assert!(matches!(docker.backend, BackendSpec::Docker(_)));
    assert_eq!(docker.node_count, 3);

    let vm = FixtureSpec::from_file(&bundled("vm-lab-3.toml")).unwrap();
    match &vm.backend {
        BackendSpec::Vm(spec) => assert_eq!(spec.vms.len(), vm.node_count),
        other => panic!("unexpected backend: {:?}", other),
    }
}

/// Partition and heal one container.
#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn docker_partition_one_node() {
    let (orchestrator, cluster) = deploy().await;
    let injector = cluster.injector();
    let poller = cluster.poller();
    let node0 = cluster.node(0).unwrap().id().clone();

    injector
        .disconnect(0, &[1, 2], Symmetry::Symmetric)
        .await
        .expect("disconnect failed");
    let success = poller
        .wait_for_unresponsive_count(1)
        .await
        .expect("node0 should be marked");
    assert!(success.snapshot.layout.is_unresponsive(&node0));

    injector
        .reconnect(0, &[1, 2], Symmetry::Symmetric)
        .await
        .expect("reconnect failed");
    poller
        .wait_for_unresponsive_count(0)
        .await
        .expect("cluster should heal");

    teardown(orchestrator, cluster).await;
}

/// Remove and re-add a container's member.
#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn docker_membership_round_trip() {
    let (orchestrator, cluster) = deploy().await;

    let removed = cluster.remove_node(2).await.expect("remove failed");
    assert_eq!(removed.servers.len(), 2);
    let added = cluster.add_node(2).await.expect("add failed");
    assert_eq!(added.servers.len(), 3);
    assert!(added.epoch > removed.epoch);
    cluster
        .poller()
        .wait_for_stable()
        .await
        .expect("cluster should be stable after re-add");

    teardown(orchestrator, cluster).await;
}

/// Kill a container's member and bring it back.
#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn docker_kill_and_restart() {
    let (orchestrator, cluster) = deploy().await;
    let injector = cluster.injector();
    let poller = cluster.poller();
    let node1 = cluster.node(1).unwrap().id().clone();

    injector.kill(1).await.expect("kill failed");
    poller
        .wait_for_unresponsive(&node1)
        .await
        .expect("killed node should be marked");

    injector.start(1).await.expect("start failed");
    poller
        .wait_for_responsive(&node1)
        .await
        .expect("restarted node should recover");

    teardown(orchestrator, cluster).await;
}

/// Restarting a paused container brings it back.
#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn docker_restart_paused_node() {
    let (orchestrator, cluster) = deploy().await;
    let injector = cluster.injector();
    let poller = cluster.poller();
    let node1 = cluster.node(1).unwrap().id().clone();

    injector.pause(1).await.expect("pause failed");
    poller
        .wait_for_unresponsive(&node1)
        .await
        .expect("paused node should be marked");

    injector.restart(1).await.expect("restart of paused node failed");
    poller
        .wait_for_responsive(&node1)
        .await
        .expect("restarted node should recover");
    poller
        .wait_for_stable()
        .await
        .expect("cluster should be stable after restart");

    teardown(orchestrator, cluster).await;
}

/// Power off two of three VMs, then recover.
#[tokio::test]
#[ignore = "requires vm lab"]
#[serial]
async fn vm_power_off_majority() {
    let (orchestrator, cluster) = deploy().await;
    let injector = cluster.injector();
    let poller = cluster.poller();

    injector
        .apply_all(&[1, 2], FaultOp::PowerOff)
        .await
        .expect("batch failed")
        .into_result()
        .expect("power off failed");
    let success = poller
        .wait_for_unavailable()
        .await
        .expect("cluster should lose quorum");
    assert_eq!(success.snapshot.status.reliability, Reliability::WeakNoQuorum);

    injector
        .apply_all(&[1, 2], FaultOp::PowerOn)
        .await
        .expect("batch failed")
        .into_result()
        .expect("power on failed");
    injector
        .apply_all(&[1, 2], FaultOp::Start)
        .await
        .expect("batch failed")
        .into_result()
        .expect("start failed");
    poller
        .wait_for_stable()
        .await
        .expect("cluster should recover");

    teardown(orchestrator, cluster).await;
}

/// Single link failure between two VMs.
#[tokio::test]
#[ignore = "requires vm lab"]
#[serial]
async fn vm_single_link_failure() {
    let (orchestrator, cluster) = deploy().await;
    let injector = cluster.injector();
    let poller = cluster.poller();

    injector.link_failure(0, 1).await.expect("link failure failed");
    poller
        .wait_for_unresponsive_count(1)
        .await
        .expect("one endpoint should be marked");

    injector.heal_link(0, 1).await.expect("heal failed");
    poller
        .wait_for_unresponsive_count(0)
        .await
        .expect("cluster should heal");

    teardown(orchestrator, cluster).await;
}
