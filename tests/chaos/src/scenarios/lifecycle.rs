//! Deploy, bootstrap and teardown scenarios.

use std::io::Write;

use fault_harness::sim::{SimBackend, SimFabric, SimFlavor};
use fault_harness::{ClusterState, FixtureSpec, HarnessError};
use fault_types::{ClusterStatus, Reliability};

use crate::fixtures::{deploy_sim, deploy_sim_fixture, sim_fixture, sim_orchestrator};

/// Freshly deployed three-node cluster is stable on the first snapshot.
#[tokio::test]
async fn fresh_cluster_is_stable_without_retries() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    assert_eq!(cluster.state(), ClusterState::Ready);

    let success = cluster.poller().wait_for_stable().await.unwrap();
    assert_eq!(success.attempts, 1);
    assert_eq!(success.snapshot.layout.servers, cluster.endpoints());
    assert_eq!(success.snapshot.status.reliability, Reliability::StrongQuorum);

    deployment.teardown().await.unwrap();
}

/// Transient bootstrap rejections are absorbed by the bounded retry.
#[tokio::test]
async fn bootstrap_retries_within_bound() {
    let mut fixture = sim_fixture(3);
    fixture.bootstrap.retries = 4;

    let fabric = SimFabric::new();
    fabric.fail_bootstraps(3);
    let orchestrator = sim_orchestrator(&fabric, SimFlavor::Container);

    let mut cluster = orchestrator.deploy(&fixture).await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Ready);
    assert_eq!(fabric.bootstrap_attempts(), 4);

    orchestrator.teardown(&mut cluster).await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Destroyed);
}

/// Bootstrap failures past the bound abort and clean up the fleet.
#[tokio::test]
async fn bootstrap_exhaustion_aborts_deploy() {
    let fabric = SimFabric::new();
    fabric.fail_bootstraps(u32::MAX);
    let orchestrator = sim_orchestrator(&fabric, SimFlavor::Container);

    let err = orchestrator.deploy(&sim_fixture(3)).await.err().unwrap();
    assert!(matches!(err, HarnessError::BootstrapFailure { attempts: 5, .. }));
    assert_eq!(fabric.released(), 1);
    for i in 0..3 {
        assert!(fabric.is_destroyed(&SimBackend::endpoint(i, 9000)));
    }
}

/// A provisioning failure part-way through tears down what was created.
#[tokio::test]
async fn provision_failure_aborts_deploy() {
    let fabric = SimFabric::new();
    fabric.fail_provision(2);
    let orchestrator = sim_orchestrator(&fabric, SimFlavor::Container);

    let err = orchestrator.deploy(&sim_fixture(3)).await.err().unwrap();
    assert!(matches!(err, HarnessError::BackendUnavailable { .. }));
    assert!(fabric.is_destroyed(&SimBackend::endpoint(0, 9000)));
    assert!(fabric.is_destroyed(&SimBackend::endpoint(1, 9000)));
    assert_eq!(fabric.bootstrap_attempts(), 0);
    assert_eq!(fabric.released(), 1);
}

/// Status of a healthy cluster is reported consistently through the group.
#[tokio::test]
async fn group_accessors_agree() {
    let deployment = deploy_sim(4, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;

    assert_eq!(cluster.len(), 4);
    assert!(!cluster.is_empty());
    assert_eq!(cluster.fixture().node_count, 4);
    assert_eq!(cluster.status().await.unwrap().overall, ClusterStatus::Stable);
    assert_eq!(cluster.snapshot().await.unwrap().layout.epoch, 0);
    assert!(matches!(
        cluster.node(4),
        Err(HarnessError::NodeIndex { index: 4, len: 4 })
    ));

    deployment.teardown().await.unwrap();
}

/// A fixture file drives a whole deployment.
#[tokio::test]
async fn deploy_from_fixture_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
name = "file-backed"
node_count = 5

[backend]
kind = "simulated"
power_control = true

[poll]
interval_ms = 10
timeout_secs = 5
"#
    )
    .unwrap();

    let fixture = FixtureSpec::from_file(file.path()).unwrap();
    assert_eq!(fixture.name, "file-backed");

    let deployment = deploy_sim_fixture(&fixture).await.unwrap();
    assert_eq!(deployment.cluster.len(), 5);
    assert!(deployment.cluster.node(0).unwrap().power_control().is_some());
    deployment.cluster.poller().wait_for_stable().await.unwrap();
    deployment.teardown().await.unwrap();
}
