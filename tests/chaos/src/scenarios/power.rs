//! Power-cycle and parallel batch scenarios on VM-flavored nodes.

use std::time::Duration;

use fault_harness::sim::SimFlavor;
use fault_harness::{FaultOp, HarnessError, PowerState};
use fault_types::{ClusterStatus, NodeStatus, Reliability};

use crate::fixtures::deploy_sim;

/// Losing two of three servers leaves the cluster without quorum until they return.
#[tokio::test]
async fn power_off_majority_loses_quorum() {
    let deployment = deploy_sim(3, SimFlavor::VirtualMachine).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();

    let off = injector
        .apply_all(&[1, 2], FaultOp::PowerOff)
        .await
        .unwrap();
    assert!(off.all_succeeded());

    let success = poller.wait_for_unavailable().await.unwrap();
    assert_eq!(success.snapshot.status.reliability, Reliability::WeakNoQuorum);
    // No quorum, so the layout cannot move.
    assert_eq!(success.snapshot.layout.epoch, 0);
    assert_eq!(
        cluster.node(1).unwrap().commanded_status(),
        NodeStatus::PoweredOff
    );

    injector
        .apply_all(&[1, 2], FaultOp::PowerOn)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    injector
        .apply_all(&[1, 2], FaultOp::Start)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let stable = poller.wait_for_stable().await.unwrap();
    assert_eq!(stable.snapshot.status.reliability, Reliability::StrongQuorum);
    assert_eq!(stable.snapshot.layout.servers.len(), 3);

    deployment.teardown().await.unwrap();
}

/// Powering off one server degrades the cluster without losing quorum.
#[tokio::test]
async fn power_off_minority_degrades() {
    let deployment = deploy_sim(3, SimFlavor::VirtualMachine).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();
    let node0 = cluster.node(0).unwrap().id().clone();

    injector.power_off(0).await.unwrap();
    let power = cluster.node(0).unwrap().power_control().unwrap();
    assert_eq!(power.power_state().await.unwrap(), PowerState::Off);

    let degraded = poller.wait_for_degraded().await.unwrap();
    assert!(degraded.snapshot.layout.is_unresponsive(&node0));
    assert_eq!(degraded.snapshot.layout.epoch, 1);

    injector.power_on(0).await.unwrap();
    assert_eq!(
        cluster.node(0).unwrap().commanded_status(),
        NodeStatus::Stopped
    );
    injector.start(0).await.unwrap();
    poller.wait_for_responsive(&node0).await.unwrap();
    poller.wait_for_stable().await.unwrap();

    deployment.teardown().await.unwrap();
}

/// A power cycle wipes firewall state; a process restart on a VM does not.
#[tokio::test]
async fn reboot_clears_partition_but_restart_keeps_it() {
    let deployment = deploy_sim(3, SimFlavor::VirtualMachine).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();
    let poller = cluster.poller();

    injector.link_failure(2, 0).await.unwrap();
    poller.wait_for_unresponsive_count(1).await.unwrap();

    injector.restart(2).await.unwrap();
    assert_eq!(cluster.node(2).unwrap().disconnected_peers().len(), 1);

    injector.reboot(2).await.unwrap();
    assert!(cluster.node(2).unwrap().disconnected_peers().is_empty());
    assert_eq!(
        cluster.node(2).unwrap().commanded_status(),
        NodeStatus::Stopped
    );

    injector.start(2).await.unwrap();
    poller.wait_for_unresponsive_count(0).await.unwrap();
    poller.wait_for_stable().await.unwrap();

    deployment.teardown().await.unwrap();
}

/// A slow node times out alone; the rest of the batch still completes.
#[tokio::test]
async fn parallel_batch_reports_every_node() {
    let deployment = deploy_sim(5, SimFlavor::VirtualMachine).await.unwrap();
    let cluster = &deployment.cluster;
    let slow = cluster.node(3).unwrap().id().clone();
    let failing = cluster.node(1).unwrap().id().clone();
    deployment
        .fabric
        .set_latency(&slow, Duration::from_millis(500));
    deployment.fabric.fail_next(&failing, "power_off");

    let injector = cluster
        .injector()
        .with_call_timeout(Duration::from_millis(100));
    let report = injector.power_off_all().await.unwrap();

    assert_eq!(report.outcomes.len(), 5);
    assert_eq!(report.succeeded().len(), 3);
    let failed: Vec<usize> = report.failed().iter().map(|o| o.index).collect();
    assert_eq!(failed, vec![1, 3]);
    let timed_out = &report.outcomes[3];
    assert!(timed_out.result.as_ref().unwrap_err().to_string().contains("no response within"));

    // The late call was dropped before it took effect.
    assert_eq!(
        cluster.node(3).unwrap().commanded_status(),
        NodeStatus::Running
    );
    assert!(matches!(
        report.into_result(),
        Err(HarnessError::BackendUnavailable { .. })
    ));

    deployment.fabric.set_latency(&slow, Duration::ZERO);
    let on = injector.power_on_all().await.unwrap();
    assert!(on.all_succeeded());
    assert!(injector.start_all().await.unwrap().all_succeeded());
    cluster.poller().wait_for_stable().await.unwrap();

    deployment.teardown().await.unwrap();
}

/// Batches reject unknown indices before touching any node.
#[tokio::test]
async fn batch_with_bad_index_touches_nothing() {
    let deployment = deploy_sim(3, SimFlavor::VirtualMachine).await.unwrap();
    let cluster = &deployment.cluster;

    let err = cluster
        .injector()
        .apply_all(&[0, 7], FaultOp::PowerOff)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::NodeIndex { index: 7, len: 3 }));
    assert_eq!(
        cluster.node(0).unwrap().commanded_status(),
        NodeStatus::Running
    );

    deployment.teardown().await.unwrap();
}

/// Container nodes have no power control.
#[tokio::test]
async fn power_ops_unsupported_on_containers() {
    let deployment = deploy_sim(3, SimFlavor::Container).await.unwrap();
    let cluster = &deployment.cluster;
    let injector = cluster.injector();

    assert!(cluster.node(0).unwrap().power_control().is_none());
    assert!(matches!(
        injector.power_off(0).await,
        Err(HarnessError::Unsupported { capability: "power control", .. })
    ));

    let report = injector.power_off_all().await.unwrap();
    assert_eq!(report.failed().len(), 3);
    cluster.poller().wait_for_stable().await.unwrap();

    deployment.teardown().await.unwrap();
}
