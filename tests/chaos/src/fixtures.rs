//! Deployment helpers shared by the scenarios.

use std::sync::Arc;
use std::time::Duration;

use fault_harness::config::SimSpec;
use fault_harness::sim::{SimBackend, SimCluster, SimFabric, SimFlavor};
use fault_harness::{
    backend, BackendSpec, ClusterGroup, ClusterOrchestrator, FixtureSpec, HttpConnector,
    PollSettings, Result,
};

/// Environment variable naming a fixture file for real-backend scenarios.
pub const FIXTURE_ENV: &str = "FAULTLINE_FIXTURE";

/// A simulated cluster plus the handles a scenario needs to drive it.
pub struct SimDeployment {
    /// Shared simulated world, for injecting control-plane faults.
    pub fabric: SimFabric,
    /// Orchestrator that deployed the cluster.
    pub orchestrator: ClusterOrchestrator,
    /// The deployed cluster.
    pub cluster: ClusterGroup,
}

impl SimDeployment {
    /// Tear the cluster down.
    pub async fn teardown(mut self) -> Result<()> {
        self.orchestrator.teardown(&mut self.cluster).await
    }
}

/// Simulated fixture with short poll settings.
pub fn sim_fixture(node_count: usize) -> FixtureSpec {
    let mut fixture = FixtureSpec::simulated(node_count);
    fixture.name = format!("sim-{}", node_count);
    fixture.poll.interval_ms = 10;
    fixture.poll.timeout_secs = 5;
    fixture.bootstrap.backoff_ms = 10;
    fixture
}

/// Poll settings matching [`sim_fixture`].
pub fn fast_poll() -> PollSettings {
    PollSettings::new(Duration::from_millis(10), Duration::from_secs(5))
}

/// Orchestrator over `fabric` producing nodes of `flavor`.
pub fn sim_orchestrator(fabric: &SimFabric, flavor: SimFlavor) -> ClusterOrchestrator {
    ClusterOrchestrator::new(
        Arc::new(SimBackend::new(fabric.clone(), flavor)),
        Arc::new(SimCluster::new(fabric.clone())),
    )
}

/// Deploy `fixture` on a fresh simulated fabric.
///
/// VM-flavored nodes are used when the fixture enables power control.
pub async fn deploy_sim_fixture(fixture: &FixtureSpec) -> Result<SimDeployment> {
    fault_harness::logging::init();
    let fabric = SimFabric::new();
    let orchestrator = ClusterOrchestrator::new(
        Arc::new(SimBackend::for_fixture(fabric.clone(), fixture)),
        Arc::new(SimCluster::new(fabric.clone())),
    );
    let cluster = orchestrator.deploy(fixture).await?;
    Ok(SimDeployment {
        fabric,
        orchestrator,
        cluster,
    })
}

/// Deploy `node_count` simulated nodes of `flavor`.
pub async fn deploy_sim(node_count: usize, flavor: SimFlavor) -> Result<SimDeployment> {
    let mut fixture = sim_fixture(node_count);
    fixture.backend = BackendSpec::Simulated(SimSpec {
        power_control: flavor == SimFlavor::VirtualMachine,
        member_port: fixture.backend.member_port(),
    });
    deploy_sim_fixture(&fixture).await
}

/// Deploy the fixture named by `FAULTLINE_FIXTURE` on its real backend.
pub async fn deploy_from_env() -> Result<(ClusterOrchestrator, ClusterGroup)> {
    fault_harness::logging::init();
    let path = std::env::var(FIXTURE_ENV).map_err(|_| {
        fault_harness::ConfigError::Invalid(format!("{} is not set", FIXTURE_ENV))
    })?;
    let fixture = FixtureSpec::from_file(path.as_ref())?;
    let orchestrator = ClusterOrchestrator::new(backend::from_fixture(&fixture)?, Arc::new(HttpConnector));
    let cluster = orchestrator.deploy(&fixture).await?;
    Ok((orchestrator, cluster))
}
