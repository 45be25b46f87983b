//! Deployment backends.
//!
//! A [`DeploymentBackend`] turns one slot of a [`FixtureSpec`] into a running
//! [`NodeHandle`]. Scenario code never sees the concrete backend type.

pub mod docker;
pub mod hypervisor;
pub mod vm;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BackendSpec, ConfigError, FixtureSpec};
use crate::error::Result;
use crate::node::NodeHandle;

pub use docker::{DockerBackend, DockerNode};
pub use hypervisor::{HypervisorClient, HypervisorError};
pub use vm::{VmBackend, VmNode};

/// Provisions and releases cluster members on one kind of infrastructure.
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Create shared resources (networks) before any node is provisioned.
    async fn prepare(&self, fixture: &FixtureSpec) -> Result<()>;

    /// Create and start node `index`, returning its handle.
    async fn provision(&self, index: usize, fixture: &FixtureSpec) -> Result<Arc<dyn NodeHandle>>;

    /// Release shared resources after every node has been destroyed.
    async fn release(&self) -> Result<()>;
}

/// Build the backend a fixture asks for.
///
/// Simulated fixtures are rejected: a [`SimBackend`](crate::sim::SimBackend)
/// must be built around a [`SimFabric`](crate::sim::SimFabric) the test holds.
pub fn from_fixture(fixture: &FixtureSpec) -> Result<Arc<dyn DeploymentBackend>> {
    match &fixture.backend {
        BackendSpec::Docker(_) => Ok(Arc::new(DockerBackend::connect(&fixture.name)?)),
        BackendSpec::Vm(spec) => Ok(Arc::new(VmBackend::new(spec)?)),
        BackendSpec::Simulated(_) => Err(ConfigError::Invalid(
            "simulated fixtures need a SimBackend built from a SimFabric".into(),
        )
        .into()),
    }
}
