//! Deploy and tear down clusters.
//!
//! # Design
//!
//! Deployment walks `Undeployed → Deploying → Bootstrapping → Ready`.
//! A node that fails to provision aborts the whole deployment and everything
//! already created is destroyed. Bootstrap is the one step retried
//! automatically, with a small fixed bound and fixed backoff; running out of
//! attempts is fatal to the deployment.
//!
//! Teardown destroys every node even if some fail, then releases the
//! backend's shared resources and reports the first failure.

use std::sync::Arc;

use fault_types::Layout;

use crate::backend::DeploymentBackend;
use crate::cluster::ClusterGroup;
use crate::config::FixtureSpec;
use crate::error::{HarnessError, Result};
use crate::lifecycle::{ClusterLifecycle, ClusterState};
use crate::management::{ManagementClient, ManagementConnector};
use crate::node::NodeHandle;

/// Deploys fixtures on a backend and connects them to a management API.
pub struct ClusterOrchestrator {
    backend: Arc<dyn DeploymentBackend>,
    connector: Arc<dyn ManagementConnector>,
}

impl ClusterOrchestrator {
    /// Orchestrator over `backend`, reaching clusters through `connector`.
    pub fn new(backend: Arc<dyn DeploymentBackend>, connector: Arc<dyn ManagementConnector>) -> Self {
        Self { backend, connector }
    }

    /// Provision, bootstrap and return a `Ready` cluster.
    ///
    /// # Errors
    ///
    /// Configuration errors, the first provisioning failure, or
    /// [`HarnessError::BootstrapFailure`]. Nothing is left running on error.
    pub async fn deploy(&self, fixture: &FixtureSpec) -> Result<ClusterGroup> {
        fixture.validate()?;
        let mut lifecycle = ClusterLifecycle::new();
        lifecycle.advance(ClusterState::Deploying)?;
        tracing::info!(
            fixture = %fixture.name,
            backend = self.backend.name(),
            nodes = fixture.node_count,
            "deploying cluster"
        );

        if let Err(e) = self.backend.prepare(fixture).await {
            tracing::error!(error = %e, "backend prepare failed");
            self.abort(&mut lifecycle, &[]).await;
            return Err(e);
        }

        let mut nodes: Vec<Arc<dyn NodeHandle>> = Vec::with_capacity(fixture.node_count);
        for index in 0..fixture.node_count {
            match self.backend.provision(index, fixture).await {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    tracing::error!(index, error = %e, "provisioning failed, aborting deployment");
                    self.abort(&mut lifecycle, &nodes).await;
                    return Err(e);
                }
            }
        }

        lifecycle.advance(ClusterState::Bootstrapping)?;
        let endpoints: Vec<_> = nodes.iter().map(|n| n.id().clone()).collect();

        let management = match self.connector.connect(&endpoints) {
            Ok(client) => client,
            Err(e) => {
                self.abort(&mut lifecycle, &nodes).await;
                return Err(e.into());
            }
        };

        let layout = Layout::initial(&endpoints);
        if let Err(e) = self.bootstrap(management.as_ref(), &layout, fixture).await {
            self.abort(&mut lifecycle, &nodes).await;
            return Err(e);
        }

        lifecycle.advance(ClusterState::Ready)?;
        tracing::info!(
            fixture = %fixture.name,
            cluster_id = %layout.cluster_id,
            "cluster ready"
        );
        Ok(ClusterGroup::new(fixture.clone(), nodes, management, lifecycle))
    }

    async fn bootstrap(
        &self,
        management: &dyn ManagementClient,
        layout: &Layout,
        fixture: &FixtureSpec,
    ) -> Result<()> {
        let attempts = fixture.bootstrap.retries;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match management.bootstrap(layout).await {
                Ok(()) => {
                    tracing::info!(attempt, servers = layout.servers.len(), "bootstrapped layout");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "bootstrap attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(fixture.bootstrap.backoff()).await;
                    }
                }
            }
        }

        Err(HarnessError::BootstrapFailure {
            attempts,
            last_error,
        })
    }

    /// Best-effort cleanup of a failed deployment.
    async fn abort(&self, lifecycle: &mut ClusterLifecycle, nodes: &[Arc<dyn NodeHandle>]) {
        if let Err(e) = lifecycle.advance(ClusterState::TearingDown) {
            tracing::error!(error = %e, "abort from unexpected state");
        }
        for node in nodes {
            if let Err(e) = node.destroy().await {
                tracing::warn!(node = %node.id(), error = %e, "cleanup failed");
            }
        }
        if let Err(e) = self.backend.release().await {
            tracing::warn!(error = %e, "backend release failed during cleanup");
        }
        if let Err(e) = lifecycle.advance(ClusterState::Destroyed) {
            tracing::error!(error = %e, "abort could not finish teardown");
        }
    }

    /// Destroy every node and release backend resources.
    ///
    /// With `keep_on_teardown` set, nothing is touched and the cluster stays
    /// `Ready` for inspection.
    pub async fn teardown(&self, group: &mut ClusterGroup) -> Result<()> {
        group.lifecycle_mut().require(ClusterState::Ready)?;
        if group.fixture().keep_on_teardown {
            tracing::info!(
                fixture = %group.fixture().name,
                endpoints = ?group.endpoints(),
                "keep_on_teardown set, leaving cluster running"
            );
            return Ok(());
        }

        group.lifecycle_mut().advance(ClusterState::TearingDown)?;
        tracing::info!(fixture = %group.fixture().name, "tearing down cluster");

        let mut first_error: Option<HarnessError> = None;
        for node in group.all_nodes() {
            if let Err(e) = node.destroy().await {
                tracing::error!(node = %node.id(), error = %e, "destroy failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.backend.release().await {
            tracing::error!(error = %e, "backend release failed");
            first_error.get_or_insert(e);
        }

        group.lifecycle_mut().advance(ClusterState::Destroyed)?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
