//! A deployed cluster under test.

use std::sync::Arc;

use fault_types::{ClusterSnapshot, ClusterStatusReport, Layout, NodeId};
use tokio_util::sync::CancellationToken;

use crate::config::FixtureSpec;
use crate::error::{HarnessError, Result};
use crate::injector::FailureInjector;
use crate::lifecycle::{ClusterLifecycle, ClusterState};
use crate::management::{ManagementClient, ManagementError};
use crate::node::NodeHandle;
use crate::poller::{ConditionPoller, PollSettings};

/// Nodes, management client and lifecycle of one deployment.
///
/// Built by [`ClusterOrchestrator::deploy`](crate::ClusterOrchestrator::deploy)
/// and released by
/// [`ClusterOrchestrator::teardown`](crate::ClusterOrchestrator::teardown).
pub struct ClusterGroup {
    fixture: FixtureSpec,
    nodes: Vec<Arc<dyn NodeHandle>>,
    management: Arc<dyn ManagementClient>,
    lifecycle: ClusterLifecycle,
}

impl ClusterGroup {
    pub(crate) fn new(
        fixture: FixtureSpec,
        nodes: Vec<Arc<dyn NodeHandle>>,
        management: Arc<dyn ManagementClient>,
        lifecycle: ClusterLifecycle,
    ) -> Self {
        Self {
            fixture,
            nodes,
            management,
            lifecycle,
        }
    }

    /// Node at `index`.
    pub fn node(&self, index: usize) -> Result<&Arc<dyn NodeHandle>> {
        self.nodes.get(index).ok_or(HarnessError::NodeIndex {
            index,
            len: self.nodes.len(),
        })
    }

    /// Every node, in index order.
    pub fn all_nodes(&self) -> &[Arc<dyn NodeHandle>] {
        &self.nodes
    }

    /// Number of provisioned nodes (not layout servers).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node was provisioned.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node endpoints, in index order.
    pub fn endpoints(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id().clone()).collect()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ClusterState {
        self.lifecycle.state()
    }

    pub(crate) fn lifecycle_mut(&mut self) -> &mut ClusterLifecycle {
        &mut self.lifecycle
    }

    /// Fixture the cluster was deployed from.
    pub fn fixture(&self) -> &FixtureSpec {
        &self.fixture
    }

    /// Management client for the cluster.
    pub fn management(&self) -> Arc<dyn ManagementClient> {
        self.management.clone()
    }

    /// Fresh layout (cache invalidated first).
    pub async fn layout(&self) -> Result<Layout> {
        self.management.invalidate_layout_cache();
        Ok(self.management.get_layout().await?)
    }

    /// Current status report.
    pub async fn status(&self) -> Result<ClusterStatusReport> {
        Ok(self.management.get_cluster_status().await?)
    }

    /// Fresh layout and status together.
    pub async fn snapshot(&self) -> Result<ClusterSnapshot> {
        Ok(self.poller().snapshot().await?)
    }

    /// Fault injector over this cluster's nodes.
    pub fn injector(&self) -> FailureInjector {
        FailureInjector::new(self.nodes.clone(), &self.fixture.faults)
    }

    /// Poller with the fixture's poll settings.
    pub fn poller(&self) -> ConditionPoller {
        ConditionPoller::new(self.management.clone(), PollSettings::from(&self.fixture.poll))
    }

    /// Poller whose waits abort when `token` is cancelled.
    pub fn poller_with(&self, token: CancellationToken) -> ConditionPoller {
        self.poller().with_cancellation(token)
    }

    /// Add node `index` to the layout and verify it appears.
    pub async fn add_node(&self, index: usize) -> Result<Layout> {
        self.lifecycle.require(ClusterState::Ready)?;
        let node = self.node(index)?.id().clone();
        let membership = &self.fixture.membership;
        tracing::info!(%node, "adding node to layout");

        let call = self
            .management
            .add_node(
                &node,
                membership.retries,
                membership.timeout(),
                membership.poll_period(),
            )
            .await;
        self.verify("add", &node, call, |layout| layout.contains(&node))
            .await
    }

    /// Remove node `index` from the layout and verify it is gone.
    pub async fn remove_node(&self, index: usize) -> Result<Layout> {
        self.lifecycle.require(ClusterState::Ready)?;
        let node = self.node(index)?.id().clone();
        let membership = &self.fixture.membership;
        tracing::info!(%node, "removing node from layout");

        let call = self
            .management
            .remove_node(
                &node,
                membership.retries,
                membership.timeout(),
                membership.poll_period(),
            )
            .await;
        self.verify("remove", &node, call, |layout| !layout.contains(&node))
            .await
    }

    /// Reset node `index`'s local state through the management API.
    pub async fn reset_node(&self, index: usize) -> Result<()> {
        self.lifecycle.require(ClusterState::Ready)?;
        let node = self.node(index)?.id().clone();
        tracing::info!(%node, "resetting node");
        Ok(self.management.reset(&node).await?)
    }

    /// Re-fetch the layout and check the membership change really happened.
    async fn verify(
        &self,
        operation: &'static str,
        node: &NodeId,
        call: std::result::Result<(), ManagementError>,
        expected: impl Fn(&Layout) -> bool,
    ) -> Result<Layout> {
        self.management.invalidate_layout_cache();
        let observed = self.management.get_layout().await;

        let detail = match (&call, &observed) {
            (Err(e), _) => e.to_string(),
            (Ok(()), Err(e)) => format!("layout re-fetch failed: {}", e),
            (Ok(()), Ok(layout)) if expected(layout) => {
                tracing::info!(%node, operation, epoch = layout.epoch, "membership change verified");
                return Ok(layout.clone());
            }
            (Ok(()), Ok(layout)) => format!(
                "call succeeded but layout epoch {} does not reflect it",
                layout.epoch
            ),
        };

        tracing::warn!(%node, operation, %detail, "membership change failed");
        Err(HarnessError::MembershipOperationFailure {
            operation,
            node: node.clone(),
            observed: observed.ok().map(Box::new),
            detail,
        })
    }
}
