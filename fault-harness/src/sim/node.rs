//! Simulated nodes and the backend that provisions them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fault_types::{NodeId, NodeStatus};

use super::SimFabric;
use crate::backend::DeploymentBackend;
use crate::config::{BackendSpec, FixtureSpec};
use crate::error::{HarnessError, Result};
use crate::node::{CommandedState, NodeHandle, NodeKind, PowerControl, PowerState};

/// Which real backend a simulated node imitates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFlavor {
    /// Firewall state is lost whenever the process restarts.
    Container,
    /// Firewall state survives process restarts; power control available.
    VirtualMachine,
}

/// [`DeploymentBackend`] provisioning [`SimNode`]s on a [`SimFabric`].
pub struct SimBackend {
    fabric: SimFabric,
    flavor: SimFlavor,
}

impl SimBackend {
    /// Backend over `fabric` producing nodes of `flavor`.
    pub fn new(fabric: SimFabric, flavor: SimFlavor) -> Self {
        Self { fabric, flavor }
    }

    /// Backend whose flavor follows a simulated fixture's `power_control` flag.
    pub fn for_fixture(fabric: SimFabric, fixture: &FixtureSpec) -> Self {
        let flavor = match &fixture.backend {
            BackendSpec::Simulated(sim) if sim.power_control => SimFlavor::VirtualMachine,
            _ => SimFlavor::Container,
        };
        Self::new(fabric, flavor)
    }

    /// Endpoint of node `index`.
    pub fn endpoint(index: usize, port: u16) -> NodeId {
        NodeId::from_parts(&format!("10.0.0.{}", 10 + index), port)
    }
}

#[async_trait]
impl DeploymentBackend for SimBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn prepare(&self, _fixture: &FixtureSpec) -> Result<()> {
        self.fabric.lock().prepared += 1;
        Ok(())
    }

    async fn provision(&self, index: usize, fixture: &FixtureSpec) -> Result<Arc<dyn NodeHandle>> {
        let id = Self::endpoint(index, fixture.backend.member_port());
        if self.fabric.lock().fail_provision.contains(&index) {
            return Err(HarnessError::backend(&id, "provision", "injected provisioning failure"));
        }
        self.fabric.register(&id);
        tracing::debug!(node = %id, "provisioned simulated node");
        Ok(Arc::new(SimNode::new(id, self.fabric.clone(), self.flavor)))
    }

    async fn release(&self) -> Result<()> {
        self.fabric.lock().released += 1;
        Ok(())
    }
}

/// In-memory [`NodeHandle`].
pub struct SimNode {
    id: NodeId,
    fabric: SimFabric,
    flavor: SimFlavor,
    state: CommandedState,
}

impl SimNode {
    /// Handle for an already registered node.
    pub fn new(id: NodeId, fabric: SimFabric, flavor: SimFlavor) -> Self {
        Self {
            id,
            fabric,
            flavor,
            state: CommandedState::new(NodeStatus::Running),
        }
    }

    /// Simulated control-plane round trip.
    async fn control(&self, operation: &'static str) -> Result<()> {
        let latency = self.fabric.latency_of(&self.id);
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        if self.fabric.take_failure(&self.id, operation) {
            return Err(HarnessError::backend(&self.id, operation, "injected control-plane failure"));
        }
        Ok(())
    }

    fn physical_status(&self) -> NodeStatus {
        self.fabric.status_of(&self.id).unwrap_or(NodeStatus::Stopped)
    }

    fn set_physical(&self, status: NodeStatus) {
        self.fabric.update(&self.id, |m| m.status = status);
    }

    fn clear_blocks(&self) {
        self.fabric.update(&self.id, |m| m.blocked.clear());
        self.state.clear_peers();
    }

    fn powered_off(&self) -> bool {
        self.fabric
            .lock()
            .members
            .get(&self.id)
            .map_or(false, |m| m.power == PowerState::Off)
    }
}

#[async_trait]
impl NodeHandle for SimNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Simulated
    }

    fn commanded_status(&self) -> NodeStatus {
        self.state.status()
    }

    fn disconnected_peers(&self) -> BTreeSet<NodeId> {
        self.state.peers()
    }

    async fn start(&self) -> Result<()> {
        self.control("start").await?;
        if self.powered_off() {
            self.fabric.update(&self.id, |m| m.power = PowerState::On);
            self.clear_blocks();
        }
        let physical = self.physical_status();
        if !physical.is_live() && physical != NodeStatus::Paused && self.flavor == SimFlavor::Container
        {
            self.clear_blocks();
        }
        self.set_physical(NodeStatus::Running);
        self.state.set_status(NodeStatus::Running);
        Ok(())
    }

    async fn stop(&self, _grace: Duration) -> Result<()> {
        self.control("stop").await?;
        if self.physical_status() != NodeStatus::Killed {
            self.set_physical(NodeStatus::Stopped);
            if self.state.status() != NodeStatus::PoweredOff {
                self.state.set_status(NodeStatus::Stopped);
            }
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.control("kill").await?;
        if self.physical_status().is_live() || self.physical_status() == NodeStatus::Paused {
            self.set_physical(NodeStatus::Killed);
            self.state.set_status(NodeStatus::Killed);
        }
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.control("pause").await?;
        let physical = self.physical_status();
        if physical == NodeStatus::Paused {
            return Ok(());
        }
        if !physical.is_live() || self.powered_off() {
            return Err(HarnessError::InvalidState {
                expected: "running node".into(),
                actual: self.state.status().to_string(),
            });
        }
        self.set_physical(NodeStatus::Paused);
        self.state.set_status(NodeStatus::Paused);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.control("resume").await?;
        if self.physical_status() == NodeStatus::Paused {
            self.set_physical(NodeStatus::Running);
            self.state.set_status(NodeStatus::Running);
        }
        Ok(())
    }

    async fn disconnect(&self, peers: &[NodeId]) -> Result<()> {
        self.control("disconnect").await?;
        for peer in self.state.not_blocked(peers) {
            if peer == self.id {
                continue;
            }
            self.fabric.update(&self.id, |m| {
                m.blocked.insert(peer.clone());
            });
            self.state.add_peer(peer);
        }
        Ok(())
    }

    async fn reconnect(&self, peers: &[NodeId]) -> Result<()> {
        self.control("reconnect").await?;
        for peer in peers {
            self.fabric.update(&self.id, |m| {
                m.blocked.remove(peer);
            });
            self.state.remove_peer(peer);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.control("destroy").await?;
        self.fabric.update(&self.id, |m| {
            m.destroyed = true;
            m.blocked.clear();
        });
        self.state.clear_peers();
        self.state.set_status(NodeStatus::Stopped);
        Ok(())
    }

    fn power_control(&self) -> Option<&dyn PowerControl> {
        match self.flavor {
            SimFlavor::VirtualMachine => Some(self),
            SimFlavor::Container => None,
        }
    }
}

#[async_trait]
impl PowerControl for SimNode {
    async fn power_off(&self) -> Result<()> {
        self.control("power_off").await?;
        self.fabric.update(&self.id, |m| {
            m.power = PowerState::Off;
            m.status = NodeStatus::Stopped;
        });
        self.clear_blocks();
        self.state.set_status(NodeStatus::PoweredOff);
        Ok(())
    }

    async fn power_on(&self) -> Result<()> {
        self.control("power_on").await?;
        if self.powered_off() {
            self.fabric.update(&self.id, |m| m.power = PowerState::On);
        }
        if self.state.status() == NodeStatus::PoweredOff {
            self.state.set_status(NodeStatus::Stopped);
        }
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.control("reboot").await?;
        self.fabric.update(&self.id, |m| {
            m.power = PowerState::On;
            m.status = NodeStatus::Stopped;
        });
        self.clear_blocks();
        self.state.set_status(NodeStatus::Stopped);
        Ok(())
    }

    async fn power_state(&self) -> Result<PowerState> {
        self.control("power_state").await?;
        Ok(if self.powered_off() {
            PowerState::Off
        } else {
            PowerState::On
        })
    }
}
