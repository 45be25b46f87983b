//! Virtual machine backend: hypervisor power control plus SSH.
//!
//! VMs are pre-existing lab machines listed in the fixture. The harness never
//! creates or deletes them; it powers them on, drives the member process over
//! SSH with the fixture's shell commands, and installs iptables rules for
//! link failures.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fault_types::{NodeId, NodeStatus};
use tokio::time::Instant;

use super::hypervisor::{HypervisorClient, HypervisorError};
use super::DeploymentBackend;
use crate::config::{BackendSpec, ConfigError, FixtureSpec, ProcessConfig, VmEntry, VmSpec};
use crate::error::{HarnessError, Result};
use crate::iptables;
use crate::node::{CommandedState, NodeHandle, NodeKind, PowerControl, PowerState};
use crate::ssh::{SshError, SshTarget};

/// Interval between `status` checks while waiting for a process to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between SSH readiness checks while a VM boots.
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Hypervisor-backed [`DeploymentBackend`].
pub struct VmBackend {
    hypervisor: Arc<HypervisorClient>,
    spec: VmSpec,
}

impl VmBackend {
    /// Build the backend, reading the hypervisor password from the
    /// environment variable named in the fixture.
    pub fn new(spec: &VmSpec) -> Result<Self> {
        let password = std::env::var(&spec.hypervisor.password_env).map_err(|_| {
            ConfigError::Invalid(format!(
                "hypervisor password variable {} is not set",
                spec.hypervisor.password_env
            ))
        })?;
        let hypervisor = HypervisorClient::new(&spec.hypervisor, password)
            .map_err(|e| HarnessError::backend("fleet", "hypervisor client", e))?;
        Ok(Self {
            hypervisor: Arc::new(hypervisor),
            spec: spec.clone(),
        })
    }

    fn entry(&self, index: usize) -> Result<&VmEntry> {
        self.spec.vms.get(index).ok_or(HarnessError::NodeIndex {
            index,
            len: self.spec.vms.len(),
        })
    }
}

#[async_trait]
impl DeploymentBackend for VmBackend {
    fn name(&self) -> &str {
        "vm"
    }

    async fn prepare(&self, fixture: &FixtureSpec) -> Result<()> {
        if !matches!(fixture.backend, BackendSpec::Vm(_)) {
            return Err(ConfigError::Invalid("vm backend needs a vm fixture".into()).into());
        }
        tracing::info!(
            hypervisor = %self.hypervisor.base_url(),
            vms = self.spec.vms.len(),
            "using vm lab"
        );
        Ok(())
    }

    async fn provision(&self, index: usize, _fixture: &FixtureSpec) -> Result<Arc<dyn NodeHandle>> {
        let entry = self.entry(index)?;
        let node = VmNode::new(
            entry,
            &self.spec,
            self.hypervisor.clone(),
            NodeStatus::Stopped,
        );

        node.ensure_powered_on("provision").await?;
        node.start().await?;

        tracing::info!(node = %node.id(), vm = %entry.name, "provisioned vm node");
        Ok(Arc::new(node))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// A cluster member running on a virtual machine.
pub struct VmNode {
    vm: String,
    id: NodeId,
    ssh: SshTarget,
    process: ProcessConfig,
    boot_timeout: Duration,
    hypervisor: Arc<HypervisorClient>,
    state: CommandedState,
}

impl VmNode {
    /// Handle for the VM described by `entry`.
    pub fn new(
        entry: &VmEntry,
        spec: &VmSpec,
        hypervisor: Arc<HypervisorClient>,
        status: NodeStatus,
    ) -> Self {
        Self {
            vm: entry.name.clone(),
            id: NodeId::from_parts(&entry.host, spec.member_port),
            ssh: SshTarget::new(
                &entry.host,
                &entry.ssh_user,
                entry.ssh_port,
                Duration::from_secs(spec.ssh_timeout_secs),
            ),
            process: spec.process.clone(),
            boot_timeout: Duration::from_secs(spec.boot_timeout_secs),
            hypervisor,
            state: CommandedState::new(status),
        }
    }

    /// Hypervisor identifier of the VM.
    pub fn vm(&self) -> &str {
        &self.vm
    }

    fn sudo(&self) -> bool {
        self.ssh.user != "root"
    }

    fn ssh_err(&self, operation: &'static str) -> impl Fn(SshError) -> HarnessError + '_ {
        move |e| HarnessError::backend(&self.id, operation, e)
    }

    fn hv_err(&self, operation: &'static str) -> impl Fn(HypervisorError) -> HarnessError + '_ {
        move |e| HarnessError::backend(&self.id, operation, e)
    }

    async fn process_running(&self, operation: &'static str) -> Result<bool> {
        let result = self
            .ssh
            .exec(&self.process.status)
            .await
            .map_err(self.ssh_err(operation))?;
        Ok(result.success())
    }

    async fn run(&self, cmd: &str, operation: &'static str) -> Result<()> {
        self.ssh.exec_ok(cmd).await.map_err(self.ssh_err(operation))?;
        Ok(())
    }

    fn signal_script(&self, signal: &str) -> String {
        let prefix = if self.sudo() { "sudo " } else { "" };
        // pkill exits 1 when nothing matched; a missing process is not an error here.
        format!(
            "{}pkill -{} -f '{}'; test $? -le 1",
            prefix, signal, self.process.pattern
        )
    }

    async fn ensure_powered_on(&self, operation: &'static str) -> Result<()> {
        if self.hypervisor.power_state(&self.vm).await.map_err(self.hv_err(operation))?
            != PowerState::On
        {
            self.hypervisor
                .power_on(&self.vm)
                .await
                .map_err(self.hv_err(operation))?;
            self.state.clear_peers();
        }
        self.wait_for_ssh(operation).await
    }

    async fn wait_for_ssh(&self, operation: &'static str) -> Result<()> {
        let deadline = Instant::now() + self.boot_timeout;
        loop {
            if self.ssh.is_reachable().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::backend(
                    &self.id,
                    operation,
                    format!("ssh not reachable within {:?}", self.boot_timeout),
                ));
            }
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl NodeHandle for VmNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::VirtualMachine
    }

    fn commanded_status(&self) -> NodeStatus {
        self.state.status()
    }

    fn disconnected_peers(&self) -> BTreeSet<NodeId> {
        self.state.peers()
    }

    async fn start(&self) -> Result<()> {
        if self.state.status() == NodeStatus::PoweredOff {
            self.ensure_powered_on("start").await?;
        }
        if self.state.status() == NodeStatus::Paused {
            self.run(&self.signal_script("CONT"), "start").await?;
        }
        if !self.process_running("start").await? {
            self.run(&self.process.start, "start").await?;
        }
        self.state.set_status(NodeStatus::Running);
        tracing::info!(node = %self.id, "started");
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        if !self.process_running("stop").await? {
            if self.state.status() != NodeStatus::Killed {
                self.state.set_status(NodeStatus::Stopped);
            }
            return Ok(());
        }
        // A frozen process cannot handle the stop request.
        self.run(&self.signal_script("CONT"), "stop").await?;
        self.run(&self.process.stop, "stop").await?;

        let deadline = Instant::now() + grace;
        while self.process_running("stop").await? {
            if Instant::now() >= deadline {
                tracing::warn!(node = %self.id, ?grace, "graceful stop timed out, killing");
                self.run(&self.process.kill, "stop").await?;
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        self.state.set_status(NodeStatus::Stopped);
        tracing::info!(node = %self.id, ?grace, "stopped");
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        if self.process_running("kill").await? {
            self.run(&self.signal_script("CONT"), "kill").await?;
            self.run(&self.process.kill, "kill").await?;
        }
        self.state.set_status(NodeStatus::Killed);
        tracing::info!(node = %self.id, "killed");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        if self.state.status() == NodeStatus::Paused {
            return Ok(());
        }
        if !self.process_running("pause").await? {
            return Err(HarnessError::InvalidState {
                expected: "running member process".into(),
                actual: self.state.status().to_string(),
            });
        }
        self.run(&self.signal_script("STOP"), "pause").await?;
        self.state.set_status(NodeStatus::Paused);
        tracing::info!(node = %self.id, "paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.run(&self.signal_script("CONT"), "resume").await?;
        if self.state.status() == NodeStatus::Paused {
            self.state.set_status(NodeStatus::Running);
            tracing::info!(node = %self.id, "resumed");
        }
        Ok(())
    }

    async fn disconnect(&self, peers: &[NodeId]) -> Result<()> {
        for peer in self.state.not_blocked(peers) {
            if peer == self.id {
                continue;
            }
            self.run(
                &iptables::block_peer_script(peer.host(), self.sudo()),
                "disconnect",
            )
            .await?;
            tracing::info!(node = %self.id, %peer, "blocked peer");
            self.state.add_peer(peer);
        }
        Ok(())
    }

    async fn reconnect(&self, peers: &[NodeId]) -> Result<()> {
        let blocked = self.state.peers();
        for peer in peers.iter().filter(|p| blocked.contains(p)) {
            self.run(
                &iptables::unblock_peer_script(peer.host(), self.sudo()),
                "reconnect",
            )
            .await?;
            tracing::info!(node = %self.id, %peer, "unblocked peer");
            self.state.remove_peer(peer);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        // The VM stays; only the harness's footprint on it is removed.
        if self.state.status() == NodeStatus::PoweredOff {
            return Ok(());
        }
        let peers: Vec<NodeId> = self.state.peers().into_iter().collect();
        self.reconnect(&peers).await?;
        self.stop(crate::node::DEFAULT_STOP_GRACE).await?;
        tracing::info!(node = %self.id, vm = %self.vm, "released vm node");
        Ok(())
    }

    fn power_control(&self) -> Option<&dyn PowerControl> {
        Some(self)
    }
}

#[async_trait]
impl PowerControl for VmNode {
    async fn power_off(&self) -> Result<()> {
        self.hypervisor
            .power_off(&self.vm)
            .await
            .map_err(self.hv_err("power_off"))?;
        self.state.clear_peers();
        self.state.set_status(NodeStatus::PoweredOff);
        tracing::info!(node = %self.id, vm = %self.vm, "powered off");
        Ok(())
    }

    async fn power_on(&self) -> Result<()> {
        self.ensure_powered_on("power_on").await?;
        if self.state.status() == NodeStatus::PoweredOff {
            self.state.set_status(NodeStatus::Stopped);
        }
        tracing::info!(node = %self.id, vm = %self.vm, "powered on");
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        match self.hypervisor.guest_reboot(&self.vm).await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(node = %self.id, error = %e, "guest reboot failed, resetting");
                self.hypervisor
                    .reset(&self.vm)
                    .await
                    .map_err(self.hv_err("reboot"))?;
            }
        }
        self.state.clear_peers();
        self.state.set_status(NodeStatus::Stopped);
        tracing::info!(node = %self.id, vm = %self.vm, "rebooted");
        Ok(())
    }

    async fn power_state(&self) -> Result<PowerState> {
        self.hypervisor
            .power_state(&self.vm)
            .await
            .map_err(self.hv_err("power_state"))
    }
}
