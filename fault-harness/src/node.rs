//! Uniform capability surface for one cluster member.
//!
//! # Design
//!
//! Every backend implements [`NodeHandle`]. Operations are synchronous from
//! the caller's point of view: they return once the backend has confirmed the
//! change was issued, not once the cluster has noticed. Noticing is the
//! poller's job.
//!
//! Every operation is repeatable. Starting a running node, stopping a stopped
//! one, or disconnecting an already-disconnected pair is a no-op.
//!
//! Hypervisor-level power control is a separate capability,
//! [`PowerControl`], reachable through [`NodeHandle::power_control`].
//! Callers ask for it instead of naming a concrete backend type.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fault_types::{NodeId, NodeStatus};

use crate::error::Result;

/// Grace period used by the default `restart` implementation.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Which deployment backend a node lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Docker container.
    Container,
    /// Hypervisor-managed virtual machine.
    VirtualMachine,
    /// In-memory node for harness self-tests.
    Simulated,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Container => write!(f, "container"),
            NodeKind::VirtualMachine => write!(f, "vm"),
            NodeKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Hypervisor power state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Powered on.
    On,
    /// Powered off.
    Off,
    /// Suspended to memory/disk.
    Suspended,
}

/// Lifecycle and fault-injection operations on one cluster member.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    /// Stable endpoint identity.
    fn id(&self) -> &NodeId;

    /// Backend the node lives on.
    fn kind(&self) -> NodeKind;

    /// Last state this handle commanded.
    fn commanded_status(&self) -> NodeStatus;

    /// Peers this node currently blocks.
    fn disconnected_peers(&self) -> BTreeSet<NodeId>;

    /// Bring the node and its member process to running. No-op if running.
    async fn start(&self) -> Result<()>;

    /// Stop gracefully within `grace`, then force. No-op if already stopped.
    async fn stop(&self, grace: Duration) -> Result<()>;

    /// Terminate the member process immediately.
    async fn kill(&self) -> Result<()>;

    /// Freeze the member process without terminating it.
    async fn pause(&self) -> Result<()>;

    /// Unfreeze a paused member process.
    async fn resume(&self) -> Result<()>;

    /// Block traffic between this node and each of `peers`.
    async fn disconnect(&self, peers: &[NodeId]) -> Result<()>;

    /// Remove blocks between this node and each of `peers`.
    async fn reconnect(&self, peers: &[NodeId]) -> Result<()>;

    /// Stop followed by start.
    ///
    /// Backends with a faster native restart override this.
    async fn restart(&self) -> Result<()> {
        self.stop(DEFAULT_STOP_GRACE).await?;
        self.start().await
    }

    /// Release the node's backend resources. Called once at teardown.
    async fn destroy(&self) -> Result<()>;

    /// Hypervisor power control, if this node supports it.
    fn power_control(&self) -> Option<&dyn PowerControl> {
        None
    }
}

/// Hypervisor-level power operations (VM nodes only).
///
/// Stronger than a process stop: simulates loss of the whole host.
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Power the host off. No-op if already off.
    async fn power_off(&self) -> Result<()>;

    /// Power the host on. No-op if already on. Does not start the member process.
    async fn power_on(&self) -> Result<()>;

    /// Restart the guest OS.
    async fn reboot(&self) -> Result<()>;

    /// Current hypervisor power state.
    async fn power_state(&self) -> Result<PowerState>;
}

/// Commanded status and blocked peers, shared by every backend.
#[derive(Debug)]
pub struct CommandedState {
    inner: Mutex<CommandedInner>,
}

#[derive(Debug)]
struct CommandedInner {
    status: NodeStatus,
    peers: BTreeSet<NodeId>,
}

impl CommandedState {
    /// Start tracking from `status` with no blocked peers.
    pub fn new(status: NodeStatus) -> Self {
        Self {
            inner: Mutex::new(CommandedInner {
                status,
                peers: BTreeSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CommandedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current commanded status.
    pub fn status(&self) -> NodeStatus {
        self.lock().status
    }

    /// Currently blocked peers.
    pub fn peers(&self) -> BTreeSet<NodeId> {
        self.lock().peers.clone()
    }

    /// Record a process-level transition.
    ///
    /// A live process with blocked peers is reported as `Disconnected`.
    pub fn set_status(&self, status: NodeStatus) {
        let mut inner = self.lock();
        inner.status = if status.is_live() && !inner.peers.is_empty() {
            NodeStatus::Disconnected
        } else {
            status
        };
    }

    /// Peers from `peers` not yet blocked.
    pub fn not_blocked(&self, peers: &[NodeId]) -> Vec<NodeId> {
        let inner = self.lock();
        peers
            .iter()
            .filter(|p| !inner.peers.contains(p))
            .cloned()
            .collect()
    }

    /// Record that `peer` is now blocked.
    pub fn add_peer(&self, peer: NodeId) {
        let mut inner = self.lock();
        inner.peers.insert(peer);
        if inner.status.is_live() {
            inner.status = NodeStatus::Disconnected;
        }
    }

    /// Record that `peer` is no longer blocked.
    pub fn remove_peer(&self, peer: &NodeId) {
        let mut inner = self.lock();
        inner.peers.remove(peer);
        if inner.peers.is_empty() && inner.status == NodeStatus::Disconnected {
            inner.status = NodeStatus::Running;
        }
    }

    /// Forget every block (host restarted, firewall state lost).
    pub fn clear_peers(&self) {
        let mut inner = self.lock();
        inner.peers.clear();
        if inner.status == NodeStatus::Disconnected {
            inner.status = NodeStatus::Running;
        }
    }
}
