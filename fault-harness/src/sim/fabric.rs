//! Shared world state behind every simulated node and management client.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fault_types::{
    ClusterStatus, ClusterStatusReport, Connectivity, Layout, NodeHealth, NodeId, NodeStatus,
    Reliability,
};

use crate::management::ManagementError;
use crate::node::PowerState;

/// Physical state of one simulated member.
#[derive(Debug, Clone)]
pub(crate) struct SimMember {
    pub(crate) status: NodeStatus,
    pub(crate) power: PowerState,
    pub(crate) blocked: BTreeSet<NodeId>,
    pub(crate) destroyed: bool,
    pub(crate) resets: u32,
}

impl SimMember {
    fn new() -> Self {
        Self {
            status: NodeStatus::Running,
            power: PowerState::On,
            blocked: BTreeSet::new(),
            destroyed: false,
            resets: 0,
        }
    }

    /// Whether the member process is serving.
    pub(crate) fn is_up(&self) -> bool {
        !self.destroyed && self.power == PowerState::On && self.status.is_live()
    }
}

#[derive(Debug, Default)]
pub(crate) struct FabricState {
    pub(crate) members: BTreeMap<NodeId, SimMember>,
    pub(crate) layout: Option<Layout>,
    pub(crate) report: Option<ClusterStatusReport>,
    pub(crate) detection_lag: u32,
    pub(crate) lag_remaining: u32,
    pub(crate) bootstrap_failures: u32,
    pub(crate) bootstrap_attempts: u32,
    pub(crate) management_down: bool,
    pub(crate) fail_next: BTreeSet<(NodeId, &'static str)>,
    pub(crate) fail_provision: BTreeSet<usize>,
    pub(crate) latency: BTreeMap<NodeId, Duration>,
    pub(crate) prepared: u32,
    pub(crate) released: u32,
}

/// In-memory cluster the simulated backend and management client share.
///
/// Clones share state. Tests hold one to inject control-plane faults and to
/// inspect what the harness did.
#[derive(Debug, Clone, Default)]
pub struct SimFabric {
    inner: Arc<Mutex<FabricState>>,
}

impl SimFabric {
    /// Empty fabric with no detection lag.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Management reads a physical change takes to become visible.
    pub fn set_detection_lag(&self, reads: u32) {
        let mut state = self.lock();
        state.detection_lag = reads;
        state.lag_remaining = reads;
    }

    /// Reject the next `count` bootstrap submissions.
    pub fn fail_bootstraps(&self, count: u32) {
        self.lock().bootstrap_failures = count;
    }

    /// Bootstrap submissions received so far, failed ones included.
    pub fn bootstrap_attempts(&self) -> u32 {
        self.lock().bootstrap_attempts
    }

    /// Make every management call fail as unreachable.
    pub fn set_management_down(&self, down: bool) {
        self.lock().management_down = down;
    }

    /// Fail the next `operation` (e.g. `"kill"`) on `node` as a control-plane error.
    pub fn fail_next(&self, node: &NodeId, operation: &'static str) {
        self.lock().fail_next.insert((node.clone(), operation));
    }

    /// Fail provisioning of node `index`.
    pub fn fail_provision(&self, index: usize) {
        self.lock().fail_provision.insert(index);
    }

    /// Delay every control-plane call on `node`.
    pub fn set_latency(&self, node: &NodeId, latency: Duration) {
        self.lock().latency.insert(node.clone(), latency);
    }

    /// Number of `prepare` calls seen.
    pub fn prepared(&self) -> u32 {
        self.lock().prepared
    }

    /// Number of `release` calls seen.
    pub fn released(&self) -> u32 {
        self.lock().released
    }

    /// Whether `node` has been destroyed.
    pub fn is_destroyed(&self, node: &NodeId) -> bool {
        self.lock().members.get(node).map_or(false, |m| m.destroyed)
    }

    /// Number of `reset` calls `node` received.
    pub fn resets(&self, node: &NodeId) -> u32 {
        self.lock().members.get(node).map_or(0, |m| m.resets)
    }

    /// Physical status of `node`.
    pub fn status_of(&self, node: &NodeId) -> Option<NodeStatus> {
        self.lock().members.get(node).map(|m| m.status)
    }

    /// Peers `node` currently drops traffic from.
    pub fn blocked_by(&self, node: &NodeId) -> BTreeSet<NodeId> {
        self.lock()
            .members
            .get(node)
            .map(|m| m.blocked.clone())
            .unwrap_or_default()
    }

    /// Authoritative layout, bypassing detection lag and client caches.
    pub fn current_layout(&self) -> Option<Layout> {
        self.lock().layout.clone()
    }

    pub(crate) fn latency_of(&self, node: &NodeId) -> Duration {
        self.lock()
            .latency
            .get(node)
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn take_failure(&self, node: &NodeId, operation: &'static str) -> bool {
        self.lock().fail_next.remove(&(node.clone(), operation))
    }

    pub(crate) fn register(&self, node: &NodeId) {
        let mut state = self.lock();
        state.members.insert(node.clone(), SimMember::new());
        state.touch();
    }

    pub(crate) fn update(&self, node: &NodeId, f: impl FnOnce(&mut SimMember)) {
        let mut state = self.lock();
        if let Some(member) = state.members.get_mut(node) {
            f(member);
        }
        state.touch();
    }
}

impl FabricState {
    /// A physical change happened; restart the detection countdown.
    pub(crate) fn touch(&mut self) {
        self.lag_remaining = self.detection_lag;
    }

    pub(crate) fn is_up(&self, node: &NodeId) -> bool {
        self.members.get(node).map_or(false, SimMember::is_up)
    }

    fn link_failed(&self, a: &NodeId, b: &NodeId) -> bool {
        let blocks = |x: &NodeId, y: &NodeId| {
            self.members
                .get(x)
                .map_or(false, |m| m.blocked.contains(y))
        };
        blocks(a, b) || blocks(b, a)
    }

    /// Servers the failure detector would currently mark unresponsive.
    pub(crate) fn detect(&self, layout: &Layout) -> BTreeSet<NodeId> {
        let mut unresponsive: BTreeSet<NodeId> = layout
            .servers
            .iter()
            .filter(|n| !self.is_up(n))
            .cloned()
            .collect();

        loop {
            let responsive: Vec<&NodeId> = layout
                .servers
                .iter()
                .filter(|n| !unresponsive.contains(*n))
                .collect();

            let mut failures: BTreeMap<&NodeId, usize> = BTreeMap::new();
            for (i, a) in responsive.iter().enumerate() {
                for b in &responsive[i + 1..] {
                    if self.link_failed(a, b) {
                        *failures.entry(*a).or_default() += 1;
                        *failures.entry(*b).or_default() += 1;
                    }
                }
            }

            // Most failed links first; on a tie the larger endpoint loses.
            match failures.into_iter().max_by(|x, y| x.1.cmp(&y.1).then(x.0.cmp(y.0))) {
                Some((worst, _)) => {
                    unresponsive.insert(worst.clone());
                }
                None => return unresponsive,
            }
        }
    }

    /// Re-run failure detection, commit layout changes a quorum allows, and
    /// refresh the status report. Honors detection lag.
    pub(crate) fn observe(&mut self) -> Result<(), ManagementError> {
        if self.management_down {
            return Err(ManagementError::Unreachable("management gateway down".into()));
        }
        let Some(mut layout) = self.layout.clone() else {
            return Err(ManagementError::Rejected("cluster not bootstrapped".into()));
        };
        if self.report.is_some() && self.lag_remaining > 0 {
            self.lag_remaining -= 1;
            return Ok(());
        }

        let detected = self.detect(&layout);
        let responsive = layout.servers.len() - detected.len();
        let has_quorum = responsive >= layout.quorum();

        if detected != layout.unresponsive_servers && has_quorum {
            layout.unresponsive_servers = detected.clone();
            layout.epoch += 1;
            tracing::debug!(epoch = layout.epoch, unresponsive = detected.len(), "sim layout change");
            self.layout = Some(layout.clone());
        }

        let overall = if detected.is_empty() {
            ClusterStatus::Stable
        } else if has_quorum {
            ClusterStatus::Degraded
        } else {
            ClusterStatus::Unavailable
        };
        let reliability = if has_quorum {
            Reliability::StrongQuorum
        } else {
            Reliability::WeakNoQuorum
        };

        let connectivity = layout
            .servers
            .iter()
            .map(|n| {
                let c = if self.is_up(n) {
                    Connectivity::Responsive
                } else {
                    Connectivity::Unresponsive
                };
                (n.clone(), c)
            })
            .collect();
        let health = layout
            .servers
            .iter()
            .map(|n| {
                let h = if detected.contains(n) {
                    NodeHealth::Down
                } else {
                    NodeHealth::Up
                };
                (n.clone(), h)
            })
            .collect();

        self.report = Some(ClusterStatusReport {
            overall,
            connectivity,
            health,
            reliability,
        });
        Ok(())
    }

    /// Whether a quorum of layout servers is up and mutually connected.
    pub(crate) fn quorum_available(&self, layout: &Layout) -> bool {
        layout.servers.len() - self.detect(layout).len() >= layout.quorum()
    }
}
