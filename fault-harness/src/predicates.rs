//! Pure predicates over a [`ClusterSnapshot`].
//!
//! The poller's presets are built from these; scenarios can also combine
//! them in custom waits.

use fault_types::{ClusterSnapshot, ClusterStatus, Layout, NodeId};

/// Overall status is `STABLE`.
pub fn is_stable(snapshot: &ClusterSnapshot) -> bool {
    snapshot.status.overall == ClusterStatus::Stable
}

/// Overall status is `DEGRADED`.
pub fn is_degraded(snapshot: &ClusterSnapshot) -> bool {
    snapshot.status.overall == ClusterStatus::Degraded
}

/// Overall status is `UNAVAILABLE`.
pub fn is_unavailable(snapshot: &ClusterSnapshot) -> bool {
    snapshot.status.overall == ClusterStatus::Unavailable
}

/// Exactly `count` servers are marked unresponsive.
pub fn unresponsive_count_is(snapshot: &ClusterSnapshot, count: usize) -> bool {
    snapshot.layout.unresponsive_servers.len() == count
}

/// `node` is listed in `unresponsiveServers`.
pub fn is_unresponsive(snapshot: &ClusterSnapshot, node: &NodeId) -> bool {
    snapshot.layout.is_unresponsive(node)
}

/// `node` is absent from `unresponsiveServers`.
pub fn is_responsive(snapshot: &ClusterSnapshot, node: &NodeId) -> bool {
    !snapshot.layout.is_unresponsive(node)
}

/// Exactly the nodes in `nodes` are unresponsive, no more and no fewer.
pub fn unresponsive_exactly(layout: &Layout, nodes: &[NodeId]) -> bool {
    layout.unresponsive_servers.len() == nodes.len()
        && nodes.iter().all(|n| layout.is_unresponsive(n))
}

/// Epoch is strictly greater than `baseline`.
pub fn epoch_after(snapshot: &ClusterSnapshot, baseline: u64) -> bool {
    snapshot.layout.epoch > baseline
}

/// Epoch is at least `epoch`.
pub fn epoch_at_least(snapshot: &ClusterSnapshot, epoch: u64) -> bool {
    snapshot.layout.epoch >= epoch
}

/// `node` is a layout server.
pub fn has_server(snapshot: &ClusterSnapshot, node: &NodeId) -> bool {
    snapshot.layout.contains(node)
}
