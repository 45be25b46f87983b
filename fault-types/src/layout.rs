//! Cluster layout: membership, replication topology and epoch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{NodeId, TypesError};

/// Replication protocol used by a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMode {
    /// Chain replication across the stripe's log servers.
    ChainReplication,
    /// Quorum replication across the stripe's log servers.
    QuorumReplication,
}

/// A stripe of log servers within a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutStripe {
    /// Log servers holding this stripe.
    pub log_servers: Vec<NodeId>,
}

/// A contiguous address range with its replication topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSegment {
    /// Replication protocol.
    pub replication_mode: ReplicationMode,
    /// First address (inclusive).
    pub start: u64,
    /// Last address (exclusive); `None` for an open-ended segment.
    pub end: Option<u64>,
    /// Stripes of this segment.
    pub stripes: Vec<LayoutStripe>,
}

/// The cluster's declaration of membership, topology and epoch.
///
/// Invariants: the epoch strictly increases on every accepted change and
/// `unresponsive_servers` is a subset of `servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    /// Layout version.
    pub epoch: u64,
    /// Ordered layout servers (cluster membership).
    pub servers: Vec<NodeId>,
    /// Sequencer servers, primary first.
    #[serde(default)]
    pub sequencers: Vec<NodeId>,
    /// Replication segments.
    #[serde(default)]
    pub segments: Vec<LayoutSegment>,
    /// Servers the failure detector currently considers unreachable.
    #[serde(default)]
    pub unresponsive_servers: BTreeSet<NodeId>,
    /// Cluster identity, fixed at bootstrap.
    pub cluster_id: uuid::Uuid,
}

impl Layout {
    /// Initial layout for a freshly deployed fleet.
    ///
    /// Epoch 0, every node a layout server and sequencer, and a single open
    /// chain-replication segment striped over all nodes.
    pub fn initial(nodes: &[NodeId]) -> Self {
        Self {
            epoch: 0,
            servers: nodes.to_vec(),
            sequencers: nodes.to_vec(),
            segments: vec![LayoutSegment {
                replication_mode: ReplicationMode::ChainReplication,
                start: 0,
                end: None,
                stripes: vec![LayoutStripe {
                    log_servers: nodes.to_vec(),
                }],
            }],
            unresponsive_servers: BTreeSet::new(),
            cluster_id: uuid::Uuid::new_v4(),
        }
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.servers.is_empty() {
            return Err(TypesError::EmptyLayout);
        }
        if let Some(stray) = self
            .unresponsive_servers
            .iter()
            .find(|n| !self.servers.contains(n))
        {
            return Err(TypesError::UnknownUnresponsive(stray.to_string()));
        }
        Ok(())
    }

    /// Whether `node` is a layout server.
    pub fn contains(&self, node: &NodeId) -> bool {
        self.servers.contains(node)
    }

    /// Whether `node` is marked unresponsive.
    pub fn is_unresponsive(&self, node: &NodeId) -> bool {
        self.unresponsive_servers.contains(node)
    }

    /// Layout servers not marked unresponsive, in layout order.
    pub fn responsive_servers(&self) -> impl Iterator<Item = &NodeId> {
        self.servers
            .iter()
            .filter(move |n| !self.unresponsive_servers.contains(n))
    }

    /// Number of servers needed for a majority.
    pub fn quorum(&self) -> usize {
        self.servers.len() / 2 + 1
    }
}
