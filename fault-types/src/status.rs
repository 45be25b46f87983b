//! Cluster health as reported by the system under test.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Layout, NodeId};

/// Overall cluster health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    /// Every layout server is responsive.
    Stable,
    /// Some servers are unresponsive but the cluster keeps a quorum.
    Degraded,
    /// The cluster cannot serve requests.
    Unavailable,
}

/// Whether a node answered the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Connectivity {
    /// Reachable from the querying client.
    Responsive,
    /// Not reachable from the querying client.
    Unresponsive,
}

/// Health of a node as seen by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeHealth {
    /// Serving.
    Up,
    /// Not serving.
    Down,
    /// Unknown (no trustworthy information).
    Na,
}

/// How far the report can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reliability {
    /// A quorum of layout servers contributed to the report.
    StrongQuorum,
    /// The report was assembled without a quorum.
    WeakNoQuorum,
    /// No layout server could be reached.
    Unavailable,
}

/// Point-in-time health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusReport {
    /// Overall status.
    pub overall: ClusterStatus,
    /// Client-to-node connectivity.
    pub connectivity: BTreeMap<NodeId, Connectivity>,
    /// Per-node health.
    pub health: BTreeMap<NodeId, NodeHealth>,
    /// Trustworthiness of the report.
    pub reliability: Reliability,
}

impl ClusterStatusReport {
    /// Nodes the client could not reach.
    pub fn unreachable(&self) -> Vec<&NodeId> {
        self.connectivity
            .iter()
            .filter(|(_, c)| **c == Connectivity::Unresponsive)
            .map(|(n, _)| n)
            .collect()
    }
}

/// Layout and status fetched together in a single poll iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    /// Layout at fetch time.
    pub layout: Layout,
    /// Health report at fetch time.
    pub status: ClusterStatusReport,
}

impl ClusterSnapshot {
    /// Short one-line summary for logs and error messages.
    pub fn summary(&self) -> String {
        let unresponsive: Vec<&str> = self
            .layout
            .unresponsive_servers
            .iter()
            .map(|n| n.as_str())
            .collect();
        format!(
            "epoch={} status={:?} reliability={:?} servers={} unresponsive=[{}]",
            self.layout.epoch,
            self.status.overall,
            self.status.reliability,
            self.layout.servers.len(),
            unresponsive.join(",")
        )
    }
}
