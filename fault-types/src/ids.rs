//! Node identity and commanded state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// Stable identifier of a cluster member: its `host:port` endpoint.
///
/// Ordering is the lexicographic ordering of the endpoint string, which is
/// what the cluster's failure detector uses to break ties.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Parse an endpoint of the form `host:port`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, TypesError> {
        let endpoint = endpoint.into();
        match endpoint.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self(endpoint))
            }
            _ => Err(TypesError::InvalidEndpoint(endpoint)),
        }
    }

    /// Build an endpoint from a host and port.
    pub fn from_parts(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    /// The host part (IP address or hostname).
    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.0)
    }

    /// The port part.
    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or_default()
    }

    /// The full endpoint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodeId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Last state a node was *commanded* into by the harness.
///
/// This is distinct from the health the cluster reports about the node;
/// the two are reconciled by polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Member process is running.
    Running,
    /// Process stopped gracefully (or forced after the grace period).
    Stopped,
    /// Process frozen; identity and data preserved.
    Paused,
    /// Process running but blocked from one or more peers.
    Disconnected,
    /// Host powered off at the hypervisor.
    PoweredOff,
    /// Process terminated without a graceful shutdown.
    Killed,
}

impl NodeStatus {
    /// Whether the member process is executing (possibly behind a network block).
    pub fn is_live(&self) -> bool {
        matches!(self, NodeStatus::Running | NodeStatus::Disconnected)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Running => "running",
            NodeStatus::Stopped => "stopped",
            NodeStatus::Paused => "paused",
            NodeStatus::Disconnected => "disconnected",
            NodeStatus::PoweredOff => "powered-off",
            NodeStatus::Killed => "killed",
        };
        f.write_str(s)
    }
}
