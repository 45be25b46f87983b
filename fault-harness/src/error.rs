//! Error types for the harness.
//!
//! Every failure surfaces to the scenario as a [`HarnessError`]. Nothing in
//! the harness retries a destructive operation on its own.

use std::time::Duration;

use fault_types::{ClusterSnapshot, Layout, NodeId, TypesError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::management::ManagementError;

/// Main error type for harness operations.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A control-plane call (container daemon, hypervisor, shell) failed.
    #[error("backend unavailable during {operation} on {node}: {detail}")]
    BackendUnavailable {
        /// Node the call targeted (or `fleet` for backend-wide calls).
        node: String,
        /// Operation that failed.
        operation: &'static str,
        /// Underlying error.
        detail: String,
    },

    /// A poll wait exceeded its deadline.
    #[error("timed out after {elapsed:?} ({attempts} attempts) waiting for {condition}; last: {}", describe_last(.last_snapshot, .last_error))]
    OperationTimeout {
        /// Human-readable condition.
        condition: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Number of snapshots taken.
        attempts: u32,
        /// Last snapshot observed, if any fetch succeeded.
        last_snapshot: Option<Box<ClusterSnapshot>>,
        /// Last fetch error, if the final fetch failed.
        last_error: Option<String>,
    },

    /// A poll wait was cancelled from outside.
    #[error("wait for {condition} cancelled")]
    Cancelled {
        /// Human-readable condition.
        condition: String,
    },

    /// Initial layout could not be submitted.
    #[error("bootstrap failed after {attempts} attempts: {last_error}")]
    BootstrapFailure {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// Add/remove did not converge to the expected layout.
    #[error("{operation} of {node} did not converge: {detail}")]
    MembershipOperationFailure {
        /// `add` or `remove`.
        operation: &'static str,
        /// Node being added or removed.
        node: NodeId,
        /// Layout observed after the operation, if it could be fetched.
        observed: Option<Box<Layout>>,
        /// What went wrong.
        detail: String,
    },

    /// Operation not valid in the current cluster state.
    #[error("invalid cluster state: expected {expected}, found {actual}")]
    InvalidState {
        /// Required state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Node does not expose the requested capability.
    #[error("{node} does not support {capability}")]
    Unsupported {
        /// Node id.
        node: NodeId,
        /// Capability name.
        capability: &'static str,
    },

    /// Node index out of range.
    #[error("no node at index {index} (cluster has {len})")]
    NodeIndex {
        /// Requested index.
        index: usize,
        /// Cluster size.
        len: usize,
    },

    /// Management API error.
    #[error("management error: {0}")]
    Management(#[from] ManagementError),

    /// Fixture configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Data model error.
    #[error("invalid cluster data: {0}")]
    Types(#[from] TypesError),
}

impl HarnessError {
    /// Build a [`HarnessError::BackendUnavailable`].
    pub fn backend(node: impl ToString, operation: &'static str, detail: impl ToString) -> Self {
        HarnessError::BackendUnavailable {
            node: node.to_string(),
            operation,
            detail: detail.to_string(),
        }
    }

    /// Last snapshot carried by a timeout, for diagnostics.
    pub fn last_snapshot(&self) -> Option<&ClusterSnapshot> {
        match self {
            HarnessError::OperationTimeout { last_snapshot, .. } => last_snapshot.as_deref(),
            _ => None,
        }
    }
}

fn describe_last(snapshot: &Option<Box<ClusterSnapshot>>, error: &Option<String>) -> String {
    match (snapshot, error) {
        (_, Some(e)) => format!("fetch error: {}", e),
        (Some(s), None) => s.summary(),
        (None, None) => "no snapshot".into(),
    }
}

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;
