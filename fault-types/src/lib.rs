//! # faultline-types
//!
//! Data model shared across the faultline fault-injection harness.
//!
//! This crate provides the types that describe a cluster under test:
//! - [`NodeId`] - Stable `host:port` identity of a cluster member
//! - [`NodeStatus`] - Last *commanded* state of a node
//! - [`Layout`] - Membership, replication topology and epoch
//! - [`ClusterStatusReport`] - Health as observed by the cluster itself
//! - [`ClusterSnapshot`] - One layout + status pair fetched together
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod layout;
mod status;

pub use error::TypesError;
pub use ids::{NodeId, NodeStatus};
pub use layout::{Layout, LayoutSegment, LayoutStripe, ReplicationMode};
pub use status::{
    ClusterSnapshot, ClusterStatus, ClusterStatusReport, Connectivity, NodeHealth, Reliability,
};
