//! In-memory backend and management API for harness self-tests.
//!
//! # Design
//!
//! A [`SimFabric`] holds the "physical" world: which member processes run,
//! which peers each node drops, which hosts are powered. [`SimNode`]s mutate
//! it through the same [`NodeHandle`](crate::node::NodeHandle) surface real
//! backends expose, and [`SimCluster`] answers management calls by running a
//! small failure detector over it:
//!
//! - a stopped, killed, paused or powered-off member is unresponsive;
//! - a link between two running members fails when either side drops the
//!   other; the member with the most failed links is marked unresponsive
//!   (larger endpoint on a tie) until no failed link remains;
//! - a layout change commits only while a majority of layout servers is
//!   responsive, and bumps the epoch by one.
//!
//! Detection lag, bootstrap rejections, control-plane failures and per-node
//! latency can be injected through the fabric.

mod cluster;
mod fabric;
mod node;

pub use cluster::SimCluster;
pub use fabric::SimFabric;
pub use node::{SimBackend, SimFlavor, SimNode};
