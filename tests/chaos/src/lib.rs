//! # chaos-tests
//!
//! Fault-injection scenarios for replicated-log clusters.
//!
//! Scenarios run against the in-memory simulator by default, so the whole
//! suite is runnable without infrastructure:
//! - Cluster lifecycle (deploy, bootstrap, teardown)
//! - Partitions, link failures and rotations
//! - Layout membership changes
//! - Power cycles and parallel fault batches
//!
//! The same scenarios against Docker or a VM lab are `#[ignore]`d and run
//! serially.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod fixtures;

pub mod scenarios;
