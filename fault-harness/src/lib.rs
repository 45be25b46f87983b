//! # faultline-harness
//!
//! Fault-injection harness for replicated-log clusters.
//!
//! Deploys a cluster on containers or VMs, breaks it on purpose, and waits
//! for the cluster to notice.
//!
//! ## Features
//!
//! - **Uniform node control**: one [`NodeHandle`] surface over Docker
//!   containers, hypervisor VMs and an in-memory simulator
//! - **Declarative faults**: [`FailureInjector`] for partitions, link
//!   failures, rotations and parallel batches
//! - **Condition polling**: [`ConditionPoller`] with fixed interval, deadline
//!   and cancellation
//! - **Lifecycle**: [`ClusterOrchestrator`] deploys, bootstraps and tears
//!   down a [`ClusterGroup`]
//!
//! ## Example
//!
//! ```ignore
//! use faultline_harness::{ClusterOrchestrator, FixtureSpec, HttpConnector, backend};
//!
//! let fixture = FixtureSpec::from_file("fixtures/three-node.toml".as_ref())?;
//! let orch = ClusterOrchestrator::new(backend::from_fixture(&fixture)?, Arc::new(HttpConnector));
//! let mut cluster = orch.deploy(&fixture).await?;
//!
//! cluster.injector().partition(0).await?;
//! cluster.poller().wait_for_degraded().await?;
//! cluster.injector().heal(0).await?;
//! cluster.poller().wait_for_stable().await?;
//!
//! orch.teardown(&mut cluster).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod injector;
pub mod iptables;
pub mod lifecycle;
pub mod logging;
pub mod management;
pub mod node;
pub mod orchestrator;
pub mod poller;
pub mod predicates;
pub mod sim;
pub mod ssh;

pub use backend::{DeploymentBackend, DockerBackend, VmBackend};
pub use cluster::ClusterGroup;
pub use config::{BackendSpec, ConfigError, FixtureSpec};
pub use error::{HarnessError, Result};
pub use injector::{BatchReport, FailureInjector, FaultOp, LinkRotation, NodeOutcome, Symmetry};
pub use lifecycle::{ClusterLifecycle, ClusterState};
pub use management::{
    HttpConnector, HttpManagementClient, ManagementClient, ManagementConnector, ManagementError,
};
pub use node::{NodeHandle, NodeKind, PowerControl, PowerState};
pub use orchestrator::ClusterOrchestrator;
pub use poller::{ConditionPoller, PollSettings, PollSuccess};
