//! Scenario-level fault vocabulary over [`NodeHandle`]s.
//!
//! "Partition node X" becomes a symmetric disconnect from every other node;
//! "two-node link failure" is a single disconnect between exactly two nodes.
//! Whether a block is mirrored on the peer is always spelled out at the call
//! site with [`Symmetry`].
//!
//! The injector keeps no state beyond the node list. Destructive calls are
//! never retried.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fault_types::NodeId;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::FaultConfig;
use crate::error::{HarnessError, Result};
use crate::node::{NodeHandle, PowerControl};

/// Whether a disconnect is mirrored on the peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symmetry {
    /// Install the block on both sides.
    Symmetric,
    /// Install the block only on the named node.
    OneWay,
}

/// A single-node operation that can be applied to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    /// Start the member.
    Start,
    /// Graceful stop with the configured grace.
    Stop,
    /// Immediate kill.
    Kill,
    /// Freeze.
    Pause,
    /// Unfreeze.
    Resume,
    /// Stop then start.
    Restart,
    /// Hypervisor power off.
    PowerOff,
    /// Hypervisor power on.
    PowerOn,
    /// Guest reboot.
    Reboot,
}

impl FaultOp {
    /// Operation name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            FaultOp::Start => "start",
            FaultOp::Stop => "stop",
            FaultOp::Kill => "kill",
            FaultOp::Pause => "pause",
            FaultOp::Resume => "resume",
            FaultOp::Restart => "restart",
            FaultOp::PowerOff => "power_off",
            FaultOp::PowerOn => "power_on",
            FaultOp::Reboot => "reboot",
        }
    }
}

impl fmt::Display for FaultOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one node's call in a batch.
#[derive(Debug)]
pub struct NodeOutcome {
    /// Node index in the cluster.
    pub index: usize,
    /// Node endpoint.
    pub node: NodeId,
    /// What the call returned.
    pub result: Result<()>,
    /// How long the call took.
    pub elapsed: Duration,
}

/// Every outcome of a parallel batch, in index order.
#[derive(Debug)]
pub struct BatchReport {
    /// Operation applied.
    pub op: FaultOp,
    /// One entry per targeted node.
    pub outcomes: Vec<NodeOutcome>,
}

impl BatchReport {
    /// Outcomes that succeeded.
    pub fn succeeded(&self) -> Vec<&NodeOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok()).collect()
    }

    /// Outcomes that failed.
    pub fn failed(&self) -> Vec<&NodeOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err()).collect()
    }

    /// Whether every call succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// First failure (by index), or `Ok` if all succeeded.
    pub fn into_result(self) -> Result<()> {
        for outcome in self.outcomes {
            outcome.result?;
        }
        Ok(())
    }
}

async fn apply(node: &dyn NodeHandle, op: FaultOp, grace: Duration) -> Result<()> {
    match op {
        FaultOp::Start => node.start().await,
        FaultOp::Stop => node.stop(grace).await,
        FaultOp::Kill => node.kill().await,
        FaultOp::Pause => node.pause().await,
        FaultOp::Resume => node.resume().await,
        FaultOp::Restart => node.restart().await,
        FaultOp::PowerOff => power(node)?.power_off().await,
        FaultOp::PowerOn => power(node)?.power_on().await,
        FaultOp::Reboot => power(node)?.reboot().await,
    }
}

fn power(node: &dyn NodeHandle) -> Result<&dyn PowerControl> {
    node.power_control().ok_or_else(|| HarnessError::Unsupported {
        node: node.id().clone(),
        capability: "power control",
    })
}

/// Applies faults to a cluster's nodes by index.
#[derive(Clone)]
pub struct FailureInjector {
    nodes: Vec<Arc<dyn NodeHandle>>,
    stop_grace: Duration,
    call_timeout: Duration,
}

impl FailureInjector {
    /// Injector over `nodes` using the fixture's fault settings.
    pub fn new(nodes: Vec<Arc<dyn NodeHandle>>, faults: &FaultConfig) -> Self {
        Self {
            nodes,
            stop_grace: faults.stop_grace(),
            call_timeout: faults.call_timeout(),
        }
    }

    /// Override the per-call timeout of parallel batches.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Node at `index`.
    pub fn node(&self, index: usize) -> Result<&Arc<dyn NodeHandle>> {
        self.nodes.get(index).ok_or(HarnessError::NodeIndex {
            index,
            len: self.nodes.len(),
        })
    }

    fn ids(&self, indices: &[usize]) -> Result<Vec<NodeId>> {
        indices
            .iter()
            .map(|&i| self.node(i).map(|n| n.id().clone()))
            .collect()
    }

    fn others(&self, index: usize) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&i| i != index).collect()
    }

    /// Block traffic between node `index` and each of `peers`.
    pub async fn disconnect(&self, index: usize, peers: &[usize], symmetry: Symmetry) -> Result<()> {
        let node = self.node(index)?;
        let peer_ids = self.ids(peers)?;
        tracing::info!(node = %node.id(), peers = peer_ids.len(), ?symmetry, "disconnect");

        node.disconnect(&peer_ids).await?;
        if symmetry == Symmetry::Symmetric {
            for &peer in peers {
                self.node(peer)?.disconnect(std::slice::from_ref(node.id())).await?;
            }
        }
        Ok(())
    }

    /// Remove blocks between node `index` and each of `peers`.
    pub async fn reconnect(&self, index: usize, peers: &[usize], symmetry: Symmetry) -> Result<()> {
        let node = self.node(index)?;
        let peer_ids = self.ids(peers)?;
        tracing::info!(node = %node.id(), peers = peer_ids.len(), ?symmetry, "reconnect");

        node.reconnect(&peer_ids).await?;
        if symmetry == Symmetry::Symmetric {
            for &peer in peers {
                self.node(peer)?.reconnect(std::slice::from_ref(node.id())).await?;
            }
        }
        Ok(())
    }

    /// Cut node `index` off from every other node.
    pub async fn partition(&self, index: usize) -> Result<()> {
        self.disconnect(index, &self.others(index), Symmetry::Symmetric)
            .await
    }

    /// Undo [`partition`](Self::partition).
    pub async fn heal(&self, index: usize) -> Result<()> {
        self.reconnect(index, &self.others(index), Symmetry::Symmetric)
            .await
    }

    /// Break the single link between nodes `a` and `b`.
    pub async fn link_failure(&self, a: usize, b: usize) -> Result<()> {
        self.disconnect(a, &[b], Symmetry::OneWay).await
    }

    /// Restore the link between nodes `a` and `b`.
    pub async fn heal_link(&self, a: usize, b: usize) -> Result<()> {
        self.reconnect(a, &[b], Symmetry::OneWay).await
    }

    /// Start node `index`.
    pub async fn start(&self, index: usize) -> Result<()> {
        self.node(index)?.start().await
    }

    /// Gracefully stop node `index`.
    pub async fn stop(&self, index: usize) -> Result<()> {
        self.node(index)?.stop(self.stop_grace).await
    }

    /// Kill node `index`.
    pub async fn kill(&self, index: usize) -> Result<()> {
        self.node(index)?.kill().await
    }

    /// Pause node `index`.
    pub async fn pause(&self, index: usize) -> Result<()> {
        self.node(index)?.pause().await
    }

    /// Resume node `index`.
    pub async fn resume(&self, index: usize) -> Result<()> {
        self.node(index)?.resume().await
    }

    /// Restart node `index`.
    pub async fn restart(&self, index: usize) -> Result<()> {
        self.node(index)?.restart().await
    }

    /// Power node `index` off.
    pub async fn power_off(&self, index: usize) -> Result<()> {
        power(self.node(index)?.as_ref())?.power_off().await
    }

    /// Power node `index` on.
    pub async fn power_on(&self, index: usize) -> Result<()> {
        power(self.node(index)?.as_ref())?.power_on().await
    }

    /// Reboot node `index`.
    pub async fn reboot(&self, index: usize) -> Result<()> {
        power(self.node(index)?.as_ref())?.reboot().await
    }

    /// Apply `op` to every node in `indices` concurrently.
    ///
    /// Each call runs under the per-call timeout. Every outcome is collected;
    /// one node failing does not cancel the others. A node may appear at
    /// most once per batch.
    pub async fn apply_all(&self, indices: &[usize], op: FaultOp) -> Result<BatchReport> {
        let targets: Vec<(usize, Arc<dyn NodeHandle>)> = indices
            .iter()
            .map(|&i| self.node(i).map(|n| (i, n.clone())))
            .collect::<Result<_>>()?;

        let mut seen = BTreeSet::new();
        if let Some(&repeated) = indices.iter().find(|&&i| !seen.insert(i)) {
            return Err(HarnessError::InvalidState {
                expected: "distinct node indices in a batch".into(),
                actual: format!("index {} listed more than once", repeated),
            });
        }

        tracing::info!(%op, nodes = targets.len(), "parallel batch");

        let mut set = JoinSet::new();
        for (index, node) in &targets {
            let (index, node) = (*index, node.clone());
            let (grace, call_timeout) = (self.stop_grace, self.call_timeout);
            set.spawn(async move {
                let started = Instant::now();
                let result = match tokio::time::timeout(call_timeout, apply(node.as_ref(), op, grace)).await {
                    Ok(result) => result,
                    Err(_) => Err(HarnessError::backend(
                        node.id(),
                        op.name(),
                        format!("no response within {:?}", call_timeout),
                    )),
                };
                (index, result, started.elapsed())
            });
        }

        let mut results: Vec<Option<(Result<()>, Duration)>> =
            targets.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result, elapsed)) => {
                    if let Some(pos) = targets.iter().position(|(i, _)| *i == index) {
                        results[pos] = Some((result, elapsed));
                    }
                }
                Err(e) => tracing::error!(%op, error = %e, "batch task failed"),
            }
        }

        let outcomes = targets
            .into_iter()
            .zip(results)
            .map(|((index, node), result)| {
                let (result, elapsed) = result.unwrap_or_else(|| {
                    (
                        Err(HarnessError::backend(node.id(), op.name(), "task aborted")),
                        Duration::ZERO,
                    )
                });
                if let Err(e) = &result {
                    tracing::warn!(node = %node.id(), %op, error = %e, "batch call failed");
                }
                NodeOutcome {
                    index,
                    node: node.id().clone(),
                    result,
                    elapsed,
                }
            })
            .collect();

        Ok(BatchReport { op, outcomes })
    }

    /// Power off every node in parallel.
    pub async fn power_off_all(&self) -> Result<BatchReport> {
        self.apply_all(&self.all(), FaultOp::PowerOff).await
    }

    /// Power on every node in parallel.
    pub async fn power_on_all(&self) -> Result<BatchReport> {
        self.apply_all(&self.all(), FaultOp::PowerOn).await
    }

    /// Start every node in parallel.
    pub async fn start_all(&self) -> Result<BatchReport> {
        self.apply_all(&self.all(), FaultOp::Start).await
    }

    fn all(&self) -> Vec<usize> {
        (0..self.nodes.len()).collect()
    }
}

/// Rolling single-link failure: at most one broken link at any time.
///
/// Each step heals the previous pair before breaking the next one, so no node
/// is ever cut off from more than one peer.
#[derive(Debug, Clone)]
pub struct LinkRotation {
    pairs: Vec<(usize, usize)>,
    next: usize,
    active: Option<(usize, usize)>,
}

impl LinkRotation {
    /// Rotate through `pairs` in order, wrapping around.
    pub fn new(pairs: Vec<(usize, usize)>) -> Self {
        Self {
            pairs,
            next: 0,
            active: None,
        }
    }

    /// Every adjacent pair of an `n`-node ring: `(0,1), (1,2), .., (n-1,0)`.
    pub fn ring(n: usize) -> Self {
        let pairs = if n < 2 {
            Vec::new()
        } else if n == 2 {
            vec![(0, 1)]
        } else {
            (0..n).map(|i| (i, (i + 1) % n)).collect()
        };
        Self::new(pairs)
    }

    /// Pair currently broken.
    pub fn active(&self) -> Option<(usize, usize)> {
        self.active
    }

    /// Heal the active pair, then break the next one. Returns the new pair.
    pub async fn next_step(&mut self, injector: &FailureInjector) -> Result<Option<(usize, usize)>> {
        if self.pairs.is_empty() {
            return Ok(None);
        }
        if let Some((a, b)) = self.active.take() {
            injector.heal_link(a, b).await?;
        }
        let (a, b) = self.pairs[self.next];
        injector.link_failure(a, b).await?;
        self.active = Some((a, b));
        self.next = (self.next + 1) % self.pairs.len();
        Ok(self.active)
    }

    /// Heal the active pair, if any.
    pub async fn finish(&mut self, injector: &FailureInjector) -> Result<()> {
        if let Some((a, b)) = self.active.take() {
            injector.heal_link(a, b).await?;
        }
        Ok(())
    }
}
