//! Wait for the cluster to reach a condition.
//!
//! Fault injection returns as soon as the backend accepted the command; the
//! cluster notices later. Scenarios never assert right after injecting: they
//! wait here instead.
//!
//! Each attempt fetches a fresh snapshot (layout cache invalidated), so a
//! stale layout can never satisfy a predicate. Fetch errors count as "not
//! yet". The interval is fixed: no backoff, no adaptation.

use std::sync::Arc;
use std::time::Duration;

use fault_types::{ClusterSnapshot, Layout, NodeId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PollConfig;
use crate::error::{HarnessError, Result};
use crate::management::{ManagementClient, ManagementError};
use crate::predicates;

/// Interval and deadline of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Pause between attempts.
    pub interval: Duration,
    /// Total time allowed.
    pub timeout: Duration,
}

impl PollSettings {
    /// Settings with the given interval and timeout.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        (&PollConfig::default()).into()
    }
}

impl From<&PollConfig> for PollSettings {
    fn from(config: &PollConfig) -> Self {
        Self {
            interval: config.interval(),
            timeout: config.timeout(),
        }
    }
}

/// A satisfied wait.
#[derive(Debug, Clone)]
pub struct PollSuccess {
    /// Snapshot that satisfied the predicate.
    pub snapshot: ClusterSnapshot,
    /// Snapshots taken, including the satisfying one.
    pub attempts: u32,
    /// Time from the start of the wait.
    pub elapsed: Duration,
}

/// Polls a [`ManagementClient`] until a predicate holds.
#[derive(Clone)]
pub struct ConditionPoller {
    client: Arc<dyn ManagementClient>,
    settings: PollSettings,
    cancel: CancellationToken,
}

impl ConditionPoller {
    /// Poller over `client` with default cancellation (never cancelled).
    pub fn new(client: Arc<dyn ManagementClient>, settings: PollSettings) -> Self {
        Self {
            client,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Copy of this poller with different settings, for one-off waits.
    pub fn with_settings(&self, settings: PollSettings) -> Self {
        Self {
            client: self.client.clone(),
            settings,
            cancel: self.cancel.clone(),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Fetch a fresh layout and status.
    pub async fn snapshot(&self) -> std::result::Result<ClusterSnapshot, ManagementError> {
        self.client.invalidate_layout_cache();
        let layout = self.client.get_layout().await?;
        let status = self.client.get_cluster_status().await?;
        Ok(ClusterSnapshot { layout, status })
    }

    /// Wait until `predicate` holds on a fresh snapshot.
    ///
    /// # Errors
    ///
    /// [`HarnessError::OperationTimeout`] with the last snapshot once the
    /// deadline passes, or [`HarnessError::Cancelled`] if the token fires.
    pub async fn wait_for<F>(&self, condition: &str, predicate: F) -> Result<PollSuccess>
    where
        F: Fn(&ClusterSnapshot) -> bool + Send + Sync,
    {
        let started = Instant::now();
        let deadline = started + self.settings.timeout;
        let mut attempts = 0u32;
        let mut last_snapshot: Option<ClusterSnapshot> = None;
        let mut last_error: Option<String> = None;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(condition)),
                r = tokio::time::timeout(remaining, self.snapshot()) => r,
            };

            match fetched {
                Ok(Ok(snapshot)) => {
                    if predicate(&snapshot) {
                        tracing::debug!(%condition, attempts, elapsed = ?started.elapsed(), "condition met");
                        return Ok(PollSuccess {
                            snapshot,
                            attempts,
                            elapsed: started.elapsed(),
                        });
                    }
                    last_snapshot = Some(snapshot);
                    last_error = None;
                }
                Ok(Err(e)) => {
                    tracing::debug!(%condition, attempts, error = %e, "snapshot fetch failed");
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    last_error = Some("snapshot fetch did not finish before the deadline".into());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let elapsed = now - started;
                tracing::warn!(%condition, attempts, ?elapsed, "condition not met");
                return Err(HarnessError::OperationTimeout {
                    condition: condition.to_string(),
                    elapsed,
                    attempts,
                    last_snapshot: last_snapshot.map(Box::new),
                    last_error,
                });
            }

            let pause = self.settings.interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(condition)),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    fn cancelled(&self, condition: &str) -> HarnessError {
        tracing::info!(%condition, "wait cancelled");
        HarnessError::Cancelled {
            condition: condition.to_string(),
        }
    }

    /// Wait for `STABLE`.
    pub async fn wait_for_stable(&self) -> Result<PollSuccess> {
        self.wait_for("cluster STABLE", predicates::is_stable).await
    }

    /// Wait for `DEGRADED`.
    pub async fn wait_for_degraded(&self) -> Result<PollSuccess> {
        self.wait_for("cluster DEGRADED", predicates::is_degraded).await
    }

    /// Wait for `UNAVAILABLE`.
    pub async fn wait_for_unavailable(&self) -> Result<PollSuccess> {
        self.wait_for("cluster UNAVAILABLE", predicates::is_unavailable)
            .await
    }

    /// Wait until exactly `count` servers are unresponsive.
    pub async fn wait_for_unresponsive_count(&self, count: usize) -> Result<PollSuccess> {
        self.wait_for(&format!("{} unresponsive servers", count), |s| {
            predicates::unresponsive_count_is(s, count)
        })
        .await
    }

    /// Wait until `node` is listed as unresponsive.
    pub async fn wait_for_unresponsive(&self, node: &NodeId) -> Result<PollSuccess> {
        self.wait_for(&format!("{} unresponsive", node), |s| {
            predicates::is_unresponsive(s, node)
        })
        .await
    }

    /// Wait until `node` is no longer listed as unresponsive.
    pub async fn wait_for_responsive(&self, node: &NodeId) -> Result<PollSuccess> {
        self.wait_for(&format!("{} responsive", node), |s| {
            predicates::is_responsive(s, node)
        })
        .await
    }

    /// Wait for an epoch strictly greater than `baseline`.
    pub async fn wait_for_layout_change(&self, baseline: u64) -> Result<PollSuccess> {
        self.wait_for(&format!("epoch > {}", baseline), |s| {
            predicates::epoch_after(s, baseline)
        })
        .await
    }

    /// Wait for an epoch of at least `epoch`.
    pub async fn wait_for_epoch_at_least(&self, epoch: u64) -> Result<PollSuccess> {
        self.wait_for(&format!("epoch >= {}", epoch), |s| {
            predicates::epoch_at_least(s, epoch)
        })
        .await
    }

    /// Take the current epoch as baseline and wait for it to advance.
    pub async fn wait_for_next_epoch(&self) -> Result<PollSuccess> {
        let baseline = self.snapshot().await?.layout.epoch;
        self.wait_for_layout_change(baseline).await
    }

    /// Wait for an arbitrary predicate over the full layout.
    pub async fn wait_for_layout<F>(&self, description: &str, predicate: F) -> Result<PollSuccess>
    where
        F: Fn(&Layout) -> bool + Send + Sync,
    {
        self.wait_for(description, |s| predicate(&s.layout)).await
    }
}
