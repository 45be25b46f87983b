//! Management API served from a [`SimFabric`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fault_types::{ClusterStatusReport, Layout, NodeId};

use super::SimFabric;
use crate::management::{ManagementClient, ManagementConnector, ManagementError};

/// Simulated management client.
///
/// Every client keeps its own layout cache, like the HTTP client does, so a
/// stale read is possible until `invalidate_layout_cache` is called.
pub struct SimCluster {
    fabric: SimFabric,
    cache: Mutex<Option<Layout>>,
}

impl SimCluster {
    /// Client over `fabric`.
    pub fn new(fabric: SimFabric) -> Self {
        Self {
            fabric,
            cache: Mutex::new(None),
        }
    }

    fn membership_guard(&self, endpoint: &NodeId) -> Result<Layout, ManagementError> {
        let mut state = self.fabric.lock();
        state.observe()?;
        let Some(layout) = state.layout.clone() else {
            return Err(ManagementError::Rejected("cluster not bootstrapped".into()));
        };
        if !state.quorum_available(&layout) {
            return Err(ManagementError::Rejected("no quorum of layout servers".into()));
        }
        if !state.members.contains_key(endpoint) {
            return Err(ManagementError::Rejected(format!("unknown endpoint {}", endpoint)));
        }
        Ok(layout)
    }

    fn commit(&self, layout: Layout) {
        let mut state = self.fabric.lock();
        state.layout = Some(layout);
        state.report = None;
        let _ = state.observe();
    }
}

#[async_trait]
impl ManagementClient for SimCluster {
    async fn get_layout(&self) -> Result<Layout, ManagementError> {
        if let Some(layout) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Ok(layout);
        }
        let layout = {
            let mut state = self.fabric.lock();
            state.observe()?;
            state
                .layout
                .clone()
                .ok_or_else(|| ManagementError::Rejected("cluster not bootstrapped".into()))?
        };
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(layout.clone());
        Ok(layout)
    }

    async fn get_cluster_status(&self) -> Result<ClusterStatusReport, ManagementError> {
        let mut state = self.fabric.lock();
        state.observe()?;
        state
            .report
            .clone()
            .ok_or_else(|| ManagementError::Rejected("no status report".into()))
    }

    fn invalidate_layout_cache(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    async fn bootstrap(&self, layout: &Layout) -> Result<(), ManagementError> {
        {
            let mut state = self.fabric.lock();
            state.bootstrap_attempts += 1;
            if state.management_down {
                return Err(ManagementError::Unreachable("management gateway down".into()));
            }
            if state.bootstrap_failures > 0 {
                state.bootstrap_failures -= 1;
                return Err(ManagementError::Unreachable("bootstrap target not ready".into()));
            }
            if let Some(existing) = &state.layout {
                if existing.cluster_id == layout.cluster_id {
                    return Ok(());
                }
                return Err(ManagementError::Rejected("already bootstrapped".into()));
            }
            layout
                .validate()
                .map_err(|e| ManagementError::Rejected(e.to_string()))?;
        }
        self.commit(layout.clone());
        self.invalidate_layout_cache();
        tracing::debug!(servers = layout.servers.len(), "sim cluster bootstrapped");
        Ok(())
    }

    async fn add_node(
        &self,
        endpoint: &NodeId,
        _retries: u32,
        _timeout: Duration,
        _poll_period: Duration,
    ) -> Result<(), ManagementError> {
        let mut layout = self.membership_guard(endpoint)?;
        if !layout.contains(endpoint) {
            if !self.fabric.lock().is_up(endpoint) {
                return Err(ManagementError::Rejected(format!("{} is not running", endpoint)));
            }
            layout.servers.push(endpoint.clone());
            layout.sequencers.push(endpoint.clone());
            if let Some(stripe) = layout
                .segments
                .last_mut()
                .and_then(|s| s.stripes.first_mut())
            {
                stripe.log_servers.push(endpoint.clone());
            }
            layout.epoch += 1;
            self.commit(layout);
        }
        self.invalidate_layout_cache();
        Ok(())
    }

    async fn remove_node(
        &self,
        endpoint: &NodeId,
        _retries: u32,
        _timeout: Duration,
        _poll_period: Duration,
    ) -> Result<(), ManagementError> {
        let mut layout = self.membership_guard(endpoint)?;
        if layout.contains(endpoint) {
            if layout.servers.len() == 1 {
                return Err(ManagementError::Rejected("cannot remove the last server".into()));
            }
            layout.servers.retain(|n| n != endpoint);
            layout.sequencers.retain(|n| n != endpoint);
            for segment in &mut layout.segments {
                for stripe in &mut segment.stripes {
                    stripe.log_servers.retain(|n| n != endpoint);
                }
            }
            layout.unresponsive_servers.remove(endpoint);
            layout.epoch += 1;
            self.commit(layout);
        }
        self.invalidate_layout_cache();
        Ok(())
    }

    async fn reset(&self, endpoint: &NodeId) -> Result<(), ManagementError> {
        let mut state = self.fabric.lock();
        if state.management_down {
            return Err(ManagementError::Unreachable("management gateway down".into()));
        }
        if !state.is_up(endpoint) {
            return Err(ManagementError::Rejected(format!("{} is not running", endpoint)));
        }
        if let Some(member) = state.members.get_mut(endpoint) {
            member.resets += 1;
        }
        Ok(())
    }
}

impl ManagementConnector for SimCluster {
    fn connect(&self, _endpoints: &[NodeId]) -> Result<Arc<dyn ManagementClient>, ManagementError> {
        Ok(Arc::new(SimCluster::new(self.fabric.clone())))
    }
}
