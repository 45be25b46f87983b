//! Structural state of a deployed cluster.

use std::fmt;

use crate::error::{HarnessError, Result};

/// Where a cluster is in its deploy/teardown lifecycle.
///
/// Faults and heals do not change this state: a degraded cluster is still
/// `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterState {
    /// Nothing provisioned yet.
    Undeployed,
    /// Nodes are being provisioned.
    Deploying,
    /// Initial layout is being submitted.
    Bootstrapping,
    /// Usable for scenarios.
    Ready,
    /// Resources are being released.
    TearingDown,
    /// All resources released.
    Destroyed,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterState::Undeployed => "UNDEPLOYED",
            ClusterState::Deploying => "DEPLOYING",
            ClusterState::Bootstrapping => "BOOTSTRAPPING",
            ClusterState::Ready => "READY",
            ClusterState::TearingDown => "TEARING_DOWN",
            ClusterState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

impl ClusterState {
    /// Whether `next` may follow `self`.
    ///
    /// The forward chain, plus an abort edge into `TearingDown` from the two
    /// deploy phases.
    pub fn can_advance_to(self, next: ClusterState) -> bool {
        use ClusterState::*;
        matches!(
            (self, next),
            (Undeployed, Deploying)
                | (Deploying, Bootstrapping)
                | (Bootstrapping, Ready)
                | (Ready, TearingDown)
                | (TearingDown, Destroyed)
                | (Deploying, TearingDown)
                | (Bootstrapping, TearingDown)
        )
    }
}

/// Guarded [`ClusterState`] holder.
#[derive(Debug, Clone)]
pub struct ClusterLifecycle {
    state: ClusterState,
}

impl Default for ClusterLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterLifecycle {
    /// Start in `Undeployed`.
    pub fn new() -> Self {
        Self {
            state: ClusterState::Undeployed,
        }
    }

    /// Current state.
    pub fn state(&self) -> ClusterState {
        self.state
    }

    /// Move to `next`, or fail with `InvalidState`.
    pub fn advance(&mut self, next: ClusterState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(HarnessError::InvalidState {
                expected: format!("a state that may precede {}", next),
                actual: self.state.to_string(),
            });
        }
        tracing::debug!(from = %self.state, to = %next, "cluster state");
        self.state = next;
        Ok(())
    }

    /// Fail with `InvalidState` unless in `expected`.
    pub fn require(&self, expected: ClusterState) -> Result<()> {
        if self.state != expected {
            return Err(HarnessError::InvalidState {
                expected: expected.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_forward_chain() {
        let mut lc = ClusterLifecycle::new();
        for next in [
            ClusterState::Deploying,
            ClusterState::Bootstrapping,
            ClusterState::Ready,
            ClusterState::TearingDown,
            ClusterState::Destroyed,
        ] {
            lc.advance(next).unwrap();
        }
        assert_eq!(lc.state(), ClusterState::Destroyed);
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        let mut lc = ClusterLifecycle::new();
        let err = lc.advance(ClusterState::Ready).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
        assert_eq!(lc.state(), ClusterState::Undeployed);
    }

    #[test]
    fn deploy_phases_can_abort() {
        assert!(ClusterState::Deploying.can_advance_to(ClusterState::TearingDown));
        assert!(ClusterState::Bootstrapping.can_advance_to(ClusterState::TearingDown));
        assert!(!ClusterState::Destroyed.can_advance_to(ClusterState::Deploying));
        assert!(!ClusterState::Ready.can_advance_to(ClusterState::Deploying));
    }

    #[test]
    fn require_reports_actual_state() {
        let lc = ClusterLifecycle::new();
        let err = lc.require(ClusterState::Ready).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid cluster state: expected READY, found UNDEPLOYED"
        );
    }
}
