//! Migration state machine

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Phase of a single migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    Idle,
    ValidatingPreconditions,
    ProvisioningManagedTargets,
    /// Cross-cluster only: waiting for the destination to accept the volumes
    AwaitingDestinationReady,
    Migrating,
    Completing,
    Finalizing,
    RollingBack,
    Done,
    Failed,
}

impl MotionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionState::Idle => "idle",
            MotionState::ValidatingPreconditions => "validating_preconditions",
            MotionState::ProvisioningManagedTargets => "provisioning_managed_targets",
            MotionState::AwaitingDestinationReady => "awaiting_destination_ready",
            MotionState::Migrating => "migrating",
            MotionState::Completing => "completing",
            MotionState::Finalizing => "finalizing",
            MotionState::RollingBack => "rolling_back",
            MotionState::Done => "done",
            MotionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MotionState::Done | MotionState::Failed)
    }

    pub fn can_transition_to(&self, next: MotionState) -> bool {
        use MotionState::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, ValidatingPreconditions)
                | (ValidatingPreconditions, ProvisioningManagedTargets)
                | (ValidatingPreconditions, Migrating)
                | (ProvisioningManagedTargets, AwaitingDestinationReady)
                | (AwaitingDestinationReady, Migrating)
                | (AwaitingDestinationReady, RollingBack)
                | (Migrating, Completing)
                | (Migrating, Finalizing)
                | (Migrating, RollingBack)
                | (Completing, Finalizing)
                | (Finalizing, Done)
        )
    }
}

impl std::fmt::Display for MotionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tracks the current state of one migration and the path taken
#[derive(Debug, Clone)]
pub struct MotionTracker {
    state: MotionState,
    history: Vec<MotionState>,
}

impl Default for MotionTracker {
    fn default() -> Self {
        Self {
            state: MotionState::Idle,
            history: vec![MotionState::Idle],
        }
    }
}

impl MotionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn history(&self) -> &[MotionState] {
        &self.history
    }

    pub fn advance(&mut self, next: MotionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Migration state {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Failed` unless already terminal
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = MotionState::Failed;
            self.history.push(MotionState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use super::MotionState::*;

    #[test]
    fn test_cross_cluster_path() {
        let mut tracker = MotionTracker::new();
        for next in [
            ValidatingPreconditions,
            ProvisioningManagedTargets,
            AwaitingDestinationReady,
            Migrating,
            Completing,
            Finalizing,
            Done,
        ] {
            tracker.advance(next).unwrap();
        }
        assert_eq!(tracker.state(), Done);
        assert_eq!(tracker.history().len(), 8);
    }

    #[test]
    fn test_rollback_only_after_destination_engaged() {
        assert!(AwaitingDestinationReady.can_transition_to(RollingBack));
        assert!(Migrating.can_transition_to(RollingBack));
        assert!(!ProvisioningManagedTargets.can_transition_to(RollingBack));
        assert!(!Completing.can_transition_to(RollingBack));
        assert!(RollingBack.can_transition_to(Failed));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut tracker = MotionTracker::new();
        let err = tracker.advance(Completing).unwrap_err();
        assert_matches!(err, Error::InvalidTransition { ref from, ref to }
            if from == "idle" && to == "completing");
        assert_eq!(tracker.state(), Idle);
    }

    #[test]
    fn test_fail_is_idempotent() {
        let mut tracker = MotionTracker::new();
        tracker.fail();
        assert_eq!(tracker.state(), Failed);
        tracker.fail();
        assert_eq!(tracker.history(), &[Idle, Failed]);
    }
}
