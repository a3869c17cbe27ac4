//! Per-migration execution state.
//!
//! ```text
//! PENDING -> APPLYING -> APPLIED -> REVERTING -> REVERTED
//!               |                                  |
//!               +-> FAILED -> ROLLED_BACK          +-> (APPLYING again)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MigrateError, Result};

/// Where a migration is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    /// Known but never applied.
    Pending,
    /// Up statements are running.
    Applying,
    /// Up statements ran; the ledger says applied.
    Applied,
    /// An up statement failed.
    Failed,
    /// The down statements of a failed migration ran successfully.
    RolledBack,
    /// Down statements of an applied migration are running.
    Reverting,
    /// Explicitly undone.
    Reverted,
}

impl MigrationState {
    /// Upper-case state name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Applying => "APPLYING",
            Self::Applied => "APPLIED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Reverting => "REVERTING",
            Self::Reverted => "REVERTED",
        }
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Pending | RolledBack | Reverted, Applying)
                | (Applying, Applied | Failed)
                | (Failed, RolledBack)
                | (Applied, Reverting)
                | (Reverting, Reverted | Failed)
        )
    }

    /// Returns `next`, or [`MigrateError::InvalidTransition`].
    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(MigrateError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one migration during a run, logging every transition.
#[derive(Debug, Clone)]
pub struct MigrationRun {
    version: String,
    state: MigrationState,
}

impl MigrationRun {
    /// Starts tracking `version` in `state`.
    pub fn new(version: impl Into<String>, state: MigrationState) -> Self {
        Self {
            version: version.into(),
            state,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Moves to `next`.
    pub fn advance(&mut self, next: MigrationState) -> Result<()> {
        let from = self.state;
        self.state = from.transition(next)?;
        debug!(version = %self.version, from = %from, to = %next, "Migration state changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_apply_path() {
        let mut run = MigrationRun::new("1", MigrationState::Pending);
        run.advance(MigrationState::Applying).unwrap();
        run.advance(MigrationState::Applied).unwrap();
        assert_eq!(run.state(), MigrationState::Applied);
    }

    #[test]
    fn failure_and_revert_paths() {
        let mut run = MigrationRun::new("1", MigrationState::Pending);
        for next in [
            MigrationState::Applying,
            MigrationState::Failed,
            MigrationState::RolledBack,
            MigrationState::Applying,
            MigrationState::Applied,
            MigrationState::Reverting,
            MigrationState::Reverted,
        ] {
            run.advance(next).unwrap();
        }
        assert_eq!(run.state(), MigrationState::Reverted);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let err = MigrationState::Pending
            .transition(MigrationState::Applied)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Illegal migration state transition PENDING -> APPLIED"
        );
        assert!(!MigrationState::Applied.can_transition_to(MigrationState::Applying));
        assert!(!MigrationState::Reverted.can_transition_to(MigrationState::Reverting));

        let mut run = MigrationRun::new("1", MigrationState::Applied);
        assert!(run.advance(MigrationState::Failed).is_err());
        assert_eq!(run.state(), MigrationState::Applied);
    }

    #[test]
    fn serializes_as_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&MigrationState::RolledBack).unwrap(),
            "\"ROLLED_BACK\""
        );
    }
}
