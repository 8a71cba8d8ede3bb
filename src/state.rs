//! Installation state machine.
//!
//! `Pending → Provisioned → Fetched → Resolved → Linked → Verified`, with
//! `Failed(kind)` reachable from any non-terminal state.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallState {
    Pending,
    Provisioned,
    Fetched,
    Resolved,
    Linked,
    Verified,
    Failed(ErrorKind),
}

impl InstallState {
    /// The only state this one may advance to on success.
    pub fn next(self) -> Option<InstallState> {
        match self {
            InstallState::Pending => Some(InstallState::Provisioned),
            InstallState::Provisioned => Some(InstallState::Fetched),
            InstallState::Fetched => Some(InstallState::Resolved),
            InstallState::Resolved => Some(InstallState::Linked),
            InstallState::Linked => Some(InstallState::Verified),
            InstallState::Verified | InstallState::Failed(_) => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstallState::Verified | InstallState::Failed(_))
    }

    /// Move to `to`, which must be the immediate successor.
    pub fn advance(self, to: InstallState) -> Result<InstallState> {
        match self.next() {
            Some(next) if next == to => Ok(to),
            _ => bail!("invalid state transition {} -> {}", self, to),
        }
    }

    /// Move to `Failed(kind)`. Terminal states stay as they are.
    pub fn fail(self, kind: ErrorKind) -> InstallState {
        if self.is_terminal() {
            self
        } else {
            InstallState::Failed(kind)
        }
    }
}

impl std::fmt::Display for InstallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallState::Pending => f.write_str("Pending"),
            InstallState::Provisioned => f.write_str("Provisioned"),
            InstallState::Fetched => f.write_str("Fetched"),
            InstallState::Resolved => f.write_str("Resolved"),
            InstallState::Linked => f.write_str("Linked"),
            InstallState::Verified => f.write_str("Verified"),
            InstallState::Failed(kind) => write!(f, "Failed({})", kind),
        }
    }
}
