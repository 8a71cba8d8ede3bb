//! Installation error taxonomy.
//!
//! Stage implementations use `anyhow` internally and convert into
//! [`InstallError`] at their boundary, so callers get a structured error that
//! names the failing package, hash and stage.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Category of an installation failure. This is the payload of
/// `InstallState::Failed` and determines the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Prerequisite,
    Provision,
    Fetch,
    Integrity,
    Cycle,
    DependencyConflict,
    InstallStep,
    LinkConflict,
    Verification,
    Cancelled,
    Other,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Provision => 10,
            ErrorKind::Fetch => 11,
            ErrorKind::Integrity => 12,
            ErrorKind::Cycle => 13,
            ErrorKind::DependencyConflict => 14,
            ErrorKind::LinkConflict => 15,
            ErrorKind::Verification => 16,
            ErrorKind::Prerequisite => 17,
            ErrorKind::InstallStep => 18,
            ErrorKind::Cancelled => 19,
            ErrorKind::Other => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Prerequisite => "PrerequisiteError",
            ErrorKind::Provision => "ProvisionError",
            ErrorKind::Fetch => "FetchError",
            ErrorKind::Integrity => "IntegrityError",
            ErrorKind::Cycle => "CycleError",
            ErrorKind::DependencyConflict => "DependencyConflictError",
            ErrorKind::InstallStep => "InstallStepError",
            ErrorKind::LinkConflict => "LinkConflictError",
            ErrorKind::Verification => "VerificationError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Other => "Error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("prerequisite '{name}' is not satisfied: {reason}")]
    Prerequisite { name: String, reason: String },

    #[error("cannot provision environment at {root:?}: {reason}")]
    Provision { root: PathBuf, reason: String },

    #[error("failed to fetch {package} from {url}: {reason}")]
    Fetch {
        package: String,
        url: String,
        reason: String,
    },

    #[error("integrity check failed for {package}: expected sha256 {expected}, got {actual}")]
    Integrity {
        package: String,
        expected: String,
        actual: String,
    },

    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    Cycle { cycle: Vec<String> },

    #[error("dependency conflict for {name}: {reason}")]
    DependencyConflict { name: String, reason: String },

    #[error(
        "failed to install {package} (already installed: {}): {reason}",
        format_list(.installed)
    )]
    InstallStep {
        package: String,
        installed: Vec<String>,
        reason: String,
    },

    #[error("{link:?} already exists and does not point into {env:?}")]
    LinkConflict { link: PathBuf, env: PathBuf },

    #[error("verification of {executable:?} failed: {reason}")]
    Verification { executable: PathBuf, reason: String },

    #[error("installation cancelled (already installed: {})", format_list(.installed))]
    Cancelled { installed: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InstallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstallError::Prerequisite { .. } => ErrorKind::Prerequisite,
            InstallError::Provision { .. } => ErrorKind::Provision,
            InstallError::Fetch { .. } => ErrorKind::Fetch,
            InstallError::Integrity { .. } => ErrorKind::Integrity,
            InstallError::Cycle { .. } => ErrorKind::Cycle,
            InstallError::DependencyConflict { .. } => ErrorKind::DependencyConflict,
            InstallError::InstallStep { .. } => ErrorKind::InstallStep,
            InstallError::LinkConflict { .. } => ErrorKind::LinkConflict,
            InstallError::Verification { .. } => ErrorKind::Verification,
            InstallError::Cancelled { .. } => ErrorKind::Cancelled,
            InstallError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub(crate) fn provision(root: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        InstallError::Provision {
            root: root.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn conflict(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        InstallError::DependencyConflict {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::new(),
    }
}

fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::Prerequisite,
            ErrorKind::Provision,
            ErrorKind::Fetch,
            ErrorKind::Integrity,
            ErrorKind::Cycle,
            ErrorKind::DependencyConflict,
            ErrorKind::InstallStep,
            ErrorKind::LinkConflict,
            ErrorKind::Verification,
            ErrorKind::Cancelled,
            ErrorKind::Other,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_cycle_display_closes_the_loop() {
        let err = InstallError::Cycle {
            cycle: vec!["A".to_string(), "B".to_string()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: A -> B -> A");
        assert_eq!(err.kind(), ErrorKind::Cycle);
    }

    #[test]
    fn test_install_step_display_lists_installed_set() {
        let err = InstallError::InstallStep {
            package: "c".to_string(),
            installed: vec!["a".to_string(), "b".to_string()],
            reason: "boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("failed to install c"));
        assert!(msg.contains("a, b"));

        let err = InstallError::Cancelled { installed: vec![] };
        assert!(err.to_string().contains("none"));
    }

    #[test]
    fn test_other_wraps_anyhow() {
        let err: InstallError = anyhow::anyhow!("bad manifest").into();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(err.exit_code(), 1);
    }
}
