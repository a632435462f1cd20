//! Multi-device synchronization over git.
//!
//! Local mutations are recorded as [`ChangeEvent`]s stamped with a
//! [`VectorClock`], appended to a per-device log inside a git working
//! tree, and exchanged through a remote repository. Pulling replays remote
//! events that the local clock has not observed yet; concurrent edits of
//! the same entity are flagged as conflicts instead of being merged.
//!
//! # Components
//!
//! - [`ChangeTracker`] - process-wide entry point for mutations; routes
//!   them to workspaces and owns the adapter registry
//! - [`SyncAdapter`] - one workspace's working tree, push and pull
//! - [`SyncState`] / [`VectorClock`] - causal bookkeeping per device
//! - [`snapshot`] - deterministic export of a workspace's records
//! - [`periodic`] - interval-driven auto sync for `lore sync watch`

pub mod adapter;
pub mod clock;
pub mod conflict;
pub mod event;
pub mod periodic;
pub mod snapshot;
pub mod state;
pub mod tracker;

use serde::Serialize;
use std::path::PathBuf;

pub use adapter::{AdapterPhase, SyncAdapter};
pub use clock::{ClockOrder, VectorClock};
pub use conflict::{ReplayDecision, SyncConflict};
pub use event::{Change, ChangeEvent, ChangeMetadata, ChangeOperation, EntityKind};
pub use state::SyncState;
pub use tracker::{BackgroundError, ChangeTracker, TrackerSettings};

/// Errors that abort a sync operation before it touches any state.
///
/// Transport failures are not represented here; they are reported in the
/// `errors` list of [`PushResult`] and [`PullResult`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No workspace with that id or name.
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// No workspace was named and none is marked default.
    #[error("No default workspace. Pass a workspace name or run 'lore workspace default <name>'.")]
    NoDefaultWorkspace,

    /// Sync is switched off for the workspace.
    #[error("Sync is disabled for workspace '{0}'")]
    SyncDisabled(String),

    /// The workspace has no remote repository.
    #[error("Workspace '{0}' has no remote repository. Run 'lore workspace set {0} --repo <url>' first.")]
    NoRemote(String),

    /// The local working tree could not be prepared.
    #[error("Failed to prepare sync working tree at {path}: {message}")]
    Setup { path: PathBuf, message: String },

    /// Git failure during setup.
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// Database failure during setup or resolution.
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Outcome of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushResult {
    /// Change events included in the pushed commit(s)
    pub pushed: u64,
    pub errors: Vec<String>,
}

impl PushResult {
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            pushed: 0,
            errors: vec![format!("{error:#}")],
        }
    }
}

/// Outcome of a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullResult {
    /// Remote events applied locally
    pub pulled: u64,
    /// Remote events that conflicted with local edits
    pub conflicts: u64,
    pub errors: Vec<String>,
}

impl PullResult {
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            errors: vec![format!("{error:#}")],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display_no_remote() {
        let err = SyncError::NoRemote("team".to_string());
        assert!(err.to_string().contains("team"));
        assert!(err.to_string().contains("--repo"));
    }

    #[test]
    fn test_sync_error_display_setup() {
        let err = SyncError::Setup {
            path: PathBuf::from("/nope"),
            message: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/nope"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_failed_results_carry_error() {
        assert_eq!(PushResult::failed("offline").errors, vec!["offline"]);
        let pull = PullResult::failed("offline");
        assert_eq!(pull.pulled, 0);
        assert_eq!(pull.errors, vec!["offline"]);
    }
}
