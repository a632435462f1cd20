//! Per (workspace, device) sync bookkeeping.
//!
//! Persisted in the `sync_state` table; see [`crate::storage::Database::load_sync_state`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clock::VectorClock;

/// Causal and operational state of one device within one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub workspace_id: Uuid,
    pub device_id: String,
    /// When the last successful push or pull finished.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Last remote commit this device is known to be in sync with.
    pub last_sync_commit: Option<String>,
    /// Everything this device has observed, including its own events.
    pub vector_clock: VectorClock,
    /// Local events not yet reflected in `last_sync_commit`.
    pub pending_changes: u64,
}

impl SyncState {
    /// Fresh state with an empty clock.
    pub fn new(workspace_id: Uuid, device_id: &str) -> Self {
        Self {
            workspace_id,
            device_id: device_id.to_string(),
            last_sync_at: None,
            last_sync_commit: None,
            vector_clock: VectorClock::new(),
            pending_changes: 0,
        }
    }

    /// Advances this device's counter for a new local event and returns
    /// the clock to stamp it with.
    pub fn tick(&mut self) -> VectorClock {
        self.vector_clock.increment(&self.device_id);
        self.pending_changes += 1;
        self.vector_clock.clone()
    }

    /// Records a successful push of `pushed` events at `commit`.
    ///
    /// Events recorded while the push was in flight stay pending.
    pub fn record_push(&mut self, commit: &str, pushed: u64) {
        self.last_sync_at = Some(Utc::now());
        self.last_sync_commit = Some(commit.to_string());
        self.pending_changes = self.pending_changes.saturating_sub(pushed);
    }

    /// Records a successful pull up to the remote `commit`, folding in
    /// everything observed from the remote.
    pub fn record_pull(&mut self, commit: &str, observed: &VectorClock) {
        self.last_sync_at = Some(Utc::now());
        self.last_sync_commit = Some(commit.to_string());
        self.observe(observed);
    }

    /// Folds in remote events that were handled without a completed pull.
    pub fn observe(&mut self, observed: &VectorClock) {
        self.vector_clock.merge(observed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_empty() {
        let state = SyncState::new(Uuid::new_v4(), "laptop");
        assert!(state.vector_clock.is_empty());
        assert_eq!(state.pending_changes, 0);
        assert!(state.last_sync_at.is_none());
        assert!(state.last_sync_commit.is_none());
    }

    #[test]
    fn test_tick_advances_own_counter_and_pending() {
        let mut state = SyncState::new(Uuid::new_v4(), "laptop");
        let first = state.tick();
        let second = state.tick();

        assert_eq!(first.get("laptop"), 1);
        assert_eq!(second.get("laptop"), 2);
        assert_eq!(state.pending_changes, 2);
    }

    #[test]
    fn test_record_push_keeps_concurrent_pending() {
        let mut state = SyncState::new(Uuid::new_v4(), "laptop");
        state.tick();
        state.tick();
        state.tick();

        state.record_push("abc123", 2);
        assert_eq!(state.pending_changes, 1);
        assert_eq!(state.last_sync_commit.as_deref(), Some("abc123"));
        assert!(state.last_sync_at.is_some());

        state.record_push("def456", 5);
        assert_eq!(state.pending_changes, 0);
    }

    #[test]
    fn test_record_pull_merges_clock() {
        let mut state = SyncState::new(Uuid::new_v4(), "laptop");
        state.tick();
        state.record_pull("abc123", &VectorClock::from([("desktop", 4)]));

        assert_eq!(state.vector_clock.get("laptop"), 1);
        assert_eq!(state.vector_clock.get("desktop"), 4);
        assert_eq!(state.pending_changes, 1);
    }

    #[test]
    fn test_sync_state_serialization() {
        let mut state = SyncState::new(Uuid::new_v4(), "laptop");
        state.tick();
        let json = serde_json::to_string(&state).unwrap();
        let parsed: SyncState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
