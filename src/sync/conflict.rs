//! Conflict detection for replayed remote events.
//!
//! Conflicts are flagged, never auto-merged: the local entity stays as it
//! is and both versions are retained for manual resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clock::{ClockOrder, VectorClock};
use super::event::{ChangeEvent, EntityKind};

/// What to do with a remote event for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDecision {
    /// Remote causally follows the local version.
    Apply,
    /// Local and remote edited the entity without seeing each other.
    Conflict,
    /// Local already supersedes the remote event.
    Stale,
}

/// Decides how to replay a remote event given the local clock of the
/// entity it touches. An entity with no local history accepts anything.
pub fn classify(local: Option<&VectorClock>, remote: &VectorClock) -> ReplayDecision {
    let Some(local) = local else {
        return ReplayDecision::Apply;
    };

    match remote.compare(local) {
        ClockOrder::After => ReplayDecision::Apply,
        ClockOrder::Concurrent => ReplayDecision::Conflict,
        ClockOrder::Before | ClockOrder::Equal => ReplayDecision::Stale,
    }
}

/// A detected conflict with both versions of the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub entity: EntityKind,
    pub entity_id: String,
    /// Local version at detection time (`None` if deleted locally)
    pub local_data: Option<serde_json::Value>,
    /// Version carried by the remote event (`None` for deletes)
    pub remote_data: Option<serde_json::Value>,
    pub local_clock: VectorClock,
    pub remote_clock: VectorClock,
    pub remote_event_id: String,
    pub remote_device_id: String,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

impl SyncConflict {
    pub fn new(
        workspace_id: Uuid,
        remote: &ChangeEvent,
        local_data: Option<serde_json::Value>,
        local_clock: VectorClock,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            entity: remote.entity,
            entity_id: remote.entity_id.clone(),
            local_data,
            remote_data: remote.data.clone(),
            local_clock,
            remote_clock: remote.clock.clone(),
            remote_event_id: remote.id.clone(),
            remote_device_id: remote.device_id.clone(),
            detected_at: Utc::now(),
            resolved: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_local_history_applies() {
        let remote = VectorClock::from([("A", 1)]);
        assert_eq!(classify(None, &remote), ReplayDecision::Apply);
    }

    #[test]
    fn test_remote_strictly_ahead_applies() {
        let local = VectorClock::from([("A", 1), ("B", 1)]);
        let remote = VectorClock::from([("A", 2), ("B", 1)]);
        assert_eq!(classify(Some(&local), &remote), ReplayDecision::Apply);
    }

    #[test]
    fn test_concurrent_edits_conflict() {
        let local = VectorClock::from([("A", 1), ("B", 2)]);
        let remote = VectorClock::from([("A", 2), ("B", 1)]);
        assert_eq!(classify(Some(&local), &remote), ReplayDecision::Conflict);
    }

    #[test]
    fn test_superseded_remote_is_stale() {
        let local = VectorClock::from([("A", 3), ("B", 1)]);
        let remote = VectorClock::from([("A", 2), ("B", 1)]);
        assert_eq!(classify(Some(&local), &remote), ReplayDecision::Stale);
        assert_eq!(classify(Some(&local), &local.clone()), ReplayDecision::Stale);
    }
}
