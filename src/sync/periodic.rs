//! Periodic auto-sync for `lore sync watch`.
//!
//! Every auto-sync workspace with a remote is pulled and then pushed once
//! per its `sync_interval`. The loop runs until the shutdown signal fires.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use uuid::Uuid;

use super::tracker::ChangeTracker;
use super::{PullResult, PushResult};
use crate::storage::{lock_db, SharedDatabase, Workspace};

/// How often the loop checks for due workspaces.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Longest honored sync interval, one year in seconds.
pub const MAX_SYNC_INTERVAL: u64 = 365 * 24 * 60 * 60;

/// Next due time per workspace.
#[derive(Debug, Default)]
pub struct Schedule {
    next_due: HashMap<Uuid, DateTime<Utc>>,
}

impl Schedule {
    /// Workspaces that should sync at `now`. Never-synced workspaces are
    /// due immediately.
    pub fn due(&self, workspaces: &[Workspace], now: DateTime<Utc>) -> Vec<Workspace> {
        workspaces
            .iter()
            .filter(|w| w.sync_enabled && w.auto_sync && w.sync_repo.is_some())
            .filter(|w| self.next_due.get(&w.id).map_or(true, |next| *next <= now))
            .cloned()
            .collect()
    }

    /// Schedules the next run one interval after `now`.
    pub fn completed(&mut self, workspace: &Workspace, now: DateTime<Utc>) {
        let seconds = workspace.sync_interval.clamp(1, MAX_SYNC_INTERVAL) as i64;
        let next = now
            .checked_add_signed(chrono::Duration::seconds(seconds))
            .unwrap_or(now);
        self.next_due.insert(workspace.id, next);
    }

    pub fn next_due(&self, workspace_id: &Uuid) -> Option<DateTime<Utc>> {
        self.next_due.get(workspace_id).copied()
    }
}

/// Outcome of one pull-then-push round.
#[derive(Debug, Default)]
pub struct SyncRound {
    pub pull: PullResult,
    pub push: PushResult,
}

impl SyncRound {
    pub fn errors(&self) -> impl Iterator<Item = &String> {
        self.pull.errors.iter().chain(self.push.errors.iter())
    }
}

/// Pulls then pushes one workspace. Blocking.
pub fn sync_workspace(tracker: &ChangeTracker, workspace: &Workspace) -> SyncRound {
    let adapter = match tracker.adapter_for(workspace) {
        Ok(adapter) => adapter,
        Err(e) => {
            return SyncRound {
                pull: PullResult::failed(&e),
                push: PushResult::default(),
            }
        }
    };

    let pull = adapter.pull().unwrap_or_else(PullResult::failed);
    let push = adapter.push().unwrap_or_else(PushResult::failed);
    SyncRound { pull, push }
}

/// Runs the periodic sync loop until `shutdown_rx` fires.
pub async fn run_periodic_sync(
    tracker: Arc<ChangeTracker>,
    db: SharedDatabase,
    check_every: Duration,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut schedule = Schedule::default();
    let mut check_interval = interval(check_every);

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                let workspaces = match lock_db(&db).and_then(|db| db.list_workspaces()) {
                    Ok(workspaces) => workspaces,
                    Err(e) => {
                        tracing::warn!("Periodic sync could not list workspaces: {e:#}");
                        continue;
                    }
                };

                for workspace in schedule.due(&workspaces, Utc::now()) {
                    let worker = Arc::clone(&tracker);
                    let target = workspace.clone();
                    let round = tokio::task::spawn_blocking(move || sync_workspace(&worker, &target)).await;

                    match round {
                        Ok(round) => {
                            let failures: Vec<&String> = round.errors().collect();
                            if failures.is_empty() {
                                tracing::info!(
                                    "Periodic sync of '{}': pulled {}, conflicts {}, pushed {}",
                                    workspace.name,
                                    round.pull.pulled,
                                    round.pull.conflicts,
                                    round.push.pushed
                                );
                            } else {
                                for failure in failures {
                                    tracing::warn!("Periodic sync of '{}' failed: {failure}", workspace.name);
                                }
                            }
                        }
                        Err(e) => tracing::warn!("Periodic sync task for '{}' failed: {e}", workspace.name),
                    }

                    schedule.completed(&workspace, Utc::now());
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Periodic sync shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{shared, Database, Realm};
    use crate::sync::tracker::TrackerSettings;
    use crate::sync::{Change, ChangeOperation, EntityKind};
    use tempfile::tempdir;

    fn auto_workspace(name: &str) -> Workspace {
        let mut workspace = Workspace::new(name);
        workspace.auto_sync = true;
        workspace.sync_repo = Some("/tmp/remote.git".to_string());
        workspace.sync_interval = 60;
        workspace
    }

    #[test]
    fn test_schedule_only_auto_sync_with_remote() {
        let auto = auto_workspace("auto");
        let manual = Workspace::new("manual");
        let mut disabled = auto_workspace("disabled");
        disabled.sync_enabled = false;

        let schedule = Schedule::default();
        let due = schedule.due(&[auto.clone(), manual, disabled], Utc::now());
        assert_eq!(due, vec![auto]);
    }

    #[test]
    fn test_schedule_respects_interval() {
        let workspace = auto_workspace("auto");
        let mut schedule = Schedule::default();
        let now = Utc::now();

        schedule.completed(&workspace, now);
        assert_eq!(
            schedule.next_due(&workspace.id),
            Some(now + chrono::Duration::seconds(60))
        );
        assert!(schedule.due(&[workspace.clone()], now).is_empty());
        assert_eq!(
            schedule
                .due(&[workspace.clone()], now + chrono::Duration::seconds(61))
                .len(),
            1
        );
    }

    #[test]
    fn test_schedule_caps_huge_interval() {
        let mut workspace = auto_workspace("slow");
        workspace.sync_interval = u64::MAX;
        let mut schedule = Schedule::default();
        let now = Utc::now();

        schedule.completed(&workspace, now);
        assert_eq!(
            schedule.next_due(&workspace.id),
            Some(now + chrono::Duration::seconds(MAX_SYNC_INTERVAL as i64))
        );
        assert!(schedule.due(&[workspace], now).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_periodic_sync_pushes_and_stops() {
        let dir = tempdir().unwrap();
        let remote = dir.path().join("remote.git");
        git2::Repository::init_bare(&remote).unwrap();

        let db = shared(Database::open(&dir.path().join("lore.db")).unwrap());
        let mut workspace = auto_workspace("team");
        workspace.sync_repo = Some(remote.to_string_lossy().to_string());
        let realm = Realm::new("api", "/api");
        {
            let db = lock_db(&db).unwrap();
            db.insert_workspace(&workspace).unwrap();
            db.upsert_realm(&realm).unwrap();
            db.attach_realm(&realm.id, &workspace.id).unwrap();
        }

        let tracker = Arc::new(ChangeTracker::new(
            TrackerSettings {
                device_id: "laptop".to_string(),
                sync_dir: dir.path().join("sync"),
                author_name: "Test".to_string(),
                author_email: "test@example.com".to_string(),
            },
            tokio::runtime::Handle::current(),
        ));
        tracker.initialize(db.clone());
        let adapter = tracker.adapter_for(&workspace).unwrap();
        adapter
            .record_change(
                Change::new(ChangeOperation::Create, EntityKind::Realm, realm.id.to_string())
                    .with_data(serde_json::to_value(&realm).unwrap()),
            )
            .unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let task = tokio::spawn(run_periodic_sync(
            Arc::clone(&tracker),
            db.clone(),
            Duration::from_millis(20),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        let state = adapter.state().unwrap();
        assert_eq!(state.pending_changes, 0);
        assert!(state.last_sync_commit.is_some());
    }
}
