//! Per-workspace sync adapter.
//!
//! Owns one workspace's git working tree at `<sync_dir>/<workspace>` and
//! everything that touches it: recording local changes, exporting the
//! snapshot, pushing, and pulling with conflict detection.

use anyhow::Context;
use git2::{Oid, Signature};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::clock::VectorClock;
use super::conflict::{classify, ReplayDecision, SyncConflict};
use super::event::{
    log_path, merge_logs, read_log, write_log, Change, ChangeEvent, ChangeOperation, EntityKind,
    CHANGES_DIR,
};
use super::snapshot::Snapshot;
use super::state::SyncState;
use super::tracker::TrackerSettings;
use super::{PullResult, PushResult, SyncError};
use crate::git::{self, SyncRepo};
use crate::storage::{lock_db, Database, Lore, Realm, Relation, SharedDatabase, Workspace};

/// Lifecycle phase of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterPhase {
    Uninitialized,
    Initialized,
    Recording,
    Exporting,
    Pushing,
    Pulling,
}

impl std::fmt::Display for AdapterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterPhase::Uninitialized => "uninitialized",
            AdapterPhase::Initialized => "initialized",
            AdapterPhase::Recording => "recording",
            AdapterPhase::Exporting => "exporting",
            AdapterPhase::Pushing => "pushing",
            AdapterPhase::Pulling => "pulling",
        };
        write!(f, "{s}")
    }
}

/// Returns the adapter to `Initialized` when an operation ends, however
/// it ends.
struct PhaseGuard<'a> {
    phase: &'a Mutex<AdapterPhase>,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *guard(self.phase) = AdapterPhase::Initialized;
    }
}

/// Locks a mutex that only protects plain data, recovering from poison.
fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sync lifecycle of one workspace.
///
/// Lock order is `push_lock`/`pull_lock`, then `repo`, then `log_lock`,
/// then the database. `record_change` only takes the last two, so it never
/// waits on network I/O.
pub struct SyncAdapter {
    workspace_id: Uuid,
    db: SharedDatabase,
    device_id: String,
    workdir: PathBuf,
    author_name: String,
    author_email: String,
    repo: Mutex<Option<SyncRepo>>,
    log_lock: Mutex<()>,
    push_lock: Mutex<()>,
    pull_lock: Mutex<()>,
    phase: Mutex<AdapterPhase>,
}

impl SyncAdapter {
    /// Creates an uninitialized adapter. Call [`SyncAdapter::initialize`]
    /// before use.
    pub fn new(workspace: &Workspace, db: SharedDatabase, settings: &TrackerSettings) -> Self {
        Self {
            workspace_id: workspace.id,
            db,
            device_id: settings.device_id.clone(),
            workdir: settings.sync_dir.join(workdir_name(&workspace.name)),
            author_name: settings.author_name.clone(),
            author_email: settings.author_email.clone(),
            repo: Mutex::new(None),
            log_lock: Mutex::new(()),
            push_lock: Mutex::new(()),
            pull_lock: Mutex::new(()),
            phase: Mutex::new(AdapterPhase::Uninitialized),
        }
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn phase(&self) -> AdapterPhase {
        *guard(&self.phase)
    }

    /// Prepares the working tree and the sync state row. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Setup`] if the working tree cannot be created,
    /// and git or storage errors from preparing it.
    pub fn initialize(&self) -> Result<(), SyncError> {
        let workspace = self.workspace()?;
        self.with_repo(&workspace, |_| Ok(()))?;

        let db = lock_db(&self.db)?;
        if db
            .load_sync_state(&self.workspace_id, &self.device_id)?
            .is_none()
        {
            db.save_sync_state(&SyncState::new(self.workspace_id, &self.device_id))?;
        }
        drop(db);

        let mut phase = guard(&self.phase);
        if *phase == AdapterPhase::Uninitialized {
            *phase = AdapterPhase::Initialized;
        }
        tracing::debug!(
            "Initialized sync for workspace '{}' at {}",
            workspace.name,
            self.workdir.display()
        );
        Ok(())
    }

    /// Current sync state of this device in the workspace.
    pub fn state(&self) -> Result<SyncState, SyncError> {
        let db = lock_db(&self.db)?;
        Ok(self.load_state(&db)?)
    }

    /// Stamps a change, appends it to this device's log and advances the
    /// clock. Returns `None` when the workspace filters exclude the change.
    pub fn record_change(&self, change: Change) -> Result<Option<ChangeEvent>, SyncError> {
        let workspace = self.workspace()?;
        if !admits(&workspace, &change) {
            tracing::debug!(
                "Workspace '{}' filters out {} {}",
                workspace.name,
                change.entity,
                change.entity_id
            );
            return Ok(None);
        }

        let _phase = self.enter(AdapterPhase::Recording);
        let _log = guard(&self.log_lock);
        let db = lock_db(&self.db)?;

        let mut state = self.load_state(&db)?;
        let clock = state.tick();
        let event = ChangeEvent::stamp(change, &self.device_id, clock);

        // Persist the counter first: a failed append leaves a gap, never a
        // reused counter.
        db.save_sync_state(&state)?;
        super::event::append_event(&log_path(&self.workdir, &self.device_id), &event)?;

        let mut entity_clock = db
            .get_entity_clock(&self.workspace_id, event.entity, &event.entity_id)?
            .unwrap_or_default();
        entity_clock.merge(&event.clock);
        db.set_entity_clock(&self.workspace_id, event.entity, &event.entity_id, &entity_clock)?;

        tracing::debug!(
            "Recorded {} {} {} in '{}' at {}",
            event.operation,
            event.entity,
            event.entity_id,
            workspace.name,
            event.clock
        );
        Ok(Some(event))
    }

    /// Writes the workspace snapshot into the working tree.
    pub fn export_workspace_data(&self) -> Result<Snapshot, SyncError> {
        let workspace = self.workspace()?;
        self.with_repo(&workspace, |_| {
            let _phase = self.enter(AdapterPhase::Exporting);
            self.export(&workspace)
        })
    }

    /// Commits local changes and pushes them to the remote branch.
    ///
    /// # Errors
    ///
    /// Only configuration and setup problems are errors. Transport
    /// failures and rejections are reported in [`PushResult::errors`] and
    /// leave the sync state untouched so the next push retries.
    pub fn push(&self) -> Result<PushResult, SyncError> {
        let workspace = self.workspace()?;
        require_remote(&workspace)?;
        let _push = guard(&self.push_lock);

        self.with_repo(&workspace, |repo| {
            let _phase = self.enter(AdapterPhase::Pushing);
            let branch = workspace.sync_branch.as_str();

            let remote_tip = match repo.fetch(branch) {
                Ok(tip) => tip,
                Err(e) => {
                    tracing::warn!("Fetch before push failed for '{}': {e}", workspace.name);
                    return Ok(PushResult::failed(e));
                }
            };

            if let Err(e) = self.export(&workspace) {
                return Ok(PushResult::failed(e));
            }

            let (tree, pending) = {
                let _log = guard(&self.log_lock);
                let tree = match repo.stage_all() {
                    Ok(tree) => tree,
                    Err(e) => return Ok(PushResult::failed(e)),
                };
                (tree, self.state()?.pending_changes)
            };

            let head = repo.head_oid();
            let tree_changed = repo.head_tree_id() != Some(tree);
            if !tree_changed {
                let published = match (head, remote_tip) {
                    (Some(head), Some(tip)) => repo.contains(tip, head)?,
                    _ => false,
                };
                if published {
                    tracing::debug!("Workspace '{}' has nothing to push", workspace.name);
                    return Ok(PushResult::default());
                }
            }

            if tree_changed {
                let parents: Vec<Oid> = head.into_iter().collect();
                let message = format!("lore: {pending} change(s) from {}", self.device_id);
                let committed = self
                    .signature()
                    .and_then(|sig| repo.commit(tree, &message, &sig, &parents));
                if let Err(e) = committed {
                    return Ok(PushResult::failed(e));
                }
            }

            if let Err(e) = repo.push(branch) {
                tracing::warn!("Push failed for '{}': {e}", workspace.name);
                return Ok(PushResult::failed(e));
            }

            let commit = repo.head_oid().map(|oid| oid.to_string()).unwrap_or_default();
            {
                let _log = guard(&self.log_lock);
                let db = lock_db(&self.db)?;
                let mut state = self.load_state(&db)?;
                state.record_push(&commit, pending);
                db.save_sync_state(&state)?;
            }

            tracing::info!(
                "Pushed {pending} change(s) for workspace '{}'",
                workspace.name
            );
            Ok(PushResult {
                pushed: pending,
                errors: Vec::new(),
            })
        })
    }

    /// Fetches the remote branch and replays remote events this device
    /// has not observed yet.
    ///
    /// # Errors
    ///
    /// Only configuration and setup problems are errors. Conflicts are
    /// counted in [`PullResult::conflicts`]; transport and replay failures
    /// are reported in [`PullResult::errors`].
    pub fn pull(&self) -> Result<PullResult, SyncError> {
        let workspace = self.workspace()?;
        require_remote(&workspace)?;
        let _pull = guard(&self.pull_lock);

        self.with_repo(&workspace, |repo| {
            let _phase = self.enter(AdapterPhase::Pulling);
            let branch = workspace.sync_branch.as_str();

            let tip = match repo.fetch(branch) {
                Ok(Some(tip)) => tip,
                Ok(None) => {
                    tracing::debug!("Remote has no branch '{branch}' yet");
                    return Ok(PullResult::default());
                }
                Err(e) => {
                    tracing::warn!("Fetch failed for '{}': {e}", workspace.name);
                    return Ok(PullResult::failed(e));
                }
            };

            let state = self.state()?;
            if already_synced(repo, &state, tip) {
                tracing::debug!("Workspace '{}' is up to date", workspace.name);
                return Ok(PullResult::default());
            }

            let remote_logs = match repo.read_logs_at(tip) {
                Ok(logs) => logs,
                Err(e) => return Ok(PullResult::failed(e)),
            };

            // Events already covered by the clock are still examined: one
            // that failed to replay earlier is not marked applied and must
            // be retried even after later events from its device merged in.
            let mut incoming: Vec<&ChangeEvent> = remote_logs
                .iter()
                .flat_map(|(_, events)| events.iter())
                .filter(|event| event.device_id != self.device_id)
                .collect();
            incoming.sort_by(|a, b| a.replay_key().cmp(&b.replay_key()));

            let mut result = PullResult::default();
            let mut observed = VectorClock::new();
            {
                let db = lock_db(&self.db)?;
                for event in incoming {
                    if db.is_event_applied(&self.workspace_id, &event.id)? {
                        observed.merge(&event.clock);
                        continue;
                    }
                    match self.replay(&db, event) {
                        Ok(ReplayDecision::Apply) => result.pulled += 1,
                        Ok(ReplayDecision::Conflict) => result.conflicts += 1,
                        Ok(ReplayDecision::Stale) => {}
                        Err(e) => {
                            result
                                .errors
                                .push(format!("Failed to replay event {}: {e:#}", event.id));
                            continue;
                        }
                    }
                    db.mark_event_applied(&self.workspace_id, &event.id)?;
                    observed.merge(&event.clock);
                }
            }

            if let Err(e) = self.integrate(repo, &workspace, tip, remote_logs) {
                result.errors.push(format!("{e:#}"));
            }

            // Handled events always reach the clock so later local edits
            // are stamped after them. The commit only advances without
            // errors, so the next pull retries what failed.
            {
                let _log = guard(&self.log_lock);
                let db = lock_db(&self.db)?;
                let mut state = self.load_state(&db)?;
                if result.errors.is_empty() {
                    state.record_pull(&tip.to_string(), &observed);
                } else {
                    state.observe(&observed);
                }
                db.save_sync_state(&state)?;
            }

            tracing::info!(
                "Pulled {} change(s) with {} conflict(s) for workspace '{}'",
                result.pulled,
                result.conflicts,
                workspace.name
            );
            Ok(result)
        })
    }

    // ==================== Internals ====================

    fn workspace(&self) -> Result<Workspace, SyncError> {
        let db = lock_db(&self.db)?;
        db.find_workspace(&self.workspace_id)?
            .ok_or_else(|| SyncError::WorkspaceNotFound(self.workspace_id.to_string()))
    }

    fn load_state(&self, db: &Database) -> anyhow::Result<SyncState> {
        Ok(db
            .load_sync_state(&self.workspace_id, &self.device_id)?
            .unwrap_or_else(|| SyncState::new(self.workspace_id, &self.device_id)))
    }

    fn enter(&self, phase: AdapterPhase) -> PhaseGuard<'_> {
        *guard(&self.phase) = phase;
        PhaseGuard { phase: &self.phase }
    }

    fn signature(&self) -> Result<Signature<'static>, git2::Error> {
        git::signature(&self.author_name, &self.author_email)
    }

    /// Runs `f` with the working tree, opening it on first use and keeping
    /// `origin` in line with the workspace's current remote.
    fn with_repo<T>(
        &self,
        workspace: &Workspace,
        f: impl FnOnce(&SyncRepo) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut slot = guard(&self.repo);
        if slot.is_none() {
            *slot = Some(self.open_repo(workspace)?);
        }
        let Some(repo) = slot.as_ref() else {
            return Err(self.setup_error("working tree unavailable"));
        };

        if let Some(url) = workspace.sync_repo.as_deref() {
            repo.set_remote(url)?;
        }
        f(repo)
    }

    fn open_repo(&self, workspace: &Workspace) -> Result<SyncRepo, SyncError> {
        fs::create_dir_all(&self.workdir).map_err(|e| self.setup_error(e))?;
        let repo = SyncRepo::open_or_init(&self.workdir, workspace.sync_repo.as_deref())
            .map_err(|e| self.setup_error(e))?;

        let branch = workspace.sync_branch.as_str();
        let remote_tip = if repo.has_remote() {
            repo.fetch(branch).unwrap_or_else(|e| {
                tracing::warn!(
                    "Could not reach remote for '{}', continuing offline: {e}",
                    workspace.name
                );
                repo.remote_tip(branch)
            })
        } else {
            None
        };

        repo.ensure_branch(branch, remote_tip, &self.signature()?)?;
        Ok(repo)
    }

    fn setup_error(&self, message: impl std::fmt::Display) -> SyncError {
        SyncError::Setup {
            path: self.workdir.clone(),
            message: message.to_string(),
        }
    }

    fn export(&self, workspace: &Workspace) -> Result<Snapshot, SyncError> {
        let snapshot = {
            let db = lock_db(&self.db)?;
            Snapshot::collect(&db, workspace)?
        };
        snapshot.write_to(&self.workdir, workspace)?;
        Ok(snapshot)
    }

    /// Classifies a remote event against the local entity clock and
    /// applies or flags it.
    fn replay(&self, db: &Database, event: &ChangeEvent) -> anyhow::Result<ReplayDecision> {
        let local_clock = db.get_entity_clock(&self.workspace_id, event.entity, &event.entity_id)?;
        let decision = classify(local_clock.as_ref(), &event.clock);

        match decision {
            ReplayDecision::Apply => {
                self.apply(db, event)?;
                let mut clock = local_clock.unwrap_or_default();
                clock.merge(&event.clock);
                db.set_entity_clock(&self.workspace_id, event.entity, &event.entity_id, &clock)?;
            }
            ReplayDecision::Conflict => {
                let local_data = current_data(db, event.entity, &event.entity_id)?;
                let conflict = SyncConflict::new(
                    self.workspace_id,
                    event,
                    local_data,
                    local_clock.unwrap_or_default(),
                );
                db.insert_conflict(&conflict)?;
                tracing::warn!(
                    "Conflict on {} {}: local {} vs {} from {}",
                    event.entity,
                    event.entity_id,
                    conflict.local_clock,
                    event.clock,
                    event.device_id
                );
            }
            ReplayDecision::Stale => {
                tracing::debug!("Skipping stale {} {}", event.entity, event.entity_id);
            }
        }
        Ok(decision)
    }

    fn apply(&self, db: &Database, event: &ChangeEvent) -> anyhow::Result<()> {
        match (event.entity, event.operation) {
            (EntityKind::Lore, ChangeOperation::Delete) => {
                db.delete_lore(&parse_id(&event.entity_id)?)?;
            }
            (EntityKind::Lore, _) => {
                let lore: Lore = payload(event)?;
                db.upsert_lore(&lore)?;
            }
            (EntityKind::Realm, ChangeOperation::Delete) => {
                db.delete_realm(&parse_id(&event.entity_id)?)?;
            }
            (EntityKind::Realm, _) => {
                let realm: Realm = payload(event)?;
                db.upsert_realm(&realm)?;
                db.attach_realm(&realm.id, &self.workspace_id)?;
            }
            (EntityKind::Relation, ChangeOperation::Delete) => {
                let (from, relation_type, to) = Relation::parse_key(&event.entity_id)
                    .with_context(|| format!("Invalid relation key '{}'", event.entity_id))?;
                db.delete_relation(&from, relation_type, &to)?;
            }
            (EntityKind::Relation, _) => {
                let relation: Relation = payload(event)?;
                db.upsert_relation(&relation)?;
            }
        }
        Ok(())
    }

    /// Brings the working tree and HEAD in line with the remote tip after
    /// replay: union of change logs, fresh snapshot, then fast-forward or
    /// merge commit.
    fn integrate(
        &self,
        repo: &SyncRepo,
        workspace: &Workspace,
        tip: Oid,
        remote_logs: Vec<(String, Vec<ChangeEvent>)>,
    ) -> Result<(), SyncError> {
        let head = repo.head_oid();
        let diverged = match head {
            Some(head) if repo.contains(head, tip)? => false,
            Some(head) if !repo.contains(tip, head)? => true,
            _ => {
                repo.reset_mixed(tip)?;
                false
            }
        };

        {
            let _log = guard(&self.log_lock);
            let changes_dir = self.workdir.join(CHANGES_DIR);
            for (name, events) in remote_logs {
                let path = changes_dir.join(&name);
                let local = read_log(&path)?;
                let local_len = local.len();
                let merged = merge_logs(local, events);
                if merged.len() != local_len || !path.exists() {
                    write_log(&path, &merged)?;
                }
            }
        }

        self.export(workspace)?;

        if let (true, Some(head)) = (diverged, head) {
            let tree = {
                let _log = guard(&self.log_lock);
                repo.stage_all()?
            };
            let message = format!("lore: merge remote changes into {}", self.device_id);
            repo.commit(tree, &message, &self.signature()?, &[head, tip])?;
            tracing::debug!("Merged diverged history for '{}'", workspace.name);
        }
        Ok(())
    }
}

/// Directory name for a workspace's working tree.
fn workdir_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn require_remote(workspace: &Workspace) -> Result<(), SyncError> {
    if !workspace.sync_enabled {
        return Err(SyncError::SyncDisabled(workspace.name.clone()));
    }
    if workspace.sync_repo.is_none() {
        return Err(SyncError::NoRemote(workspace.name.clone()));
    }
    Ok(())
}

/// Whether the workspace filters let a change through. Only lore
/// payloads are filtered; deletes always pass.
fn admits(workspace: &Workspace, change: &Change) -> bool {
    if change.entity != EntityKind::Lore || workspace.filters.is_empty() {
        return true;
    }
    match change
        .data
        .as_ref()
        .and_then(|data| serde_json::from_value::<Lore>(data.clone()).ok())
    {
        Some(lore) => workspace.filters.admits(&lore),
        None => true,
    }
}

/// Whether the remote tip is already reflected in the last synced commit.
fn already_synced(repo: &SyncRepo, state: &SyncState, tip: Oid) -> bool {
    state
        .last_sync_commit
        .as_deref()
        .and_then(|commit| Oid::from_str(commit).ok())
        .map(|last| repo.contains(last, tip).unwrap_or(false))
        .unwrap_or(false)
}

fn parse_id(id: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid entity id '{id}'"))
}

fn payload<T: serde::de::DeserializeOwned>(event: &ChangeEvent) -> anyhow::Result<T> {
    let data = event
        .data
        .clone()
        .with_context(|| format!("{} event {} has no data", event.entity, event.id))?;
    serde_json::from_value(data)
        .with_context(|| format!("Malformed {} data in event {}", event.entity, event.id))
}

/// JSON of the local version of an entity, `None` if it does not exist.
fn current_data(
    db: &Database,
    entity: EntityKind,
    entity_id: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let value = match entity {
        EntityKind::Lore => db
            .get_lore(&parse_id(entity_id)?)?
            .map(serde_json::to_value)
            .transpose()?,
        EntityKind::Realm => db
            .get_realm(&parse_id(entity_id)?)?
            .map(serde_json::to_value)
            .transpose()?,
        EntityKind::Relation => match Relation::parse_key(entity_id) {
            Some((from, relation_type, to)) => db
                .get_relation(&from, relation_type, &to)?
                .map(serde_json::to_value)
                .transpose()?,
            None => None,
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{shared, LoreType};
    use tempfile::{tempdir, TempDir};

    struct Device {
        db: SharedDatabase,
        adapter: SyncAdapter,
        _dir: TempDir,
    }

    fn device(name: &str, workspace: &Workspace) -> Device {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("lore.db")).unwrap();
        db.insert_workspace(workspace).unwrap();
        let db = shared(db);
        let settings = TrackerSettings {
            device_id: name.to_string(),
            sync_dir: dir.path().join("sync"),
            author_name: "Test".to_string(),
            author_email: "test@example.com".to_string(),
        };
        let adapter = SyncAdapter::new(workspace, db.clone(), &settings);
        adapter.initialize().unwrap();
        Device {
            db,
            adapter,
            _dir: dir,
        }
    }

    fn remote_workspace(remote: &TempDir) -> Workspace {
        let url = remote.path().join("remote.git");
        git2::Repository::init_bare(&url).unwrap();
        let mut workspace = Workspace::new("team");
        workspace.sync_repo = Some(url.to_string_lossy().to_string());
        workspace
    }

    /// Creates a lore locally and records it, the way the store does.
    fn create_lore(device: &Device, realm: &Realm, content: &str) -> Lore {
        let lore = Lore::new(realm.id, LoreType::Decision, content);
        lock_db(&device.db).unwrap().upsert_lore(&lore).unwrap();
        device
            .adapter
            .record_change(
                Change::new(ChangeOperation::Create, EntityKind::Lore, lore.id.to_string())
                    .with_data(serde_json::to_value(&lore).unwrap()),
            )
            .unwrap();
        lore
    }

    fn create_realm(device: &Device, workspace: &Workspace) -> Realm {
        let realm = Realm::new("api", "/api");
        {
            let db = lock_db(&device.db).unwrap();
            db.upsert_realm(&realm).unwrap();
            db.attach_realm(&realm.id, &workspace.id).unwrap();
        }
        device
            .adapter
            .record_change(
                Change::new(ChangeOperation::Create, EntityKind::Realm, realm.id.to_string())
                    .with_data(serde_json::to_value(&realm).unwrap()),
            )
            .unwrap();
        realm
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let workspace = Workspace::new("solo");
        let dev = device("laptop", &workspace);
        assert_eq!(dev.adapter.phase(), AdapterPhase::Initialized);
        dev.adapter.initialize().unwrap();

        let state = dev.adapter.state().unwrap();
        assert!(state.vector_clock.is_empty());
        assert!(dev.adapter.workdir().join(".git").exists());
    }

    #[test]
    fn test_initialize_fails_when_workdir_is_blocked() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("sync");
        fs::write(&blocker, "not a directory").unwrap();

        let workspace = Workspace::new("team");
        let db = Database::open(&dir.path().join("lore.db")).unwrap();
        db.insert_workspace(&workspace).unwrap();
        let settings = TrackerSettings {
            device_id: "laptop".to_string(),
            sync_dir: blocker,
            author_name: "Test".to_string(),
            author_email: "test@example.com".to_string(),
        };
        let adapter = SyncAdapter::new(&workspace, shared(db), &settings);

        assert!(matches!(adapter.initialize(), Err(SyncError::Setup { .. })));
        assert_eq!(adapter.phase(), AdapterPhase::Uninitialized);
    }

    #[test]
    fn test_record_change_advances_clock_and_log() {
        let workspace = Workspace::new("solo");
        let dev = device("laptop", &workspace);
        let realm = create_realm(&dev, &workspace);
        create_lore(&dev, &realm, "use sqlite");

        let state = dev.adapter.state().unwrap();
        assert_eq!(state.vector_clock.get("laptop"), 2);
        assert_eq!(state.pending_changes, 2);

        let log = read_log(&log_path(dev.adapter.workdir(), "laptop")).unwrap();
        let counters: Vec<_> = log.iter().map(|e| e.counter()).collect();
        assert_eq!(counters, vec![1, 2]);
        assert!(log.iter().all(|e| e.device_id == "laptop"));
    }

    #[test]
    fn test_record_change_respects_filters() {
        let mut workspace = Workspace::new("solo");
        workspace.filters.lore_types.insert(LoreType::Risk);
        let dev = device("laptop", &workspace);
        let realm = create_realm(&dev, &workspace);

        create_lore(&dev, &realm, "a decision, not a risk");
        assert_eq!(dev.adapter.state().unwrap().pending_changes, 1);
    }

    #[test]
    fn test_push_requires_remote_and_enabled_sync() {
        let mut workspace = Workspace::new("solo");
        let dev = device("laptop", &workspace);
        assert!(matches!(dev.adapter.push(), Err(SyncError::NoRemote(_))));
        assert!(matches!(dev.adapter.pull(), Err(SyncError::NoRemote(_))));

        workspace.sync_enabled = false;
        lock_db(&dev.db).unwrap().update_workspace(&workspace).unwrap();
        assert!(matches!(dev.adapter.push(), Err(SyncError::SyncDisabled(_))));
    }

    #[test]
    fn test_push_is_idempotent() {
        let remote = tempdir().unwrap();
        let workspace = remote_workspace(&remote);
        let dev = device("laptop", &workspace);
        let realm = create_realm(&dev, &workspace);
        create_lore(&dev, &realm, "use sqlite");

        let first = dev.adapter.push().unwrap();
        assert_eq!(first, PushResult { pushed: 2, errors: vec![] });
        let second = dev.adapter.push().unwrap();
        assert_eq!(second, PushResult::default());

        let state = dev.adapter.state().unwrap();
        assert_eq!(state.pending_changes, 0);
        assert!(state.last_sync_commit.is_some());
        assert_eq!(dev.adapter.phase(), AdapterPhase::Initialized);
    }

    #[test]
    fn test_push_reports_unreachable_remote() {
        let remote = tempdir().unwrap();
        let workspace = remote_workspace(&remote);
        let dev = device("laptop", &workspace);
        create_realm(&dev, &workspace);

        let mut broken = workspace.clone();
        broken.sync_repo = Some(remote.path().join("missing.git").to_string_lossy().to_string());
        lock_db(&dev.db).unwrap().update_workspace(&broken).unwrap();

        let result = dev.adapter.push().unwrap();
        assert_eq!(result.pushed, 0);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(dev.adapter.state().unwrap().pending_changes, 1, "State untouched");
    }

    #[test]
    fn test_pull_fast_forward_applies_remote() {
        let remote = tempdir().unwrap();
        let workspace = remote_workspace(&remote);
        let laptop = device("laptop", &workspace);
        let realm = create_realm(&laptop, &workspace);
        let lore = create_lore(&laptop, &realm, "use sqlite");
        laptop.adapter.push().unwrap();

        let desktop = device("desktop", &workspace);
        let result = desktop.adapter.pull().unwrap();
        assert_eq!(
            result,
            PullResult {
                pulled: 2,
                conflicts: 0,
                errors: vec![]
            }
        );

        let db = lock_db(&desktop.db).unwrap();
        assert_eq!(db.get_lore(&lore.id).unwrap(), Some(lore));
        assert_eq!(db.get_workspace_realms(&workspace.id).unwrap(), vec![realm]);
        drop(db);

        assert_eq!(desktop.adapter.pull().unwrap(), PullResult::default());
        assert_eq!(
            desktop.adapter.push().unwrap(),
            PushResult::default(),
            "Identical state exports identical snapshot"
        );
    }

    #[test]
    fn test_concurrent_updates_conflict() {
        let remote = tempdir().unwrap();
        let workspace = remote_workspace(&remote);
        let laptop = device("laptop", &workspace);
        let realm = create_realm(&laptop, &workspace);
        let lore = create_lore(&laptop, &realm, "original");
        laptop.adapter.push().unwrap();

        let desktop = device("desktop", &workspace);
        desktop.adapter.pull().unwrap();

        for (dev, content) in [(&laptop, "laptop edit"), (&desktop, "desktop edit")] {
            let mut edited = lore.clone();
            edited.content = content.to_string();
            lock_db(&dev.db).unwrap().upsert_lore(&edited).unwrap();
            dev.adapter
                .record_change(
                    Change::new(ChangeOperation::Update, EntityKind::Lore, lore.id.to_string())
                        .with_data(serde_json::to_value(&edited).unwrap()),
                )
                .unwrap();
        }

        laptop.adapter.push().unwrap();
        let result = desktop.adapter.pull().unwrap();
        assert_eq!(result.pulled, 0);
        assert_eq!(result.conflicts, 1);

        let db = lock_db(&desktop.db).unwrap();
        let kept = db.get_lore(&lore.id).unwrap().unwrap();
        assert_eq!(kept.content, "desktop edit", "Local version is left in place");

        let conflicts = db.list_conflicts(&workspace.id, false).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].local_data.as_ref().unwrap()["content"], "desktop edit");
        assert_eq!(conflicts[0].remote_data.as_ref().unwrap()["content"], "laptop edit");
    }

    #[test]
    fn test_failed_replay_still_advances_clock() {
        let remote = tempdir().unwrap();
        let workspace = remote_workspace(&remote);
        let laptop = device("laptop", &workspace);
        let realm = create_realm(&laptop, &workspace);
        let lore = create_lore(&laptop, &realm, "original");
        laptop
            .adapter
            .record_change(
                Change::new(ChangeOperation::Update, EntityKind::Lore, Uuid::new_v4().to_string())
                    .with_data(serde_json::json!({"bogus": true})),
            )
            .unwrap();
        laptop.adapter.push().unwrap();

        let desktop = device("desktop", &workspace);
        let first = desktop.adapter.pull().unwrap();
        assert_eq!(first.pulled, 2);
        assert_eq!(first.errors.len(), 1);
        assert_eq!(desktop.adapter.state().unwrap().vector_clock.get("laptop"), 2);

        // The malformed event is retried, the good ones are not replayed
        let retry = desktop.adapter.pull().unwrap();
        assert_eq!(retry.pulled, 0);
        assert_eq!(retry.errors.len(), 1);

        let mut edited = lore.clone();
        edited.content = "desktop edit".to_string();
        lock_db(&desktop.db).unwrap().upsert_lore(&edited).unwrap();
        let event = desktop
            .adapter
            .record_change(
                Change::new(ChangeOperation::Update, EntityKind::Lore, lore.id.to_string())
                    .with_data(serde_json::to_value(&edited).unwrap()),
            )
            .unwrap()
            .unwrap();
        assert_eq!(event.clock.get("laptop"), 2);
        assert!(desktop.adapter.push().unwrap().errors.is_empty());

        let result = laptop.adapter.pull().unwrap();
        assert_eq!(
            result,
            PullResult {
                pulled: 1,
                conflicts: 0,
                errors: vec![]
            }
        );
        let db = lock_db(&laptop.db).unwrap();
        assert_eq!(db.get_lore(&lore.id).unwrap().unwrap().content, "desktop edit");
    }

    #[test]
    fn test_entity_clock_never_moves_backwards() {
        let workspace = Workspace::new("solo");
        let dev = device("laptop", &workspace);
        let entity_id = Uuid::new_v4().to_string();
        let remote_clock = VectorClock::from([("desktop", 4)]);
        lock_db(&dev.db)
            .unwrap()
            .set_entity_clock(&workspace.id, EntityKind::Lore, &entity_id, &remote_clock)
            .unwrap();

        dev.adapter
            .record_change(Change::new(ChangeOperation::Delete, EntityKind::Lore, entity_id.clone()))
            .unwrap();

        let stored = lock_db(&dev.db)
            .unwrap()
            .get_entity_clock(&workspace.id, EntityKind::Lore, &entity_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("desktop"), 4);
        assert_eq!(stored.get("laptop"), 1);
    }

    #[test]
    fn test_failed_append_never_reuses_counter() {
        let workspace = Workspace::new("solo");
        let dev = device("laptop", &workspace);
        let log = log_path(dev.adapter.workdir(), "laptop");
        fs::create_dir_all(&log).unwrap();

        let change = || Change::new(ChangeOperation::Create, EntityKind::Realm, "r1");
        assert!(dev.adapter.record_change(change()).is_err());
        assert_eq!(dev.adapter.state().unwrap().vector_clock.get("laptop"), 1);

        fs::remove_dir(&log).unwrap();
        let event = dev.adapter.record_change(change()).unwrap().unwrap();
        assert_eq!(event.counter(), 2);
        assert_eq!(read_log(&log).unwrap(), vec![event]);
    }

    #[test]
    fn test_export_writes_snapshot() {
        let workspace = Workspace::new("solo");
        let dev = device("laptop", &workspace);
        let realm = create_realm(&dev, &workspace);
        create_lore(&dev, &realm, "use sqlite");

        let snapshot = dev.adapter.export_workspace_data().unwrap();
        assert_eq!(snapshot.lores.len(), 1);
        assert_eq!(Snapshot::read_from(dev.adapter.workdir()).unwrap(), snapshot);
    }

    #[test]
    fn test_workdir_name_is_safe() {
        assert_eq!(workdir_name("team lore/1"), "team_lore_1");
    }
}
