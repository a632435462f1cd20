//! Process-wide change tracking.
//!
//! The [`ChangeTracker`] is built once at the application's composition
//! point and handed to everything that mutates data. It decides which
//! workspaces a mutation belongs to, forwards it to their adapters and,
//! for auto-sync workspaces, pushes in the background. Tracking failures
//! are logged and swallowed so they never fail the mutation itself.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::adapter::SyncAdapter;
use super::event::{Change, ChangeMetadata, ChangeOperation, EntityKind};
use super::SyncError;
use crate::config::Config;
use crate::storage::{lock_db, Lore, Realm, Relation, SharedDatabase, Workspace};

/// Background errors kept until someone drains them.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Device and location settings shared by every adapter.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub device_id: String,
    /// Parent directory of the per-workspace working trees
    pub sync_dir: PathBuf,
    pub author_name: String,
    pub author_email: String,
}

impl TrackerSettings {
    /// Builds settings from the user config, generating a device id on
    /// first use.
    pub fn from_config(config: &mut Config) -> anyhow::Result<Self> {
        let device_id = config.get_or_create_device_id()?;
        let (author_name, author_email) = config.author();
        Ok(Self {
            device_id,
            sync_dir: config.sync_dir()?,
            author_name,
            author_email,
        })
    }
}

/// A failed background push.
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundError {
    pub workspace: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type AdapterSlot = Arc<Mutex<Option<Arc<SyncAdapter>>>>;

/// Routes mutations to sync adapters.
pub struct ChangeTracker {
    settings: TrackerSettings,
    runtime: Handle,
    db: OnceLock<SharedDatabase>,
    enabled: AtomicBool,
    /// One slot per workspace. The map lock is only held to find a slot;
    /// construction happens under the slot's own lock.
    adapters: Mutex<HashMap<Uuid, AdapterSlot>>,
    /// Workspaces with a background push waiting to start
    queued: Arc<Mutex<HashSet<Uuid>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    error_tx: mpsc::Sender<BackgroundError>,
    error_rx: Mutex<mpsc::Receiver<BackgroundError>>,
}

impl ChangeTracker {
    /// Creates an enabled tracker. Background pushes run on `runtime`.
    pub fn new(settings: TrackerSettings, runtime: Handle) -> Self {
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            settings,
            runtime,
            db: OnceLock::new(),
            enabled: AtomicBool::new(true),
            adapters: Mutex::new(HashMap::new()),
            queued: Arc::new(Mutex::new(HashSet::new())),
            background: Mutex::new(Vec::new()),
            error_tx,
            error_rx: Mutex::new(error_rx),
        }
    }

    /// Binds the tracker to the store. Later calls are ignored.
    pub fn initialize(&self, db: SharedDatabase) {
        if self.db.set(db).is_err() {
            tracing::debug!("Change tracker already initialized");
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Records a change in every workspace it belongs to.
    ///
    /// Workspaces are resolved from `realm_id` links when given, else from
    /// `change.metadata.workspace_id` (id or name), else the default
    /// workspace. Never fails; problems are logged.
    pub fn record_change(&self, change: Change, realm_id: Option<Uuid>) {
        if !self.is_enabled() {
            return;
        }

        let workspaces = match self.target_workspaces(&change, realm_id) {
            Ok(workspaces) => workspaces,
            Err(e) => {
                tracing::warn!("Could not resolve workspaces for change tracking: {e}");
                return;
            }
        };

        for workspace in workspaces {
            if !workspace.sync_enabled {
                tracing::debug!("Sync disabled for '{}', not recording", workspace.name);
                continue;
            }
            if let Err(e) = self.record_in(&workspace, change.clone()) {
                tracing::warn!(
                    "Failed to record {} {} in workspace '{}': {e}",
                    change.entity,
                    change.entity_id,
                    workspace.name
                );
            }
        }
    }

    pub fn record_lore_change(
        &self,
        operation: ChangeOperation,
        lore_id: Uuid,
        lore: Option<&Lore>,
        realm_id: Uuid,
    ) {
        let mut change = Change::new(operation, EntityKind::Lore, lore_id.to_string());
        change.data = lore.and_then(to_data);
        change.metadata.realm_id = Some(realm_id);
        self.record_change(change, Some(realm_id));
    }

    /// Records a realm change. With `workspace` set the change goes only to
    /// that workspace, which is how deletes reach workspaces whose links
    /// are already gone.
    pub fn record_realm_change(
        &self,
        operation: ChangeOperation,
        realm_id: Uuid,
        realm: Option<&Realm>,
        workspace: Option<&str>,
    ) {
        let change = Change::new(operation, EntityKind::Realm, realm_id.to_string()).with_metadata(
            ChangeMetadata {
                workspace_id: workspace.map(str::to_string),
                realm_id: Some(realm_id),
                relation: None,
            },
        );
        let change = match realm.and_then(to_data) {
            Some(data) => change.with_data(data),
            None => change,
        };

        let route = if workspace.is_some() { None } else { Some(realm_id) };
        self.record_change(change, route);
    }

    pub fn record_relation_change(
        &self,
        operation: ChangeOperation,
        relation: &Relation,
        realm_id: Option<Uuid>,
    ) {
        let key = relation.key();
        let mut change = Change::new(operation, EntityKind::Relation, key.clone());
        if operation != ChangeOperation::Delete {
            change.data = to_data(relation);
        }
        change.metadata.realm_id = realm_id;
        change.metadata.relation = Some(key);
        self.record_change(change, realm_id);
    }

    /// Returns the workspace's adapter, constructing and initializing it
    /// on first use. Construction happens once per workspace id.
    ///
    /// Initialization may fetch from the remote; only callers for the same
    /// workspace wait on it. A failed initialization leaves the slot empty
    /// so the next call tries again.
    pub fn adapter_for(&self, workspace: &Workspace) -> Result<Arc<SyncAdapter>, SyncError> {
        let db = self.database()?;
        let slot = Arc::clone(guard(&self.adapters).entry(workspace.id).or_default());

        let mut slot = guard(&slot);
        if let Some(adapter) = slot.as_ref() {
            return Ok(Arc::clone(adapter));
        }

        let adapter = Arc::new(SyncAdapter::new(workspace, db.clone(), &self.settings));
        adapter.initialize()?;
        *slot = Some(Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Resolves a workspace by id or name, or the default workspace.
    pub fn resolve_workspace(&self, key: Option<&str>) -> Result<Workspace, SyncError> {
        let db = lock_db(self.database()?)?;
        match key {
            Some(key) => db
                .find_workspace_by_key(key)?
                .ok_or_else(|| SyncError::WorkspaceNotFound(key.to_string())),
            None => db
                .get_default_workspace()?
                .ok_or(SyncError::NoDefaultWorkspace),
        }
    }

    /// Takes every background error reported so far.
    pub fn drain_errors(&self) -> Vec<BackgroundError> {
        let mut rx = guard(&self.error_rx);
        let mut errors = Vec::new();
        while let Ok(error) = rx.try_recv() {
            errors.push(error);
        }
        errors
    }

    /// Waits for every background push spawned so far.
    pub async fn wait_for_background(&self) {
        let handles = std::mem::take(&mut *guard(&self.background));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background sync task failed: {e}");
            }
        }
    }

    fn database(&self) -> Result<&SharedDatabase, SyncError> {
        self.db
            .get()
            .ok_or_else(|| SyncError::Storage(anyhow::anyhow!("Change tracker is not initialized")))
    }

    fn target_workspaces(
        &self,
        change: &Change,
        realm_id: Option<Uuid>,
    ) -> Result<Vec<Workspace>, SyncError> {
        let db = lock_db(self.database()?)?;

        if let Some(realm_id) = realm_id {
            return Ok(db.get_realm_workspaces(&realm_id)?);
        }
        if let Some(key) = change.metadata.workspace_id.as_deref() {
            return Ok(db.find_workspace_by_key(key)?.into_iter().collect());
        }
        Ok(db.get_default_workspace()?.into_iter().collect())
    }

    fn record_in(&self, workspace: &Workspace, change: Change) -> Result<(), SyncError> {
        let adapter = self.adapter_for(workspace)?;
        let recorded = adapter.record_change(change)?;

        if recorded.is_some() && workspace.auto_sync && workspace.sync_repo.is_some() {
            self.spawn_push(adapter, workspace);
        }
        Ok(())
    }

    /// Pushes in the background. A workspace with a push already waiting
    /// to start is not queued twice; the waiting push picks up this change.
    fn spawn_push(&self, adapter: Arc<SyncAdapter>, workspace: &Workspace) {
        let workspace_id = workspace.id;
        if !guard(&self.queued).insert(workspace_id) {
            tracing::debug!("Push already queued for '{}'", workspace.name);
            return;
        }

        let name = workspace.name.clone();
        let queued = Arc::clone(&self.queued);
        let tx = self.error_tx.clone();
        let handle = self.runtime.spawn_blocking(move || {
            guard(&queued).remove(&workspace_id);

            let message = match adapter.push() {
                Ok(result) if result.errors.is_empty() => {
                    tracing::debug!("Background push for '{name}' sent {}", result.pushed);
                    return;
                }
                Ok(result) => result.errors.join("; "),
                Err(e) => e.to_string(),
            };

            tracing::warn!("Background push for '{name}' failed: {message}");
            let error = BackgroundError {
                workspace: name,
                message,
                at: Utc::now(),
            };
            if tx.try_send(error).is_err() {
                tracing::warn!("Dropping background sync error, too many unread");
            }
        });

        let mut handles = guard(&self.background);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}

fn to_data<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(data) => Some(data),
        Err(e) => {
            tracing::warn!("Could not serialize change payload: {e}");
            None
        }
    }
}
