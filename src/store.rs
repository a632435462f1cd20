//! Data-mutation facade.
//!
//! Every create, update and delete goes through [`LoreStore`], which writes
//! to the database first and then tells the [`ChangeTracker`]. The database
//! lock is released before the tracker runs, and tracking never turns a
//! successful write into an error.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{
    lock_db, Lore, Realm, Relation, RelationType, SharedDatabase, Workspace,
};
use crate::sync::{Change, ChangeMetadata, ChangeOperation, ChangeTracker, EntityKind};

pub struct LoreStore {
    db: SharedDatabase,
    tracker: Arc<ChangeTracker>,
}

impl LoreStore {
    /// Wraps the database and binds the tracker to it.
    pub fn new(db: SharedDatabase, tracker: Arc<ChangeTracker>) -> Self {
        tracker.initialize(db.clone());
        Self { db, tracker }
    }

    pub fn db(&self) -> &SharedDatabase {
        &self.db
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    // ==================== Realms ====================

    pub fn create_realm(&self, name: &str, path: &str) -> Result<Realm> {
        let realm = Realm::new(name, path);
        lock_db(&self.db)?.upsert_realm(&realm)?;
        self.tracker
            .record_realm_change(ChangeOperation::Create, realm.id, Some(&realm), None);
        Ok(realm)
    }

    pub fn list_realms(&self) -> Result<Vec<Realm>> {
        lock_db(&self.db)?.list_realms()
    }

    /// Finds a realm by id or name.
    pub fn find_realm(&self, key: &str) -> Result<Option<Realm>> {
        let db = lock_db(&self.db)?;
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(realm) = db.get_realm(&id)? {
                return Ok(Some(realm));
            }
        }
        db.find_realm_by_name(key)
    }

    /// Deletes a realm with its lores. Each workspace it belonged to gets a
    /// delete event.
    pub fn delete_realm(&self, id: &Uuid) -> Result<bool> {
        let workspaces = {
            let db = lock_db(&self.db)?;
            let workspaces = db.get_realm_workspaces(id)?;
            if !db.delete_realm(id)? {
                return Ok(false);
            }
            workspaces
        };

        for workspace in workspaces {
            let key = workspace.id.to_string();
            self.tracker
                .record_realm_change(ChangeOperation::Delete, *id, None, Some(&key));
        }
        Ok(true)
    }

    // ==================== Lores ====================

    pub fn add_lore(&self, lore: Lore) -> Result<Lore> {
        {
            let db = lock_db(&self.db)?;
            if db.get_realm(&lore.realm_id)?.is_none() {
                bail!("Realm {} does not exist", lore.realm_id);
            }
            db.upsert_lore(&lore)?;
        }
        self.tracker
            .record_lore_change(ChangeOperation::Create, lore.id, Some(&lore), lore.realm_id);
        Ok(lore)
    }

    /// Saves changes to an existing lore and bumps `updated_at`.
    pub fn update_lore(&self, lore: &mut Lore) -> Result<()> {
        {
            let db = lock_db(&self.db)?;
            if db.get_lore(&lore.id)?.is_none() {
                bail!("Lore {} does not exist", lore.id);
            }
            lore.updated_at = Utc::now();
            db.upsert_lore(lore)?;
        }
        self.tracker
            .record_lore_change(ChangeOperation::Update, lore.id, Some(lore), lore.realm_id);
        Ok(())
    }

    pub fn get_lore(&self, id: &Uuid) -> Result<Option<Lore>> {
        lock_db(&self.db)?.get_lore(id)
    }

    /// Finds a lore by full id or unique id prefix.
    pub fn find_lore(&self, key: &str) -> Result<Option<Lore>> {
        if let Ok(id) = Uuid::parse_str(key) {
            return self.get_lore(&id);
        }

        let mut matches: Vec<Lore> = self
            .list_lores(None)?
            .into_iter()
            .filter(|lore| lore.id.to_string().starts_with(key))
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => bail!("Id prefix '{key}' is ambiguous ({n} lores match)"),
        }
    }

    pub fn list_lores(&self, realm_id: Option<&Uuid>) -> Result<Vec<Lore>> {
        lock_db(&self.db)?.list_lores(realm_id)
    }

    /// Deletes a lore. Relations touching it go with it.
    pub fn delete_lore(&self, id: &Uuid) -> Result<bool> {
        let lore = {
            let db = lock_db(&self.db)?;
            let Some(lore) = db.get_lore(id)? else {
                return Ok(false);
            };
            db.delete_lore(id)?;
            lore
        };
        self.tracker
            .record_lore_change(ChangeOperation::Delete, lore.id, None, lore.realm_id);
        Ok(true)
    }

    // ==================== Relations ====================

    /// Relates two existing lores. Relating twice is a no-op.
    pub fn relate(&self, from: &Uuid, relation_type: RelationType, to: &Uuid) -> Result<Relation> {
        let (relation, realm_id) = {
            let db = lock_db(&self.db)?;
            let source = db
                .get_lore(from)?
                .with_context(|| format!("Lore {from} does not exist"))?;
            if db.get_lore(to)?.is_none() {
                bail!("Lore {to} does not exist");
            }
            if let Some(existing) = db.get_relation(from, relation_type, to)? {
                return Ok(existing);
            }
            let relation = Relation::new(*from, relation_type, *to);
            db.upsert_relation(&relation)?;
            (relation, source.realm_id)
        };

        self.tracker
            .record_relation_change(ChangeOperation::Create, &relation, Some(realm_id));
        Ok(relation)
    }

    pub fn unrelate(&self, from: &Uuid, relation_type: RelationType, to: &Uuid) -> Result<bool> {
        let (relation, realm_id) = {
            let db = lock_db(&self.db)?;
            let Some(relation) = db.get_relation(from, relation_type, to)? else {
                return Ok(false);
            };
            let realm_id = db.get_lore(from)?.map(|lore| lore.realm_id);
            db.delete_relation(from, relation_type, to)?;
            (relation, realm_id)
        };

        self.tracker
            .record_relation_change(ChangeOperation::Delete, &relation, realm_id);
        Ok(true)
    }

    pub fn relations_for_lore(&self, id: &Uuid) -> Result<Vec<Relation>> {
        lock_db(&self.db)?.relations_for_lore(id)
    }

    // ==================== Workspaces ====================

    pub fn create_workspace(&self, workspace: &Workspace) -> Result<()> {
        lock_db(&self.db)?.insert_workspace(workspace)
    }

    pub fn update_workspace(&self, workspace: &Workspace) -> Result<()> {
        lock_db(&self.db)?.update_workspace(workspace)
    }

    pub fn find_workspace(&self, key: &str) -> Result<Option<Workspace>> {
        lock_db(&self.db)?.find_workspace_by_key(key)
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        lock_db(&self.db)?.list_workspaces()
    }

    pub fn set_default_workspace(&self, workspace: &mut Workspace) -> Result<()> {
        workspace.is_default = true;
        self.update_workspace(workspace)
    }

    /// Links a realm to a workspace and records the realm with its current
    /// lores and relations there, so peers receive the existing records.
    /// Returns false if the realm was already linked.
    pub fn attach_realm(&self, realm_id: &Uuid, workspace: &Workspace) -> Result<bool> {
        let (realm, lores, relations) = {
            let db = lock_db(&self.db)?;
            let realm = db
                .get_realm(realm_id)?
                .with_context(|| format!("Realm {realm_id} does not exist"))?;
            if !db.attach_realm(realm_id, &workspace.id)? {
                return Ok(false);
            }
            let lores = db.list_lores(Some(realm_id))?;
            let ids: Vec<Uuid> = lores.iter().map(|l| l.id).collect();
            let relations: Vec<Relation> = db
                .list_relations()?
                .into_iter()
                .filter(|r| ids.contains(&r.from_lore_id))
                .collect();
            (realm, lores, relations)
        };

        let scoped = |entity: EntityKind, entity_id: String, data: Option<serde_json::Value>| {
            let change = Change::new(ChangeOperation::Create, entity, entity_id).with_metadata(
                ChangeMetadata {
                    workspace_id: Some(workspace.id.to_string()),
                    realm_id: Some(realm.id),
                    relation: None,
                },
            );
            match data {
                Some(data) => change.with_data(data),
                None => change,
            }
        };

        self.tracker.record_change(
            scoped(EntityKind::Realm, realm.id.to_string(), serde_json::to_value(&realm).ok()),
            None,
        );
        // Oldest first so peers replay them in creation order
        for lore in lores.iter().rev() {
            self.tracker.record_change(
                scoped(EntityKind::Lore, lore.id.to_string(), serde_json::to_value(lore).ok()),
                None,
            );
        }
        for relation in &relations {
            let mut change = scoped(
                EntityKind::Relation,
                relation.key(),
                serde_json::to_value(relation).ok(),
            );
            change.metadata.relation = Some(relation.key());
            self.tracker.record_change(change, None);
        }

        tracing::debug!(
            "Attached realm '{}' to '{}' with {} lore(s)",
            realm.name,
            workspace.name,
            lores.len()
        );
        Ok(true)
    }

    pub fn detach_realm(&self, realm_id: &Uuid, workspace: &Workspace) -> Result<bool> {
        lock_db(&self.db)?.detach_realm(realm_id, &workspace.id)
    }

    pub fn workspace_realms(&self, workspace: &Workspace) -> Result<Vec<Realm>> {
        lock_db(&self.db)?.get_workspace_realms(&workspace.id)
    }
}
