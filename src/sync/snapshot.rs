//! Deterministic export of a workspace's records.
//!
//! The snapshot lives in `snapshot/` inside the working tree, one pretty
//! printed JSON file per entity type. Records are sorted by id (relations
//! by composite key) and serialized in struct field order, so two devices
//! with the same logical state write byte-identical files.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::storage::{Database, Lore, Realm, Relation, Workspace, WorkspaceFilters};

/// Directory inside the working tree holding the snapshot.
pub const SNAPSHOT_DIR: &str = "snapshot";

const REALMS_FILE: &str = "realms.json";
const LORES_FILE: &str = "lores.json";
const RELATIONS_FILE: &str = "relations.json";
const WORKSPACE_FILE: &str = "workspace.json";

/// The workspace-level settings shared by every device.
///
/// Device-local values (ids, remote URL, default flag) are left out so
/// they never show up as diffs between devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub name: String,
    pub sync_branch: String,
    pub filters: WorkspaceFilters,
}

impl From<&Workspace> for WorkspaceManifest {
    fn from(workspace: &Workspace) -> Self {
        Self {
            name: workspace.name.clone(),
            sync_branch: workspace.sync_branch.clone(),
            filters: workspace.filters.clone(),
        }
    }
}

/// Every record belonging to a workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub realms: Vec<Realm>,
    pub lores: Vec<Lore>,
    pub relations: Vec<Relation>,
}

/// Counts of records written by [`Snapshot::import_into`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub realms: usize,
    pub lores: usize,
    pub relations: usize,
}

impl Snapshot {
    /// Collects the workspace's realms, the lores its filters admit, and
    /// the relations whose endpoints were both exported.
    pub fn collect(db: &Database, workspace: &Workspace) -> Result<Self> {
        let mut realms = db.get_workspace_realms(&workspace.id)?;
        realms.sort_by_key(|r| r.id);

        let mut lores = Vec::new();
        for realm in &realms {
            lores.extend(
                db.list_lores(Some(&realm.id))?
                    .into_iter()
                    .filter(|lore| workspace.filters.admits(lore)),
            );
        }
        lores.sort_by_key(|l| l.id);

        let exported: BTreeSet<Uuid> = lores.iter().map(|l| l.id).collect();
        let mut relations: Vec<Relation> = db
            .list_relations()?
            .into_iter()
            .filter(|r| exported.contains(&r.from_lore_id) && exported.contains(&r.to_lore_id))
            .collect();
        relations.sort_by_key(|r| r.key());

        Ok(Self {
            realms,
            lores,
            relations,
        })
    }

    /// Writes the snapshot into `workdir`, replacing any previous one.
    pub fn write_to(&self, workdir: &Path, workspace: &Workspace) -> Result<()> {
        let dir = workdir.join(SNAPSHOT_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        write_json(&dir.join(REALMS_FILE), &self.realms)?;
        write_json(&dir.join(LORES_FILE), &self.lores)?;
        write_json(&dir.join(RELATIONS_FILE), &self.relations)?;
        write_json(&dir.join(WORKSPACE_FILE), &WorkspaceManifest::from(workspace))?;
        Ok(())
    }

    /// Reads a snapshot from `workdir`. Missing files read as empty.
    pub fn read_from(workdir: &Path) -> Result<Self> {
        let dir = workdir.join(SNAPSHOT_DIR);
        Ok(Self {
            realms: read_json(&dir.join(REALMS_FILE))?.unwrap_or_default(),
            lores: read_json(&dir.join(LORES_FILE))?.unwrap_or_default(),
            relations: read_json(&dir.join(RELATIONS_FILE))?.unwrap_or_default(),
        })
    }

    /// Upserts every record into `db`.
    ///
    /// Workspace membership is not touched; callers attach realms as needed.
    pub fn import_into(&self, db: &Database) -> Result<ImportStats> {
        for realm in &self.realms {
            db.upsert_realm(realm)?;
        }
        for lore in &self.lores {
            db.upsert_lore(lore)?;
        }
        for relation in &self.relations {
            db.upsert_relation(relation)?;
        }

        Ok(ImportStats {
            realms: self.realms.len(),
            lores: self.lores.len(),
            relations: self.relations.len(),
        })
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}
