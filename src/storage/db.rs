//! SQLite storage layer for Lore

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::models::{normalize_tags, Lore, Realm, Relation, RelationType, Workspace};
use crate::config::lore_home;
use crate::sync::{EntityKind, SyncConflict, SyncState, VectorClock};

/// Get the default database path
pub fn default_db_path() -> Result<PathBuf> {
    Ok(lore_home()?.join("lore.db"))
}

/// Database connection wrapper
pub struct Database {
    conn: Connection,
}

const REALM_COLUMNS: &str = "id, name, path, created_at, updated_at";
const LORE_COLUMNS: &str =
    "id, realm_id, lore_type, content, why, confidence, tags, created_at, updated_at";
const RELATION_COLUMNS: &str = "from_lore_id, relation_type, to_lore_id, created_at";
const WORKSPACE_COLUMNS: &str = "id, name, sync_enabled, sync_repo, sync_branch, auto_sync, \
     sync_interval, filters, is_default, created_at";
const CONFLICT_COLUMNS: &str = "id, workspace_id, entity, entity_id, local_data, remote_data, \
     local_clock, remote_clock, remote_event_id, remote_device_id, detected_at, resolved";

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open the default database
    pub fn open_default() -> Result<Self> {
        let path = default_db_path()?;
        Self::open(&path)
    }

    /// Run migrations
    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS realms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lores (
                id TEXT PRIMARY KEY,
                realm_id TEXT NOT NULL,
                lore_type TEXT NOT NULL,
                content TEXT NOT NULL,
                why TEXT,
                confidence REAL NOT NULL DEFAULT 1.0,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (realm_id) REFERENCES realms(id)
            );

            CREATE TABLE IF NOT EXISTS relations (
                from_lore_id TEXT NOT NULL,
                relation_type TEXT NOT NULL,
                to_lore_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (from_lore_id, relation_type, to_lore_id)
            );

            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                sync_enabled INTEGER NOT NULL DEFAULT 1,
                sync_repo TEXT,
                sync_branch TEXT NOT NULL DEFAULT 'main',
                auto_sync INTEGER NOT NULL DEFAULT 0,
                sync_interval INTEGER NOT NULL DEFAULT 300,
                filters TEXT NOT NULL DEFAULT '{}',
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS realm_workspaces (
                realm_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                PRIMARY KEY (realm_id, workspace_id)
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                workspace_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                last_sync_at TEXT,
                last_sync_commit TEXT,
                vector_clock TEXT NOT NULL DEFAULT '{}',
                pending_changes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (workspace_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS sync_entity_clocks (
                workspace_id TEXT NOT NULL,
                entity TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                PRIMARY KEY (workspace_id, entity, entity_id)
            );

            CREATE TABLE IF NOT EXISTS sync_applied_events (
                workspace_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, event_id)
            );

            CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                entity TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_data TEXT,
                remote_data TEXT,
                local_clock TEXT NOT NULL,
                remote_clock TEXT NOT NULL,
                remote_event_id TEXT NOT NULL,
                remote_device_id TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0
            );

            -- Indexes for common queries
            CREATE INDEX IF NOT EXISTS idx_lores_realm_id ON lores(realm_id);
            CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_lore_id);
            CREATE INDEX IF NOT EXISTS idx_realm_workspaces_workspace ON realm_workspaces(workspace_id);
            CREATE INDEX IF NOT EXISTS idx_sync_conflicts_workspace ON sync_conflicts(workspace_id);
            "#,
        )?;
        Ok(())
    }

    // ==================== Realms ====================

    /// Insert or replace a realm
    pub fn upsert_realm(&self, realm: &Realm) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO realms (id, name, path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = ?2,
                path = ?3,
                updated_at = ?5
            "#,
            params![
                realm.id.to_string(),
                realm.name,
                realm.path,
                realm.created_at.to_rfc3339(),
                realm.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_realm(&self, id: &Uuid) -> Result<Option<Realm>> {
        self.conn
            .query_row(
                &format!("SELECT {REALM_COLUMNS} FROM realms WHERE id = ?1"),
                params![id.to_string()],
                Self::row_to_realm,
            )
            .optional()
            .context("Failed to get realm")
    }

    pub fn find_realm_by_name(&self, name: &str) -> Result<Option<Realm>> {
        self.conn
            .query_row(
                &format!("SELECT {REALM_COLUMNS} FROM realms WHERE name = ?1 ORDER BY created_at LIMIT 1"),
                params![name],
                Self::row_to_realm,
            )
            .optional()
            .context("Failed to find realm")
    }

    pub fn list_realms(&self) -> Result<Vec<Realm>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {REALM_COLUMNS} FROM realms ORDER BY name, id"))?;
        let rows = stmt.query_map([], Self::row_to_realm)?;
        rows.collect::<Result<Vec<_>, _>>().context("Failed to list realms")
    }

    /// Delete a realm together with its lores, their relations and its
    /// workspace links. Returns false if the realm did not exist.
    pub fn delete_realm(&self, id: &Uuid) -> Result<bool> {
        let id = id.to_string();
        self.conn.execute(
            "DELETE FROM relations
             WHERE from_lore_id IN (SELECT id FROM lores WHERE realm_id = ?1)
                OR to_lore_id IN (SELECT id FROM lores WHERE realm_id = ?1)",
            params![id],
        )?;
        self.conn
            .execute("DELETE FROM lores WHERE realm_id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM realm_workspaces WHERE realm_id = ?1", params![id])?;
        let deleted = self
            .conn
            .execute("DELETE FROM realms WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn row_to_realm(row: &Row) -> rusqlite::Result<Realm> {
        Ok(Realm {
            id: uuid_col(row, 0)?,
            name: row.get(1)?,
            path: row.get(2)?,
            created_at: time_col(row, 3)?,
            updated_at: time_col(row, 4)?,
        })
    }

    // ==================== Lores ====================

    /// Insert or replace a lore
    pub fn upsert_lore(&self, lore: &Lore) -> Result<()> {
        // Replayed events may carry tags in any order.
        let tags = serde_json::to_string(&normalize_tags(lore.tags.iter().cloned()))?;
        self.conn.execute(
            r#"
            INSERT INTO lores (id, realm_id, lore_type, content, why, confidence, tags, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                realm_id = ?2,
                lore_type = ?3,
                content = ?4,
                why = ?5,
                confidence = ?6,
                tags = ?7,
                updated_at = ?9
            "#,
            params![
                lore.id.to_string(),
                lore.realm_id.to_string(),
                lore.lore_type.as_str(),
                lore.content,
                lore.why,
                lore.confidence,
                tags,
                lore.created_at.to_rfc3339(),
                lore.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_lore(&self, id: &Uuid) -> Result<Option<Lore>> {
        self.conn
            .query_row(
                &format!("SELECT {LORE_COLUMNS} FROM lores WHERE id = ?1"),
                params![id.to_string()],
                Self::row_to_lore,
            )
            .optional()
            .context("Failed to get lore")
    }

    /// List lores, optionally limited to one realm, newest first
    pub fn list_lores(&self, realm_id: Option<&Uuid>) -> Result<Vec<Lore>> {
        let mut stmt = if realm_id.is_some() {
            self.conn.prepare(&format!(
                "SELECT {LORE_COLUMNS} FROM lores WHERE realm_id = ?1 ORDER BY created_at DESC, id"
            ))?
        } else {
            self.conn.prepare(&format!(
                "SELECT {LORE_COLUMNS} FROM lores ORDER BY created_at DESC, id"
            ))?
        };

        let rows = if let Some(realm_id) = realm_id {
            stmt.query_map(params![realm_id.to_string()], Self::row_to_lore)?
        } else {
            stmt.query_map([], Self::row_to_lore)?
        };

        rows.collect::<Result<Vec<_>, _>>().context("Failed to list lores")
    }

    /// Delete a lore and every relation touching it
    pub fn delete_lore(&self, id: &Uuid) -> Result<bool> {
        let id = id.to_string();
        self.conn.execute(
            "DELETE FROM relations WHERE from_lore_id = ?1 OR to_lore_id = ?1",
            params![id],
        )?;
        let deleted = self
            .conn
            .execute("DELETE FROM lores WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn row_to_lore(row: &Row) -> rusqlite::Result<Lore> {
        let lore_type: String = row.get(2)?;
        Ok(Lore {
            id: uuid_col(row, 0)?,
            realm_id: uuid_col(row, 1)?,
            lore_type: lore_type
                .parse()
                .map_err(|e: String| conversion_error(2, e))?,
            content: row.get(3)?,
            why: row.get(4)?,
            confidence: row.get(5)?,
            tags: json_col(row, 6)?,
            created_at: time_col(row, 7)?,
            updated_at: time_col(row, 8)?,
        })
    }

    // ==================== Relations ====================

    pub fn upsert_relation(&self, relation: &Relation) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO relations (from_lore_id, relation_type, to_lore_id, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(from_lore_id, relation_type, to_lore_id) DO NOTHING
            "#,
            params![
                relation.from_lore_id.to_string(),
                relation.relation_type.as_str(),
                relation.to_lore_id.to_string(),
                relation.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_relation(
        &self,
        from: &Uuid,
        relation_type: RelationType,
        to: &Uuid,
    ) -> Result<Option<Relation>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RELATION_COLUMNS} FROM relations
                     WHERE from_lore_id = ?1 AND relation_type = ?2 AND to_lore_id = ?3"
                ),
                params![from.to_string(), relation_type.as_str(), to.to_string()],
                Self::row_to_relation,
            )
            .optional()
            .context("Failed to get relation")
    }

    pub fn list_relations(&self) -> Result<Vec<Relation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations ORDER BY from_lore_id, relation_type, to_lore_id"
        ))?;
        let rows = stmt.query_map([], Self::row_to_relation)?;
        rows.collect::<Result<Vec<_>, _>>().context("Failed to list relations")
    }

    /// Relations where the lore is either endpoint
    pub fn relations_for_lore(&self, lore_id: &Uuid) -> Result<Vec<Relation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations
             WHERE from_lore_id = ?1 OR to_lore_id = ?1
             ORDER BY from_lore_id, relation_type, to_lore_id"
        ))?;
        let rows = stmt.query_map(params![lore_id.to_string()], Self::row_to_relation)?;
        rows.collect::<Result<Vec<_>, _>>().context("Failed to list relations")
    }

    pub fn delete_relation(
        &self,
        from: &Uuid,
        relation_type: RelationType,
        to: &Uuid,
    ) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM relations WHERE from_lore_id = ?1 AND relation_type = ?2 AND to_lore_id = ?3",
            params![from.to_string(), relation_type.as_str(), to.to_string()],
        )?;
        Ok(deleted > 0)
    }

    fn row_to_relation(row: &Row) -> rusqlite::Result<Relation> {
        let relation_type: String = row.get(1)?;
        Ok(Relation {
            from_lore_id: uuid_col(row, 0)?,
            relation_type: relation_type
                .parse()
                .map_err(|e: String| conversion_error(1, e))?,
            to_lore_id: uuid_col(row, 2)?,
            created_at: time_col(row, 3)?,
        })
    }

    // ==================== Workspaces ====================

    pub fn insert_workspace(&self, workspace: &Workspace) -> Result<()> {
        if workspace.is_default {
            self.conn
                .execute("UPDATE workspaces SET is_default = 0", [])?;
        }
        self.conn
            .execute(
                r#"
                INSERT INTO workspaces (id, name, sync_enabled, sync_repo, sync_branch, auto_sync, sync_interval, filters, is_default, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    workspace.id.to_string(),
                    workspace.name,
                    workspace.sync_enabled,
                    workspace.sync_repo,
                    workspace.sync_branch,
                    workspace.auto_sync,
                    workspace.sync_interval as i64,
                    serde_json::to_string(&workspace.filters)?,
                    workspace.is_default,
                    workspace.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to create workspace '{}'", workspace.name))?;
        Ok(())
    }

    pub fn update_workspace(&self, workspace: &Workspace) -> Result<()> {
        if workspace.is_default {
            self.conn.execute(
                "UPDATE workspaces SET is_default = 0 WHERE id != ?1",
                params![workspace.id.to_string()],
            )?;
        }
        self.conn.execute(
            r#"
            UPDATE workspaces SET
                name = ?2,
                sync_enabled = ?3,
                sync_repo = ?4,
                sync_branch = ?5,
                auto_sync = ?6,
                sync_interval = ?7,
                filters = ?8,
                is_default = ?9
            WHERE id = ?1
            "#,
            params![
                workspace.id.to_string(),
                workspace.name,
                workspace.sync_enabled,
                workspace.sync_repo,
                workspace.sync_branch,
                workspace.auto_sync,
                workspace.sync_interval as i64,
                serde_json::to_string(&workspace.filters)?,
                workspace.is_default,
            ],
        )?;
        Ok(())
    }

    pub fn find_workspace(&self, id: &Uuid) -> Result<Option<Workspace>> {
        self.conn
            .query_row(
                &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"),
                params![id.to_string()],
                Self::row_to_workspace,
            )
            .optional()
            .context("Failed to get workspace")
    }

    pub fn find_workspace_by_name(&self, name: &str) -> Result<Option<Workspace>> {
        self.conn
            .query_row(
                &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE name = ?1"),
                params![name],
                Self::row_to_workspace,
            )
            .optional()
            .context("Failed to find workspace")
    }

    /// Looks a workspace up by id first, then by name
    pub fn find_workspace_by_key(&self, key: &str) -> Result<Option<Workspace>> {
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(workspace) = self.find_workspace(&id)? {
                return Ok(Some(workspace));
            }
        }
        self.find_workspace_by_name(key)
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces ORDER BY name"
        ))?;
        let rows = stmt.query_map([], Self::row_to_workspace)?;
        rows.collect::<Result<Vec<_>, _>>().context("Failed to list workspaces")
    }

    pub fn get_default_workspace(&self) -> Result<Option<Workspace>> {
        self.conn
            .query_row(
                &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE is_default = 1 LIMIT 1"),
                [],
                Self::row_to_workspace,
            )
            .optional()
            .context("Failed to get default workspace")
    }

    fn row_to_workspace(row: &Row) -> rusqlite::Result<Workspace> {
        let sync_interval: i64 = row.get(6)?;
        Ok(Workspace {
            id: uuid_col(row, 0)?,
            name: row.get(1)?,
            sync_enabled: row.get(2)?,
            sync_repo: row.get(3)?,
            sync_branch: row.get(4)?,
            auto_sync: row.get(5)?,
            sync_interval: sync_interval.max(0) as u64,
            filters: json_col(row, 7)?,
            is_default: row.get(8)?,
            created_at: time_col(row, 9)?,
        })
    }

    // ==================== Realm Workspaces ====================

    /// Link a realm to a workspace. Linking twice is a no-op.
    pub fn attach_realm(&self, realm_id: &Uuid, workspace_id: &Uuid) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO realm_workspaces (realm_id, workspace_id) VALUES (?1, ?2)",
            params![realm_id.to_string(), workspace_id.to_string()],
        )?;
        Ok(inserted > 0)
    }

    pub fn detach_realm(&self, realm_id: &Uuid, workspace_id: &Uuid) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM realm_workspaces WHERE realm_id = ?1 AND workspace_id = ?2",
            params![realm_id.to_string(), workspace_id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    /// Workspaces a realm belongs to
    pub fn get_realm_workspaces(&self, realm_id: &Uuid) -> Result<Vec<Workspace>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM workspaces w
             JOIN realm_workspaces rw ON rw.workspace_id = w.id
             WHERE rw.realm_id = ?1
             ORDER BY w.name",
            prefixed(WORKSPACE_COLUMNS, "w")
        ))?;
        let rows = stmt.query_map(params![realm_id.to_string()], Self::row_to_workspace)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to get realm workspaces")
    }

    /// Realms that belong to a workspace
    pub fn get_workspace_realms(&self, workspace_id: &Uuid) -> Result<Vec<Realm>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM realms r
             JOIN realm_workspaces rw ON rw.realm_id = r.id
             WHERE rw.workspace_id = ?1
             ORDER BY r.id",
            prefixed(REALM_COLUMNS, "r")
        ))?;
        let rows = stmt.query_map(params![workspace_id.to_string()], Self::row_to_realm)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to get workspace realms")
    }

    // ==================== Sync State ====================

    pub fn load_sync_state(&self, workspace_id: &Uuid, device_id: &str) -> Result<Option<SyncState>> {
        self.conn
            .query_row(
                "SELECT workspace_id, device_id, last_sync_at, last_sync_commit, vector_clock, pending_changes
                 FROM sync_state WHERE workspace_id = ?1 AND device_id = ?2",
                params![workspace_id.to_string(), device_id],
                Self::row_to_sync_state,
            )
            .optional()
            .context("Failed to load sync state")
    }

    pub fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_state (workspace_id, device_id, last_sync_at, last_sync_commit, vector_clock, pending_changes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(workspace_id, device_id) DO UPDATE SET
                last_sync_at = ?3,
                last_sync_commit = ?4,
                vector_clock = ?5,
                pending_changes = ?6
            "#,
            params![
                state.workspace_id.to_string(),
                state.device_id,
                state.last_sync_at.map(|t| t.to_rfc3339()),
                state.last_sync_commit,
                serde_json::to_string(&state.vector_clock)?,
                state.pending_changes as i64,
            ],
        )?;
        Ok(())
    }

    fn row_to_sync_state(row: &Row) -> rusqlite::Result<SyncState> {
        let pending: i64 = row.get(5)?;
        Ok(SyncState {
            workspace_id: uuid_col(row, 0)?,
            device_id: row.get(1)?,
            last_sync_at: optional_time_col(row, 2)?,
            last_sync_commit: row.get(3)?,
            vector_clock: json_col(row, 4)?,
            pending_changes: pending.max(0) as u64,
        })
    }

    // ==================== Entity Clocks ====================

    /// Clock of the last known version of an entity in a workspace
    pub fn get_entity_clock(
        &self,
        workspace_id: &Uuid,
        entity: EntityKind,
        entity_id: &str,
    ) -> Result<Option<VectorClock>> {
        let clock: Option<String> = self
            .conn
            .query_row(
                "SELECT vector_clock FROM sync_entity_clocks
                 WHERE workspace_id = ?1 AND entity = ?2 AND entity_id = ?3",
                params![workspace_id.to_string(), entity.as_str(), entity_id],
                |row| row.get(0),
            )
            .optional()?;

        clock
            .map(|c| serde_json::from_str(&c).context("Failed to parse entity clock"))
            .transpose()
    }

    pub fn set_entity_clock(
        &self,
        workspace_id: &Uuid,
        entity: EntityKind,
        entity_id: &str,
        clock: &VectorClock,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_entity_clocks (workspace_id, entity, entity_id, vector_clock)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(workspace_id, entity, entity_id) DO UPDATE SET vector_clock = ?4
            "#,
            params![
                workspace_id.to_string(),
                entity.as_str(),
                entity_id,
                serde_json::to_string(clock)?,
            ],
        )?;
        Ok(())
    }

    // ==================== Applied Events ====================

    pub fn is_event_applied(&self, workspace_id: &Uuid, event_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_applied_events WHERE workspace_id = ?1 AND event_id = ?2",
            params![workspace_id.to_string(), event_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn mark_event_applied(&self, workspace_id: &Uuid, event_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO sync_applied_events (workspace_id, event_id, applied_at)
             VALUES (?1, ?2, ?3)",
            params![workspace_id.to_string(), event_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ==================== Conflicts ====================

    pub fn insert_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        let local_data = conflict
            .local_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let remote_data = conflict
            .remote_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            &format!(
                "INSERT INTO sync_conflicts ({CONFLICT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                conflict.id.to_string(),
                conflict.workspace_id.to_string(),
                conflict.entity.as_str(),
                conflict.entity_id,
                local_data,
                remote_data,
                serde_json::to_string(&conflict.local_clock)?,
                serde_json::to_string(&conflict.remote_clock)?,
                conflict.remote_event_id,
                conflict.remote_device_id,
                conflict.detected_at.to_rfc3339(),
                conflict.resolved,
            ],
        )?;
        Ok(())
    }

    /// Conflicts in a workspace, oldest first
    pub fn list_conflicts(&self, workspace_id: &Uuid, include_resolved: bool) -> Result<Vec<SyncConflict>> {
        let sql = if include_resolved {
            format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE workspace_id = ?1 ORDER BY detected_at, id")
        } else {
            format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE workspace_id = ?1 AND resolved = 0 ORDER BY detected_at, id")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workspace_id.to_string()], Self::row_to_conflict)?;
        rows.collect::<Result<Vec<_>, _>>().context("Failed to list conflicts")
    }

    pub fn unresolved_conflict_count(&self, workspace_id: &Uuid) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE workspace_id = ?1 AND resolved = 0",
            params![workspace_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn row_to_conflict(row: &Row) -> rusqlite::Result<SyncConflict> {
        let entity: String = row.get(2)?;
        Ok(SyncConflict {
            id: uuid_col(row, 0)?,
            workspace_id: uuid_col(row, 1)?,
            entity: entity.parse().map_err(|e: String| conversion_error(2, e))?,
            entity_id: row.get(3)?,
            local_data: optional_json_col(row, 4)?,
            remote_data: optional_json_col(row, 5)?,
            local_clock: json_col(row, 6)?,
            remote_clock: json_col(row, 7)?,
            remote_event_id: row.get(8)?,
            remote_device_id: row.get(9)?,
            detected_at: time_col(row, 10)?,
            resolved: row.get(11)?,
        })
    }

    // ==================== Stats ====================

    pub fn realm_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM realms", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn lore_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM lores", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Prefixes each column in a comma separated list with a table alias.
fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn conversion_error(idx: usize, message: impl Into<String>) -> rusqlite::Error {
    let message: String = message.into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn uuid_col(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let value: String = row.get(idx)?;
    Uuid::parse_str(&value).map_err(|e| conversion_error(idx, e.to_string()))
}

fn parse_time(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn time_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_time(idx, &value)
}

fn optional_time_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value.map(|v| parse_time(idx, &v)).transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    serde_json::from_str(&value).map_err(|e| conversion_error(idx, e.to_string()))
}

fn optional_json_col<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| serde_json::from_str(&v).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{LoreType, WorkspaceFilters};
    use tempfile::tempdir;

    /// Creates a test database in a temporary directory.
    /// Returns the Database instance and the temp directory (which must be kept alive).
    fn create_test_db() -> (Database, tempfile::TempDir) {
        let dir = tempdir().expect("Failed to create temp directory");
        let db_path = dir.path().join("test.db");
        let db = Database::open(&db_path).expect("Failed to open test database");
        (db, dir)
    }

    // ==================== Realm Tests ====================

    #[test]
    fn test_insert_and_get_realm() {
        let (db, _dir) = create_test_db();
        let realm = Realm::new("api", "/home/user/api");

        db.upsert_realm(&realm).expect("Failed to insert realm");

        let retrieved = db
            .get_realm(&realm.id)
            .expect("Failed to get realm")
            .expect("Realm should exist");
        assert_eq!(retrieved, realm);
        assert_eq!(
            db.find_realm_by_name("api").unwrap().map(|r| r.id),
            Some(realm.id)
        );
    }

    #[test]
    fn test_delete_realm_cascades() {
        let (db, _dir) = create_test_db();
        let realm = Realm::new("api", "/api");
        let workspace = Workspace::new("team");
        let a = Lore::new(realm.id, LoreType::Decision, "use sqlite");
        let b = Lore::new(realm.id, LoreType::Risk, "single writer");

        db.upsert_realm(&realm).unwrap();
        db.insert_workspace(&workspace).unwrap();
        db.attach_realm(&realm.id, &workspace.id).unwrap();
        db.upsert_lore(&a).unwrap();
        db.upsert_lore(&b).unwrap();
        db.upsert_relation(&Relation::new(a.id, RelationType::DependsOn, b.id))
            .unwrap();

        assert!(db.delete_realm(&realm.id).unwrap());
        assert!(db.get_realm(&realm.id).unwrap().is_none());
        assert_eq!(db.lore_count().unwrap(), 0);
        assert!(db.list_relations().unwrap().is_empty());
        assert!(db.get_workspace_realms(&workspace.id).unwrap().is_empty());
        assert!(!db.delete_realm(&realm.id).unwrap(), "Second delete is a no-op");
    }

    // ==================== Lore Tests ====================

    #[test]
    fn test_upsert_lore_updates_in_place() {
        let (db, _dir) = create_test_db();
        let realm = Realm::new("api", "/api");
        db.upsert_realm(&realm).unwrap();

        let mut lore = Lore::new(realm.id, LoreType::Learning, "cache invalidation is hard");
        lore.tags = vec!["cache".to_string(), "perf".to_string()];
        lore.why = Some("we got burned".to_string());
        db.upsert_lore(&lore).unwrap();

        lore.content = "cache invalidation is very hard".to_string();
        lore.confidence = 0.8;
        db.upsert_lore(&lore).unwrap();

        let retrieved = db.get_lore(&lore.id).unwrap().expect("Lore should exist");
        assert_eq!(retrieved, lore);
        assert_eq!(db.lore_count().unwrap(), 1);
    }

    #[test]
    fn test_lore_tags_come_back_sorted() {
        let (db, _dir) = create_test_db();
        let realm = Realm::new("api", "/api");
        db.upsert_realm(&realm).unwrap();

        let mut lore = Lore::new(realm.id, LoreType::Pattern, "retry with backoff");
        lore.tags = vec!["net".to_string(), "db".to_string(), "net".to_string()];
        db.upsert_lore(&lore).unwrap();

        let retrieved = db.get_lore(&lore.id).unwrap().expect("Lore should exist");
        assert_eq!(retrieved.tags, vec!["db", "net"]);

        lore.set_tags(vec!["z".to_string(), "a".to_string(), "z".to_string()]);
        assert_eq!(lore.tags, vec!["a", "z"]);
    }

    #[test]
    fn test_list_lores_by_realm() {
        let (db, _dir) = create_test_db();
        let api = Realm::new("api", "/api");
        let web = Realm::new("web", "/web");
        db.upsert_realm(&api).unwrap();
        db.upsert_realm(&web).unwrap();

        db.upsert_lore(&Lore::new(api.id, LoreType::Decision, "one")).unwrap();
        db.upsert_lore(&Lore::new(api.id, LoreType::Decision, "two")).unwrap();
        db.upsert_lore(&Lore::new(web.id, LoreType::Decision, "three")).unwrap();

        assert_eq!(db.list_lores(Some(&api.id)).unwrap().len(), 2);
        assert_eq!(db.list_lores(Some(&web.id)).unwrap().len(), 1);
        assert_eq!(db.list_lores(None).unwrap().len(), 3);
    }

    #[test]
    fn test_delete_lore_removes_relations() {
        let (db, _dir) = create_test_db();
        let realm = Realm::new("api", "/api");
        let a = Lore::new(realm.id, LoreType::Decision, "a");
        let b = Lore::new(realm.id, LoreType::Decision, "b");
        db.upsert_lore(&a).unwrap();
        db.upsert_lore(&b).unwrap();
        db.upsert_relation(&Relation::new(b.id, RelationType::Supersedes, a.id))
            .unwrap();

        assert!(db.delete_lore(&a.id).unwrap());
        assert!(db.relations_for_lore(&b.id).unwrap().is_empty());
    }

    // ==================== Relation Tests ====================

    #[test]
    fn test_relation_lifecycle() {
        let (db, _dir) = create_test_db();
        let rel = Relation::new(Uuid::new_v4(), RelationType::Contradicts, Uuid::new_v4());

        db.upsert_relation(&rel).unwrap();
        db.upsert_relation(&rel).unwrap();
        assert_eq!(db.list_relations().unwrap().len(), 1, "Upsert is idempotent");

        let found = db
            .get_relation(&rel.from_lore_id, rel.relation_type, &rel.to_lore_id)
            .unwrap();
        assert_eq!(found, Some(rel.clone()));

        assert!(db
            .delete_relation(&rel.from_lore_id, rel.relation_type, &rel.to_lore_id)
            .unwrap());
        assert!(db.list_relations().unwrap().is_empty());
    }

    // ==================== Workspace Tests ====================

    #[test]
    fn test_workspace_lookup() {
        let (db, _dir) = create_test_db();
        let mut workspace = Workspace::new("team");
        workspace.sync_repo = Some("git@example.com:team/lore.git".to_string());
        workspace.filters = WorkspaceFilters {
            min_confidence: Some(0.5),
            ..Default::default()
        };
        db.insert_workspace(&workspace).unwrap();

        assert_eq!(db.find_workspace(&workspace.id).unwrap(), Some(workspace.clone()));
        assert_eq!(
            db.find_workspace_by_name("team").unwrap(),
            Some(workspace.clone())
        );
        assert_eq!(
            db.find_workspace_by_key(&workspace.id.to_string()).unwrap(),
            Some(workspace.clone())
        );
        assert_eq!(db.find_workspace_by_key("team").unwrap(), Some(workspace));
        assert!(db.find_workspace_by_key("other").unwrap().is_none());
    }

    #[test]
    fn test_workspace_names_are_unique() {
        let (db, _dir) = create_test_db();
        db.insert_workspace(&Workspace::new("team")).unwrap();
        assert!(db.insert_workspace(&Workspace::new("team")).is_err());
    }

    #[test]
    fn test_single_default_workspace() {
        let (db, _dir) = create_test_db();
        let mut first = Workspace::new("first");
        first.is_default = true;
        db.insert_workspace(&first).unwrap();

        let mut second = Workspace::new("second");
        db.insert_workspace(&second).unwrap();
        second.is_default = true;
        db.update_workspace(&second).unwrap();

        let default = db.get_default_workspace().unwrap().expect("Default should exist");
        assert_eq!(default.id, second.id);
        let first = db.find_workspace(&first.id).unwrap().unwrap();
        assert!(!first.is_default);
    }

    #[test]
    fn test_realm_workspace_links() {
        let (db, _dir) = create_test_db();
        let realm = Realm::new("api", "/api");
        let team = Workspace::new("team");
        let personal = Workspace::new("personal");
        db.upsert_realm(&realm).unwrap();
        db.insert_workspace(&team).unwrap();
        db.insert_workspace(&personal).unwrap();

        assert!(db.attach_realm(&realm.id, &team.id).unwrap());
        assert!(!db.attach_realm(&realm.id, &team.id).unwrap());
        db.attach_realm(&realm.id, &personal.id).unwrap();

        let names: Vec<_> = db
            .get_realm_workspaces(&realm.id)
            .unwrap()
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(names, vec!["personal", "team"]);

        assert!(db.detach_realm(&realm.id, &personal.id).unwrap());
        assert_eq!(db.get_realm_workspaces(&realm.id).unwrap().len(), 1);
        assert_eq!(db.get_workspace_realms(&team.id).unwrap(), vec![realm]);
    }

    // ==================== Sync Tests ====================

    #[test]
    fn test_sync_state_persistence() {
        let (db, _dir) = create_test_db();
        let workspace_id = Uuid::new_v4();
        assert!(db.load_sync_state(&workspace_id, "laptop").unwrap().is_none());

        let mut state = SyncState::new(workspace_id, "laptop");
        state.tick();
        state.record_push("abc123", 1);
        db.save_sync_state(&state).unwrap();

        state.tick();
        db.save_sync_state(&state).unwrap();

        let loaded = db
            .load_sync_state(&workspace_id, "laptop")
            .unwrap()
            .expect("State should exist");
        assert_eq!(loaded, state);
        assert!(db.load_sync_state(&workspace_id, "desktop").unwrap().is_none());
    }

    #[test]
    fn test_entity_clocks() {
        let (db, _dir) = create_test_db();
        let workspace_id = Uuid::new_v4();
        assert!(db
            .get_entity_clock(&workspace_id, EntityKind::Lore, "l1")
            .unwrap()
            .is_none());

        let clock = VectorClock::from([("a", 2), ("b", 1)]);
        db.set_entity_clock(&workspace_id, EntityKind::Lore, "l1", &clock)
            .unwrap();
        let newer = VectorClock::from([("a", 3), ("b", 1)]);
        db.set_entity_clock(&workspace_id, EntityKind::Lore, "l1", &newer)
            .unwrap();

        assert_eq!(
            db.get_entity_clock(&workspace_id, EntityKind::Lore, "l1").unwrap(),
            Some(newer)
        );
        assert!(db
            .get_entity_clock(&workspace_id, EntityKind::Realm, "l1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_applied_events() {
        let (db, _dir) = create_test_db();
        let workspace_id = Uuid::new_v4();
        assert!(!db.is_event_applied(&workspace_id, "e1").unwrap());
        db.mark_event_applied(&workspace_id, "e1").unwrap();
        db.mark_event_applied(&workspace_id, "e1").unwrap();
        assert!(db.is_event_applied(&workspace_id, "e1").unwrap());
        assert!(!db.is_event_applied(&Uuid::new_v4(), "e1").unwrap());
    }

    #[test]
    fn test_conflicts_keep_both_versions() {
        use crate::sync::{Change, ChangeEvent, ChangeOperation};

        let (db, _dir) = create_test_db();
        let workspace_id = Uuid::new_v4();
        let remote = ChangeEvent::stamp(
            Change::new(ChangeOperation::Update, EntityKind::Lore, "l1")
                .with_data(serde_json::json!({"content": "remote"})),
            "desktop",
            VectorClock::from([("desktop", 2), ("laptop", 1)]),
        );
        let conflict = SyncConflict::new(
            workspace_id,
            &remote,
            Some(serde_json::json!({"content": "local"})),
            VectorClock::from([("desktop", 1), ("laptop", 2)]),
        );
        db.insert_conflict(&conflict).unwrap();

        assert_eq!(db.unresolved_conflict_count(&workspace_id).unwrap(), 1);
        let stored = db.list_conflicts(&workspace_id, false).unwrap();
        assert_eq!(stored, vec![conflict]);
        assert_eq!(
            stored[0].local_data,
            Some(serde_json::json!({"content": "local"}))
        );
        assert_eq!(
            stored[0].remote_data,
            Some(serde_json::json!({"content": "remote"}))
        );
    }
}
