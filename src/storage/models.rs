//! Core data models for Lore
//!
//! Realms are the projects lore is recorded against; workspaces group
//! realms into sync scopes backed by one remote repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A tracked project or codebase that owns lores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Realm {
    /// Unique identifier
    pub id: Uuid,

    /// Display name (usually the directory name)
    pub name: String,

    /// Absolute path on disk on the device that created it
    pub path: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Realm {
    pub fn new(name: &str, path: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            path: path.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A recorded fact about a project: why something is the way it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lore {
    /// Unique identifier
    pub id: Uuid,

    /// Realm this lore belongs to
    pub realm_id: Uuid,

    /// What kind of knowledge this is
    pub lore_type: LoreType,

    /// The lore itself
    pub content: String,

    /// Optional reasoning behind it
    pub why: Option<String>,

    /// How sure the author is, between 0.0 and 1.0
    pub confidence: f64,

    /// Free-form tags, kept sorted for stable output
    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lore {
    pub fn new(realm_id: Uuid, lore_type: LoreType, content: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            realm_id,
            lore_type,
            content: content.to_string(),
            why: None,
            confidence: 1.0,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the tags, sorted and without duplicates.
    pub fn set_tags(&mut self, tags: impl IntoIterator<Item = String>) {
        self.tags = normalize_tags(tags);
    }
}

pub(crate) fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut tags: Vec<String> = tags.into_iter().collect();
    tags.sort();
    tags.dedup();
    tags
}

/// The kind of knowledge a lore records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoreType {
    Decision,
    Risk,
    Learning,
    Constraint,
    Pattern,
    Assumption,
}

impl LoreType {
    pub const ALL: [LoreType; 6] = [
        LoreType::Decision,
        LoreType::Risk,
        LoreType::Learning,
        LoreType::Constraint,
        LoreType::Pattern,
        LoreType::Assumption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoreType::Decision => "decision",
            LoreType::Risk => "risk",
            LoreType::Learning => "learning",
            LoreType::Constraint => "constraint",
            LoreType::Pattern => "pattern",
            LoreType::Assumption => "assumption",
        }
    }
}

impl std::fmt::Display for LoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LoreType::ALL
            .iter()
            .find(|t| t.as_str() == s.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| format!("unknown lore type '{s}'"))
    }
}

/// A directed link between two lores.
///
/// Identified by the composite key `(from_lore_id, relation_type, to_lore_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from_lore_id: Uuid,
    pub relation_type: RelationType,
    pub to_lore_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Relation {
    pub fn new(from_lore_id: Uuid, relation_type: RelationType, to_lore_id: Uuid) -> Self {
        Self {
            from_lore_id,
            relation_type,
            to_lore_id,
            created_at: Utc::now(),
        }
    }

    /// Composite key used as the entity id of relation change events.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.from_lore_id, self.relation_type, self.to_lore_id
        )
    }

    /// Parses a key produced by [`Relation::key`].
    pub fn parse_key(key: &str) -> Option<(Uuid, RelationType, Uuid)> {
        let mut parts = key.splitn(3, ':');
        let from = Uuid::parse_str(parts.next()?).ok()?;
        let relation_type = parts.next()?.parse().ok()?;
        let to = Uuid::parse_str(parts.next()?).ok()?;
        Some((from, relation_type, to))
    }
}

/// How one lore relates to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Supersedes,
    DependsOn,
    RelatesTo,
    Contradicts,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Supersedes => "supersedes",
            RelationType::DependsOn => "depends_on",
            RelationType::RelatesTo => "relates_to",
            RelationType::Contradicts => "contradicts",
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "supersedes" => Ok(RelationType::Supersedes),
            "depends_on" => Ok(RelationType::DependsOn),
            "relates_to" => Ok(RelationType::RelatesTo),
            "contradicts" => Ok(RelationType::Contradicts),
            _ => Err(format!("unknown relation type '{s}'")),
        }
    }
}

/// A named sync scope grouping realms against one remote repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    /// Unique identifier (local to this device)
    pub id: Uuid,

    /// Unique name, shared across devices by convention
    pub name: String,

    /// Whether push/pull and change routing are active
    pub sync_enabled: bool,

    /// Remote repository URL or path
    pub sync_repo: Option<String>,

    /// Branch on the remote that carries this workspace
    pub sync_branch: String,

    /// Push in the background after every recorded change
    pub auto_sync: bool,

    /// Seconds between periodic syncs in `lore sync watch`
    pub sync_interval: u64,

    /// Record filters applied to exports and recorded changes
    pub filters: WorkspaceFilters,

    /// Whether this is the fallback workspace for unscoped changes
    pub is_default: bool,

    pub created_at: DateTime<Utc>,
}

/// Default branch for new workspaces.
pub const DEFAULT_SYNC_BRANCH: &str = "main";

/// Default periodic sync interval in seconds.
pub const DEFAULT_SYNC_INTERVAL: u64 = 300;

impl Workspace {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            sync_enabled: true,
            sync_repo: None,
            sync_branch: DEFAULT_SYNC_BRANCH.to_string(),
            auto_sync: false,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            filters: WorkspaceFilters::default(),
            is_default: false,
            created_at: Utc::now(),
        }
    }
}

/// Record filters for a workspace.
///
/// An empty filter admits everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceFilters {
    /// Only these lore types are synced (all types when empty)
    pub lore_types: BTreeSet<LoreType>,

    /// Lores carrying any of these tags are never synced
    pub exclude_tags: BTreeSet<String>,

    /// Lores below this confidence are never synced
    pub min_confidence: Option<f64>,
}

impl WorkspaceFilters {
    pub fn is_empty(&self) -> bool {
        self.lore_types.is_empty() && self.exclude_tags.is_empty() && self.min_confidence.is_none()
    }

    /// Whether a lore passes this filter.
    pub fn admits(&self, lore: &Lore) -> bool {
        if !self.lore_types.is_empty() && !self.lore_types.contains(&lore.lore_type) {
            return false;
        }
        if lore.tags.iter().any(|t| self.exclude_tags.contains(t)) {
            return false;
        }
        if let Some(min) = self.min_confidence {
            if lore.confidence < min {
                return false;
            }
        }
        true
    }
}

/// Membership of a realm in a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmWorkspace {
    pub realm_id: Uuid,
    pub workspace_id: Uuid,
}
