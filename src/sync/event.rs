//! Change events and the per-device change log.
//!
//! Every local mutation becomes one [`ChangeEvent`]. Events are appended to
//! `changes/<device>.jsonl` in the workspace working tree, one JSON object
//! per line. Each device only ever writes its own file, so logs from
//! different devices never collide in git.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::clock::VectorClock;

/// Directory inside the working tree holding the change logs.
pub const CHANGES_DIR: &str = "changes";

/// Extension of change log files.
const LOG_EXTENSION: &str = "jsonl";

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// The kind of record a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Lore,
    Realm,
    Relation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Lore => "lore",
            EntityKind::Realm => "realm",
            EntityKind::Relation => "relation",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lore" => Ok(EntityKind::Lore),
            "realm" => Ok(EntityKind::Realm),
            "relation" => Ok(EntityKind::Relation),
            _ => Err(format!("unknown entity kind '{s}'")),
        }
    }
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// Routing and identity details attached to a change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeMetadata {
    /// Workspace id or name the change is scoped to
    pub workspace_id: Option<String>,

    /// Realm the changed entity belongs to
    pub realm_id: Option<Uuid>,

    /// Composite key for relation changes
    pub relation: Option<String>,
}

/// A mutation as reported by the data layer, before it is stamped with
/// an id, timestamp, device and clock.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub id: Option<String>,
    pub operation: ChangeOperation,
    pub entity: EntityKind,
    pub entity_id: String,
    pub data: Option<serde_json::Value>,
    pub metadata: ChangeMetadata,
}

impl Change {
    pub fn new(operation: ChangeOperation, entity: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            id: None,
            operation,
            entity,
            entity_id: entity_id.into(),
            data: None,
            metadata: ChangeMetadata::default(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_metadata(mut self, metadata: ChangeMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One durable, causally stamped mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub operation: ChangeOperation,
    pub entity: EntityKind,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: ChangeMetadata,
    /// Clock of the recording device right after this event
    pub clock: VectorClock,
}

impl ChangeEvent {
    /// Stamps a change with identity and causality.
    pub fn stamp(change: Change, device_id: &str, clock: VectorClock) -> Self {
        Self {
            id: change.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: Utc::now(),
            device_id: device_id.to_string(),
            operation: change.operation,
            entity: change.entity,
            entity_id: change.entity_id,
            data: change.data,
            metadata: change.metadata,
            clock,
        }
    }

    /// Position of this event in its device's sequence.
    pub fn counter(&self) -> u64 {
        self.clock.get(&self.device_id)
    }

    /// Order in which events should be replayed. Sorting by clock sum
    /// keeps causally earlier events first.
    pub fn replay_key(&self) -> (u64, DateTime<Utc>, &str) {
        (self.clock.sum(), self.timestamp, self.id.as_str())
    }
}

/// File name of a device's change log.
pub fn log_file_name(device_id: &str) -> String {
    let safe: String = device_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.{LOG_EXTENSION}")
}

/// Path of a device's change log inside a working tree.
pub fn log_path(workdir: &Path, device_id: &str) -> PathBuf {
    workdir.join(CHANGES_DIR).join(log_file_name(device_id))
}

/// Whether a tree entry name looks like a change log.
pub fn is_log_file(name: &str) -> bool {
    name.ends_with(&format!(".{LOG_EXTENSION}"))
}

/// Appends one event to a log file, creating it if needed.
pub fn append_event(path: &Path, event: &ChangeEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let line = serde_json::to_string(event).context("Failed to serialize change event")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open change log {}", path.display()))?;
    writeln!(file, "{line}").context("Failed to append change event")?;
    file.sync_data().context("Failed to flush change log")?;
    Ok(())
}

/// Parses log content. Lines that fail to parse (e.g. a torn final write)
/// are skipped with a warning.
pub fn parse_log(content: &[u8]) -> Vec<ChangeEvent> {
    String::from_utf8_lossy(content)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<ChangeEvent>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Skipping malformed change log line: {e}");
                None
            }
        })
        .collect()
}

/// Reads a log file. A missing file is an empty log.
pub fn read_log(path: &Path) -> Result<Vec<ChangeEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read(path)
        .with_context(|| format!("Failed to read change log {}", path.display()))?;
    Ok(parse_log(&content))
}

/// Union of two logs by event id, ordered by device counter then id.
pub fn merge_logs(local: Vec<ChangeEvent>, remote: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut by_id: BTreeMap<String, ChangeEvent> = BTreeMap::new();
    for event in local.into_iter().chain(remote) {
        by_id.entry(event.id.clone()).or_insert(event);
    }

    let mut events: Vec<ChangeEvent> = by_id.into_values().collect();
    events.sort_by(|a, b| {
        a.counter()
            .cmp(&b.counter())
            .then_with(|| a.id.cmp(&b.id))
    });
    events
}

/// Rewrites a log file with the given events.
pub fn write_log(path: &Path, events: &[ChangeEvent]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut content = String::new();
    for event in events {
        content.push_str(&serde_json::to_string(event)?);
        content.push('\n');
    }

    let temp_path = path.with_extension("jsonl.tmp");
    fs::write(&temp_path, content).context("Failed to write change log temp file")?;
    fs::rename(&temp_path, path).context("Failed to rename change log")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(device: &str, counter: u64) -> ChangeEvent {
        let mut clock = VectorClock::new();
        for _ in 0..counter {
            clock.increment(device);
        }
        ChangeEvent::stamp(
            Change::new(ChangeOperation::Create, EntityKind::Lore, Uuid::new_v4().to_string()),
            device,
            clock,
        )
    }

    #[test]
    fn test_stamp_fills_identity() {
        let change = Change::new(ChangeOperation::Update, EntityKind::Realm, "r1")
            .with_data(serde_json::json!({"name": "api"}));
        let stamped = ChangeEvent::stamp(change, "laptop", VectorClock::from([("laptop", 3)]));

        assert!(Uuid::parse_str(&stamped.id).is_ok());
        assert_eq!(stamped.device_id, "laptop");
        assert_eq!(stamped.counter(), 3);
        assert_eq!(stamped.entity_id, "r1");
    }

    #[test]
    fn test_stamp_keeps_existing_id() {
        let mut change = Change::new(ChangeOperation::Delete, EntityKind::Lore, "l1");
        change.id = Some("fixed-id".to_string());
        let stamped = ChangeEvent::stamp(change, "laptop", VectorClock::new());
        assert_eq!(stamped.id, "fixed-id");
    }

    #[test]
    fn test_append_and_read_log() {
        let dir = tempdir().unwrap();
        let path = log_path(dir.path(), "laptop");

        let first = event("laptop", 1);
        let second = event("laptop", 2);
        append_event(&path, &first).unwrap();
        append_event(&path, &second).unwrap();

        let events = read_log(&path).unwrap();
        assert_eq!(events, vec![first, second]);
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        assert!(read_log(&dir.path().join("nope.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_parse_skips_torn_lines() {
        let good = serde_json::to_string(&event("a", 1)).unwrap();
        let content = format!("{good}\n{{\"id\": \"trunc");
        assert_eq!(parse_log(content.as_bytes()).len(), 1);
    }

    #[test]
    fn test_merge_logs_is_union_in_counter_order() {
        let e1 = event("a", 1);
        let e2 = event("a", 2);
        let e3 = event("a", 3);

        let merged = merge_logs(vec![e1.clone(), e3.clone()], vec![e2.clone(), e1.clone()]);
        let ids: Vec<_> = merged.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![e1.id, e2.id, e3.id]);
    }

    #[test]
    fn test_log_file_name_is_safe() {
        assert_eq!(log_file_name("my laptop/1"), "my_laptop_1.jsonl");
        assert!(is_log_file("my_laptop_1.jsonl"));
        assert!(!is_log_file("realms.json"));
    }
}
