//! Configuration management
//!
//! Settings live in `~/.lore/config.yaml` (or `$LORE_HOME/config.yaml`).
//! Missing keys fall back to defaults, so an absent file is a valid
//! configuration.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Environment variable that overrides the `~/.lore` data directory.
pub const LORE_HOME_ENV: &str = "LORE_HOME";

/// Default commit author used for sync commits.
const DEFAULT_AUTHOR_NAME: &str = "Lore Sync";
const DEFAULT_AUTHOR_EMAIL: &str = "lore-sync@localhost";

/// Keys accepted by `lore config get/set`.
pub const CONFIG_KEYS: &[&str] = &[
    "device_id",
    "device_name",
    "sync_dir",
    "tracking_enabled",
    "author_name",
    "author_email",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stable identifier of this device in vector clocks and log file names
    pub device_id: Option<String>,

    /// Human friendly device name
    pub device_name: Option<String>,

    /// Directory holding one git working tree per workspace
    pub sync_dir: Option<PathBuf>,

    /// Whether mutations are recorded for sync at all
    pub tracking_enabled: bool,

    /// Commit signature for sync commits
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: None,
            device_name: None,
            sync_dir: None,
            tracking_enabled: true,
            author_name: None,
            author_email: None,
        }
    }
}

/// Returns the Lore data directory, creating it if needed.
pub fn lore_home() -> Result<PathBuf> {
    let dir = match std::env::var_os(LORE_HOME_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .context("Could not find home directory")?
            .join(".lore"),
    };

    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir)
}

impl Config {
    /// Loads the configuration from the default path.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Loads the configuration from a specific file.
    ///
    /// Returns the default configuration if the file does not exist.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_saphyr::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Saves the configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Saves the configuration to a specific file, atomically.
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        let content = serde_saphyr::to_string(self).context("Failed to serialize config")?;

        let temp_path = path.with_extension("yaml.tmp");
        fs::write(&temp_path, content).context("Failed to write config temp file")?;
        fs::rename(&temp_path, path).context("Failed to rename config file")?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(lore_home()?.join("config.yaml"))
    }

    /// Returns the directory that holds sync working trees.
    pub fn sync_dir(&self) -> Result<PathBuf> {
        match &self.sync_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(lore_home()?.join("sync")),
        }
    }

    /// Returns the device ID, generating and persisting one if missing.
    pub fn get_or_create_device_id(&mut self) -> Result<String> {
        if let Some(id) = &self.device_id {
            return Ok(id.clone());
        }

        let id = generate_device_id();
        self.device_id = Some(id.clone());
        self.save()?;
        tracing::debug!("Generated device id {id}");
        Ok(id)
    }

    /// Commit author name and email for sync commits.
    pub fn author(&self) -> (String, String) {
        (
            self.author_name
                .clone()
                .unwrap_or_else(|| DEFAULT_AUTHOR_NAME.to_string()),
            self.author_email
                .clone()
                .unwrap_or_else(|| DEFAULT_AUTHOR_EMAIL.to_string()),
        )
    }

    /// Reads a single value by key.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let value = match key {
            "device_id" => self.device_id.clone(),
            "device_name" => self.device_name.clone(),
            "sync_dir" => self.sync_dir.as_ref().map(|p| p.display().to_string()),
            "tracking_enabled" => Some(self.tracking_enabled.to_string()),
            "author_name" => self.author_name.clone(),
            "author_email" => self.author_email.clone(),
            _ => bail!(
                "Unknown config key '{key}'. Valid keys: {}",
                CONFIG_KEYS.join(", ")
            ),
        };
        Ok(value)
    }

    /// Sets a single value by key. Does not save.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "device_id" => self.device_id = Some(value.to_string()),
            "device_name" => self.device_name = Some(value.to_string()),
            "sync_dir" => self.sync_dir = Some(PathBuf::from(value)),
            "tracking_enabled" => {
                self.tracking_enabled = parse_bool(value)
                    .with_context(|| format!("Invalid value for tracking_enabled: {value}"))?
            }
            "author_name" => self.author_name = Some(value.to_string()),
            "author_email" => self.author_email = Some(value.to_string()),
            _ => bail!(
                "Unknown config key '{key}'. Valid keys: {}",
                CONFIG_KEYS.join(", ")
            ),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => bail!("expected true or false, got '{other}'"),
    }
}

/// Builds a device id of the form `<hostname>-<8 hex chars>`.
fn generate_device_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| sanitize_host(&h))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "device".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.yaml")).unwrap();
        assert!(config.device_id.is_none());
        assert!(config.tracking_enabled);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.set("device_id", "laptop-1234abcd").unwrap();
        config.set("tracking_enabled", "false").unwrap();
        config.set("sync_dir", "/tmp/lore-sync").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.device_id.as_deref(), Some("laptop-1234abcd"));
        assert!(!loaded.tracking_enabled);
        assert_eq!(loaded.sync_dir, Some(PathBuf::from("/tmp/lore-sync")));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut config = Config::default();
        assert!(config.set("nope", "1").is_err());
        assert!(config.get("nope").is_err());
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let mut config = Config::default();
        assert!(config.set("tracking_enabled", "maybe").is_err());
    }

    #[test]
    fn test_generated_device_id_shape() {
        let id = generate_device_id();
        let (host, suffix) = id.rsplit_once('-').unwrap();
        assert!(!host.is_empty());
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_default_author() {
        let config = Config::default();
        let (name, email) = config.author();
        assert_eq!(name, DEFAULT_AUTHOR_NAME);
        assert_eq!(email, DEFAULT_AUTHOR_EMAIL);
    }
}
