//! Config command - view and change settings in config.yaml.

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;

use lore_sync::config::{Config, CONFIG_KEYS};
use lore_sync::storage::db::default_db_path;

/// Arguments for the config command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore config                            Show configuration\n    \
    lore config get device_id              Print one value\n    \
    lore config set author_name \"Ada L\"    Change a value\n    \
    lore config set tracking_enabled false Stop recording changes")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<ConfigCommand>,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        Some(ConfigCommand::Show) | None => show_config(),
        Some(ConfigCommand::Get { key }) => get_config(&key),
        Some(ConfigCommand::Set { key, value }) => set_config(&key, &value),
    }
}

fn show_config() -> Result<()> {
    let mut config = Config::load()?;
    let device_id = config.get_or_create_device_id()?;

    println!("{}", "Lore Configuration".bold());
    println!();
    println!("  {}  {}", "Config file:".dimmed(), Config::config_path()?.display());
    println!("  {}  {}", "Database:".dimmed(), default_db_path()?.display());
    println!("  {}  {}", "Sync dir:".dimmed(), config.sync_dir()?.display());
    println!();
    println!("  {}  {}", "device_id".cyan(), device_id);
    for key in CONFIG_KEYS.iter().filter(|k| **k != "device_id") {
        let value = config.get(key)?;
        println!(
            "  {}  {}",
            key.cyan(),
            value.unwrap_or_else(|| "(unset)".dimmed().to_string())
        );
    }

    Ok(())
}

fn get_config(key: &str) -> Result<()> {
    let config = Config::load()?;
    match config.get(key)? {
        Some(value) => println!("{value}"),
        None => println!("{}", format!("Config key '{key}' is not set").yellow()),
    }
    Ok(())
}

fn set_config(key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("Value for '{key}' must not be empty");
    }
    let mut config = Config::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} {} = {}", "Set".green(), key.cyan(), value);
    Ok(())
}
