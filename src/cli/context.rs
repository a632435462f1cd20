//! Application context for CLI commands.
//!
//! This is the composition point: config, database, change tracker and the
//! tokio runtime that runs background pushes are created here once and
//! handed to the command.

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use tokio::runtime::Runtime;

use lore_sync::config::Config;
use lore_sync::storage::{shared, Database, SharedDatabase};
use lore_sync::store::LoreStore;
use lore_sync::sync::{ChangeTracker, TrackerSettings};

pub struct AppContext {
    pub config: Config,
    pub store: LoreStore,
    runtime: Runtime,
}

impl AppContext {
    /// Loads config, opens the default database and wires the tracker.
    pub fn open() -> Result<Self> {
        let mut config = Config::load()?;
        let settings = TrackerSettings::from_config(&mut config)?;
        let runtime = Runtime::new().context("Failed to start async runtime")?;

        let tracker = Arc::new(ChangeTracker::new(settings, runtime.handle().clone()));
        if !config.tracking_enabled {
            tracker.disable();
        }

        let db = shared(Database::open_default()?);
        let store = LoreStore::new(db, tracker);

        Ok(Self {
            config,
            store,
            runtime,
        })
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        self.store.tracker()
    }

    pub fn db(&self) -> &SharedDatabase {
        self.store.db()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Waits for background pushes started by this command and reports
    /// any that failed. The command itself has already succeeded.
    pub fn finish(self) -> Result<()> {
        self.runtime
            .block_on(self.store.tracker().wait_for_background());

        for error in self.store.tracker().drain_errors() {
            eprintln!(
                "{} background sync of '{}' failed: {}",
                "Warning:".yellow(),
                error.workspace,
                error.message
            );
        }
        Ok(())
    }
}
