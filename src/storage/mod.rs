//! Storage layer for Lore

pub mod db;
pub mod models;

pub use db::Database;
pub use models::*;

use std::sync::{Arc, Mutex, MutexGuard};

/// Database handle shared between the CLI, the tracker and sync adapters.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub fn shared(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

/// Locks the shared database.
///
/// A poisoned lock means another thread panicked mid-operation; that is
/// surfaced as an error instead of propagating the panic.
pub fn lock_db(db: &SharedDatabase) -> anyhow::Result<MutexGuard<'_, Database>> {
    db.lock()
        .map_err(|_| anyhow::anyhow!("Database lock poisoned"))
}
