//! CLI commands for Lore.
//!
//! Each submodule implements a single CLI command with its argument
//! parsing and execution logic.

/// Record a new lore.
pub mod add;

/// Shell completion scripts.
pub mod completions;

/// Configuration viewing and management.
pub mod config;

/// Permanently remove a lore.
pub mod delete;

/// List and filter lores.
pub mod list;

/// Manage realms.
pub mod realm;

/// Link and unlink lores.
pub mod relate;

/// Display a lore with its relations.
pub mod show;

/// Overview of local lore and sync state.
pub mod status;

/// Push, pull and watch workspaces.
pub mod sync;

/// Edit an existing lore.
pub mod update;

/// Manage workspaces and their realms.
pub mod workspace;
