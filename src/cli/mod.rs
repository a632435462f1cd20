//! Command-line interface for Lore.
//!
//! Provides the `lore` commands for managing realms, lores, relations and
//! workspaces, and for synchronizing workspaces between devices.

/// Individual CLI command implementations.
pub mod commands;

/// Shared state opened once per command.
pub mod context;

/// Output format selection.
pub mod format;
