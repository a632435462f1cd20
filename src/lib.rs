//! Lore - decisions and learnings, synced across devices
//!
//! Lore keeps a local SQLite store of knowledge records grouped into
//! realms. Workspaces sync selected realms between devices through a git
//! repository using vector-clocked change logs.

pub mod config;
pub mod git;
pub mod storage;
pub mod store;
pub mod sync;
