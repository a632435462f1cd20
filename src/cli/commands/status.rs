//! Status command - show an overview of local lore and sync state.

use anyhow::Result;
use colored::Colorize;

use crate::cli::context::AppContext;
use lore_sync::storage::lock_db;

/// Arguments for the status command.
#[derive(clap::Args)]
pub struct Args {
    /// Number of recent lores to show
    #[arg(short, long, default_value_t = 5)]
    pub recent: usize,
}

/// Executes the status command.
pub fn run(args: Args) -> Result<()> {
    let ctx = AppContext::open()?;
    let settings = ctx.tracker().settings();

    println!("{}", "Lore".bold().cyan());
    println!("{}", "Decisions and learnings, synced across devices".dimmed());
    println!();
    println!("  {}  {}", "Device:".dimmed(), settings.device_id);
    println!(
        "  {}  {}",
        "Tracking:".dimmed(),
        if ctx.tracker().is_enabled() {
            "enabled".green()
        } else {
            "disabled".yellow()
        }
    );

    let workspaces = ctx.store.list_workspaces()?;
    {
        let db = lock_db(ctx.db())?;
        println!();
        println!("{}", "Database:".bold());
        println!("  Realms: {}", db.realm_count()?);
        println!("  Lores:  {}", db.lore_count()?);

        if !workspaces.is_empty() {
            println!();
            println!("{}", "Workspaces:".bold());
        }
        for workspace in &workspaces {
            let pending = db
                .load_sync_state(&workspace.id, &settings.device_id)?
                .map_or(0, |s| s.pending_changes);
            let conflicts = db.unresolved_conflict_count(&workspace.id)?;
            let marker = if workspace.is_default { "*" } else { " " };
            let mut line = format!(
                "  {marker} {:16}  {} pending",
                workspace.name, pending
            );
            if conflicts > 0 {
                line.push_str(&format!(", {} conflict(s)", conflicts.to_string().red()));
            }
            if workspace.sync_repo.is_none() {
                line.push_str(&format!("  {}", "(no remote)".dimmed()));
            }
            println!("{line}");
        }
    }

    if workspaces.is_empty() {
        println!();
        println!(
            "{}",
            "Hint: Run 'lore workspace create <name> --repo <url>' to start syncing".yellow()
        );
    }

    let recent: Vec<_> = ctx.store.list_lores(None)?.into_iter().take(args.recent).collect();
    if !recent.is_empty() {
        println!();
        println!("{}", "Recent lores:".bold());
        for lore in recent {
            let ago = chrono::Utc::now()
                .signed_duration_since(lore.updated_at)
                .num_hours();
            let ago_str = if ago < 1 {
                "just now".to_string()
            } else if ago < 24 {
                format!("{ago} hours ago")
            } else {
                format!("{} days ago", ago / 24)
            };
            println!(
                "  {}  {:10}  {}  {}",
                lore.id.to_string()[..8].cyan(),
                lore.lore_type.to_string().yellow(),
                ago_str.dimmed(),
                lore.content.chars().take(50).collect::<String>()
            );
        }
    }

    Ok(())
}
