//! Sync command - exchange lore with other devices through git.
//!
//! Resolution failures (unknown workspace, sync disabled, no remote) exit
//! with an error. Transport failures during push or pull are reported in
//! the result and do not change the exit status.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Duration;

use crate::cli::context::AppContext;
use crate::cli::format::{print_json, OutputFormat};
use lore_sync::storage::{lock_db, Workspace};
use lore_sync::sync::periodic::{run_periodic_sync, CHECK_INTERVAL};
use lore_sync::sync::{PullResult, PushResult, SyncConflict, SyncState};

/// Arguments for the sync command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore sync init team          Prepare the working tree for team\n    \
    lore sync push               Push the default workspace\n    \
    lore sync pull team          Pull changes from other devices\n    \
    lore sync status             Show sync state of all workspaces\n    \
    lore sync conflicts team     List detected conflicts\n    \
    lore sync watch              Sync auto-sync workspaces until Ctrl-C")]
pub struct Args {
    #[command(subcommand)]
    pub command: SyncCommand,
}

#[derive(Subcommand)]
pub enum SyncCommand {
    /// Prepare the local working tree of a workspace
    Init {
        /// Workspace id or name (defaults to the default workspace)
        workspace: Option<String>,
    },

    /// Publish local changes to the remote
    Push {
        /// Workspace id or name (defaults to the default workspace)
        workspace: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Apply changes from other devices
    Pull {
        /// Workspace id or name (defaults to the default workspace)
        workspace: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show sync state
    Status {
        /// Workspace id or name (all workspaces when omitted)
        workspace: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List conflicts detected while pulling
    Conflicts {
        /// Workspace id or name (defaults to the default workspace)
        workspace: Option<String>,

        /// Include resolved conflicts
        #[arg(long)]
        all: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Periodically pull and push auto-sync workspaces until interrupted
    Watch {
        /// Seconds between checks for due workspaces
        #[arg(long, default_value_t = CHECK_INTERVAL.as_secs())]
        check_every: u64,

        /// Write logs to this file instead of stderr
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },
}

impl SyncCommand {
    /// Log destination requested by `sync watch`.
    pub fn log_file(&self) -> Option<&PathBuf> {
        match self {
            SyncCommand::Watch { log_file, .. } => log_file.as_ref(),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct WorkspaceStatus {
    workspace: String,
    remote: Option<String>,
    sync_enabled: bool,
    auto_sync: bool,
    state: Option<SyncState>,
    unresolved_conflicts: i64,
}

/// Executes the sync command.
pub fn run(args: Args) -> Result<()> {
    let ctx = AppContext::open()?;

    match args.command {
        SyncCommand::Init { workspace } => {
            let workspace = ctx.tracker().resolve_workspace(workspace.as_deref())?;
            let adapter = ctx.tracker().adapter_for(&workspace)?;
            adapter.initialize()?;
            println!(
                "{} {} at {}",
                "Initialized".green(),
                workspace.name.bold(),
                adapter.workdir().display()
            );
        }
        SyncCommand::Push { workspace, format } => {
            let workspace = ctx.tracker().resolve_workspace(workspace.as_deref())?;
            let result = ctx.tracker().adapter_for(&workspace)?.push()?;
            if format == OutputFormat::Json {
                print_json(&result)?;
            } else {
                print_push(&workspace, &result);
            }
        }
        SyncCommand::Pull { workspace, format } => {
            let workspace = ctx.tracker().resolve_workspace(workspace.as_deref())?;
            let result = ctx.tracker().adapter_for(&workspace)?.pull()?;
            if format == OutputFormat::Json {
                print_json(&result)?;
            } else {
                print_pull(&workspace, &result);
            }
        }
        SyncCommand::Status { workspace, format } => {
            let workspaces = match workspace {
                Some(key) => vec![ctx.tracker().resolve_workspace(Some(&key))?],
                None => ctx.store.list_workspaces()?,
            };
            let statuses = collect_status(&ctx, &workspaces)?;
            if format == OutputFormat::Json {
                print_json(&statuses)?;
            } else if statuses.is_empty() {
                println!("{}", "No workspaces yet. Run 'lore workspace create <name>'.".dimmed());
            } else {
                for status in &statuses {
                    print_status(status);
                }
            }
        }
        SyncCommand::Conflicts {
            workspace,
            all,
            format,
        } => {
            let workspace = ctx.tracker().resolve_workspace(workspace.as_deref())?;
            let conflicts = lock_db(ctx.db())?.list_conflicts(&workspace.id, all)?;
            if format == OutputFormat::Json {
                print_json(&conflicts)?;
            } else if conflicts.is_empty() {
                println!("{}", "No conflicts.".dimmed());
            } else {
                for conflict in &conflicts {
                    print_conflict(conflict);
                }
            }
        }
        SyncCommand::Watch { check_every, .. } => watch(&ctx, check_every)?,
    }

    ctx.finish()
}

fn watch(ctx: &AppContext, check_every: u64) -> Result<()> {
    let watched: Vec<String> = ctx
        .store
        .list_workspaces()?
        .into_iter()
        .filter(|w| w.sync_enabled && w.auto_sync && w.sync_repo.is_some())
        .map(|w| w.name)
        .collect();
    if watched.is_empty() {
        println!(
            "{}",
            "No auto-sync workspaces with a remote. Enable one with \
             'lore workspace set <name> --auto-sync true'."
                .yellow()
        );
    } else {
        println!("Watching {}. Press Ctrl-C to stop.", watched.join(", ").bold());
    }

    let tracker = ctx.tracker().clone();
    let db = ctx.db().clone();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    ctx.runtime().block_on(async move {
        let task = tokio::spawn(run_periodic_sync(
            tracker,
            db,
            Duration::from_secs(check_every.max(1)),
            shutdown_rx,
        ));

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        let _ = shutdown_tx.send(());
        task.await.context("Periodic sync task failed")?;
        Ok::<_, anyhow::Error>(())
    })?;

    println!("{}", "Stopped.".dimmed());
    Ok(())
}

fn collect_status(ctx: &AppContext, workspaces: &[Workspace]) -> Result<Vec<WorkspaceStatus>> {
    let device_id = &ctx.tracker().settings().device_id;
    let db = lock_db(ctx.db())?;
    workspaces
        .iter()
        .map(|workspace| {
            Ok(WorkspaceStatus {
                workspace: workspace.name.clone(),
                remote: workspace.sync_repo.clone(),
                sync_enabled: workspace.sync_enabled,
                auto_sync: workspace.auto_sync,
                state: db.load_sync_state(&workspace.id, device_id)?,
                unresolved_conflicts: db.unresolved_conflict_count(&workspace.id)?,
            })
        })
        .collect()
}

fn print_errors(errors: &[String]) {
    for error in errors {
        println!("  {} {}", "Error:".red(), error);
    }
}

fn print_push(workspace: &Workspace, result: &PushResult) {
    if result.errors.is_empty() {
        println!(
            "{} {} change(s) to {}",
            "Pushed".green(),
            result.pushed,
            workspace.name.bold()
        );
    } else {
        println!("{} {}", "Push failed for".red(), workspace.name.bold());
        print_errors(&result.errors);
    }
}

fn print_pull(workspace: &Workspace, result: &PullResult) {
    println!(
        "{} {} change(s) from {}",
        "Pulled".green(),
        result.pulled,
        workspace.name.bold()
    );
    if result.conflicts > 0 {
        println!(
            "  {} {} conflict(s). Run 'lore sync conflicts {}' to review.",
            "Warning:".yellow(),
            result.conflicts,
            workspace.name
        );
    }
    print_errors(&result.errors);
}

fn print_status(status: &WorkspaceStatus) {
    println!("{}", status.workspace.bold());
    println!(
        "  {}  {}",
        "Remote:".dimmed(),
        status.remote.as_deref().unwrap_or("(none)")
    );
    if !status.sync_enabled {
        println!("  {}", "Sync disabled".yellow());
    }
    match &status.state {
        Some(state) => {
            println!(
                "  {}  {}",
                "Last sync:".dimmed(),
                state
                    .last_sync_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            if let Some(commit) = &state.last_sync_commit {
                println!("  {}  {}", "Commit:".dimmed(), &commit[..commit.len().min(8)]);
            }
            println!("  {}  {}", "Pending:".dimmed(), state.pending_changes);
        }
        None => println!("  {}", "Not initialized".dimmed()),
    }
    if status.unresolved_conflicts > 0 {
        println!(
            "  {}  {}",
            "Conflicts:".dimmed(),
            status.unresolved_conflicts.to_string().red()
        );
    }
}

fn print_conflict(conflict: &SyncConflict) {
    let marker = if conflict.resolved { "resolved".green() } else { "open".red() };
    println!(
        "{} {} {} from {} ({})",
        conflict.detected_at.format("%Y-%m-%d %H:%M"),
        conflict.entity.to_string().yellow(),
        conflict.entity_id.cyan(),
        conflict.remote_device_id,
        marker
    );
    println!(
        "  {}  {}",
        "Local:".dimmed(),
        summarize(conflict.local_data.as_ref())
    );
    println!(
        "  {}  {}",
        "Remote:".dimmed(),
        summarize(conflict.remote_data.as_ref())
    );
}

fn summarize(data: Option<&serde_json::Value>) -> String {
    match data {
        None => "(deleted)".to_string(),
        Some(value) => value
            .get("content")
            .or_else(|| value.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summarize_prefers_content() {
        assert_eq!(summarize(Some(&json!({"content": "Use WAL", "id": "x"}))), "Use WAL");
        assert_eq!(summarize(Some(&json!({"name": "api"}))), "api");
        assert_eq!(summarize(None), "(deleted)");
    }
}
