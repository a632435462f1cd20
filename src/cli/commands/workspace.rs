//! Workspace command - manage sync scopes and their realms.

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;

use crate::cli::context::AppContext;
use crate::cli::format::{print_json, OutputFormat};
use lore_sync::storage::{lock_db, LoreType, Realm, Workspace, WorkspaceFilters};
use lore_sync::sync::SyncState;

/// Arguments for the workspace command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore workspace create team --repo git@host:team/lore.git --default\n    \
    lore workspace attach api team     Sync the api realm through team\n    \
    lore workspace set team --auto-sync true --interval 120\n    \
    lore workspace set team --type decision --type risk\n    \
    lore workspace show team")]
pub struct Args {
    #[command(subcommand)]
    pub command: WorkspaceCommand,
}

/// Record filter flags shared by create and set.
#[derive(clap::Args, Default)]
pub struct FilterArgs {
    /// Only sync lores of this type (repeatable)
    #[arg(long = "type", value_name = "TYPE")]
    pub lore_types: Vec<LoreType>,

    /// Never sync lores carrying this tag (repeatable)
    #[arg(long = "exclude-tag", value_name = "TAG")]
    pub exclude_tags: Vec<String>,

    /// Never sync lores below this confidence
    #[arg(long)]
    pub min_confidence: Option<f64>,
}

impl FilterArgs {
    fn is_empty(&self) -> bool {
        self.lore_types.is_empty() && self.exclude_tags.is_empty() && self.min_confidence.is_none()
    }

    /// Replaces only the filter parts that were given.
    fn apply_to(self, filters: &mut WorkspaceFilters) -> Result<()> {
        if let Some(min) = self.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                bail!("--min-confidence must be between 0 and 1, got {min}");
            }
            filters.min_confidence = Some(min);
        }
        if !self.lore_types.is_empty() {
            filters.lore_types = self.lore_types.into_iter().collect();
        }
        if !self.exclude_tags.is_empty() {
            filters.exclude_tags = self.exclude_tags.into_iter().collect();
        }
        Ok(())
    }
}

#[derive(Subcommand)]
pub enum WorkspaceCommand {
    /// Create a workspace
    Create {
        /// Workspace name
        name: String,

        /// Remote repository URL or path
        #[arg(long)]
        repo: Option<String>,

        /// Branch on the remote
        #[arg(long, default_value = "main")]
        branch: String,

        /// Push in the background after every change
        #[arg(long)]
        auto_sync: bool,

        /// Seconds between syncs in 'lore sync watch'
        #[arg(long, default_value_t = 300)]
        interval: u64,

        /// Make this the default workspace
        #[arg(long)]
        default: bool,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// List workspaces
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show a workspace with its realms and sync state
    Show {
        /// Workspace id or name (defaults to the default workspace)
        workspace: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Change workspace settings
    Set {
        /// Workspace id or name
        workspace: String,

        /// Remote repository URL or path
        #[arg(long)]
        repo: Option<String>,

        /// Branch on the remote
        #[arg(long)]
        branch: Option<String>,

        /// Push in the background after every change
        #[arg(long, value_name = "BOOL")]
        auto_sync: Option<bool>,

        /// Seconds between syncs in 'lore sync watch'
        #[arg(long)]
        interval: Option<u64>,

        /// Turn sync on or off
        #[arg(long, value_name = "BOOL")]
        enabled: Option<bool>,

        /// Remove all record filters
        #[arg(long, conflicts_with_all = ["lore_types", "exclude_tags", "min_confidence"])]
        clear_filters: bool,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Sync a realm through a workspace
    Attach {
        /// Realm id or name
        realm: String,

        /// Workspace id or name
        workspace: String,
    },

    /// Stop syncing a realm through a workspace
    Detach {
        /// Realm id or name
        realm: String,

        /// Workspace id or name
        workspace: String,
    },

    /// Make a workspace the default
    Default {
        /// Workspace id or name
        workspace: String,
    },
}

#[derive(Serialize)]
struct WorkspaceDetails<'a> {
    #[serde(flatten)]
    workspace: &'a Workspace,
    realms: &'a [Realm],
    state: Option<&'a SyncState>,
}

/// Executes the workspace command.
pub fn run(args: Args) -> Result<()> {
    let ctx = AppContext::open()?;

    match args.command {
        WorkspaceCommand::Create {
            name,
            repo,
            branch,
            auto_sync,
            interval,
            default,
            filters,
        } => {
            if ctx.store.find_workspace(&name)?.is_some() {
                bail!("Workspace '{name}' already exists");
            }
            let mut workspace = Workspace::new(&name);
            workspace.sync_repo = repo;
            workspace.sync_branch = branch;
            workspace.auto_sync = auto_sync;
            workspace.sync_interval = interval.max(1);
            workspace.is_default = default;
            filters.apply_to(&mut workspace.filters)?;

            ctx.store.create_workspace(&workspace)?;
            println!("{} workspace {}", "Created".green(), workspace.name.bold());
            if workspace.sync_repo.is_none() {
                println!(
                    "  {}",
                    format!("Set a remote with 'lore workspace set {name} --repo <url>'").dimmed()
                );
            }
        }
        WorkspaceCommand::List { format } => {
            let workspaces = ctx.store.list_workspaces()?;
            if format == OutputFormat::Json {
                print_json(&workspaces)?;
            } else if workspaces.is_empty() {
                println!("{}", "No workspaces yet. Run 'lore workspace create <name>'.".dimmed());
            } else {
                for workspace in &workspaces {
                    print_summary(workspace);
                }
            }
        }
        WorkspaceCommand::Show { workspace, format } => {
            let workspace = ctx.tracker().resolve_workspace(workspace.as_deref())?;
            let realms = ctx.store.workspace_realms(&workspace)?;
            let state = lock_db(ctx.db())?
                .load_sync_state(&workspace.id, &ctx.tracker().settings().device_id)?;

            if format == OutputFormat::Json {
                print_json(&WorkspaceDetails {
                    workspace: &workspace,
                    realms: &realms,
                    state: state.as_ref(),
                })?;
            } else {
                print_details(&workspace, &realms, state.as_ref());
            }
        }
        WorkspaceCommand::Set {
            workspace,
            repo,
            branch,
            auto_sync,
            interval,
            enabled,
            clear_filters,
            filters,
        } => {
            let mut workspace = find(&ctx, &workspace)?;
            if repo.is_none()
                && branch.is_none()
                && auto_sync.is_none()
                && interval.is_none()
                && enabled.is_none()
                && !clear_filters
                && filters.is_empty()
            {
                bail!("Nothing to change. See 'lore workspace set --help'.");
            }

            if let Some(repo) = repo {
                workspace.sync_repo = Some(repo);
            }
            if let Some(branch) = branch {
                workspace.sync_branch = branch;
            }
            if let Some(auto_sync) = auto_sync {
                workspace.auto_sync = auto_sync;
            }
            if let Some(interval) = interval {
                workspace.sync_interval = interval.max(1);
            }
            if let Some(enabled) = enabled {
                workspace.sync_enabled = enabled;
            }
            if clear_filters {
                workspace.filters = WorkspaceFilters::default();
            }
            filters.apply_to(&mut workspace.filters)?;

            ctx.store.update_workspace(&workspace)?;
            println!("{} workspace {}", "Updated".green(), workspace.name.bold());
        }
        WorkspaceCommand::Attach { realm, workspace } => {
            let workspace = find(&ctx, &workspace)?;
            let Some(realm) = ctx.store.find_realm(&realm)? else {
                bail!("No realm found matching '{realm}'");
            };
            if ctx.store.attach_realm(&realm.id, &workspace)? {
                println!(
                    "{} {} to {}",
                    "Attached".green(),
                    realm.name.bold(),
                    workspace.name.bold()
                );
            } else {
                println!(
                    "{}",
                    format!("{} is already attached to {}", realm.name, workspace.name).dimmed()
                );
            }
        }
        WorkspaceCommand::Detach { realm, workspace } => {
            let workspace = find(&ctx, &workspace)?;
            let Some(realm) = ctx.store.find_realm(&realm)? else {
                bail!("No realm found matching '{realm}'");
            };
            if ctx.store.detach_realm(&realm.id, &workspace)? {
                println!(
                    "{} {} from {}",
                    "Detached".green(),
                    realm.name.bold(),
                    workspace.name.bold()
                );
            } else {
                println!(
                    "{}",
                    format!("{} is not attached to {}", realm.name, workspace.name).dimmed()
                );
            }
        }
        WorkspaceCommand::Default { workspace } => {
            let mut workspace = find(&ctx, &workspace)?;
            ctx.store.set_default_workspace(&mut workspace)?;
            println!("{} is now the default workspace", workspace.name.bold());
        }
    }

    ctx.finish()
}

fn find(ctx: &AppContext, key: &str) -> Result<Workspace> {
    match ctx.store.find_workspace(key)? {
        Some(workspace) => Ok(workspace),
        None => bail!("No workspace found matching '{key}'. Run 'lore workspace list' to see workspaces."),
    }
}

fn print_summary(workspace: &Workspace) {
    let marker = if workspace.is_default { "*".green() } else { " ".normal() };
    let remote = workspace.sync_repo.as_deref().unwrap_or("(no remote)");
    let mut flags = Vec::new();
    if !workspace.sync_enabled {
        flags.push("disabled");
    }
    if workspace.auto_sync {
        flags.push("auto");
    }
    println!(
        "{} {:16}  {}  {}",
        marker,
        workspace.name.bold(),
        remote.dimmed(),
        flags.join(",").yellow()
    );
}

fn print_details(workspace: &Workspace, realms: &[Realm], state: Option<&SyncState>) {
    println!("{}", workspace.name.bold());
    println!("  {}  {}", "Id:".dimmed(), workspace.id);
    println!(
        "  {}  {}",
        "Remote:".dimmed(),
        workspace.sync_repo.as_deref().unwrap_or("(none)")
    );
    println!("  {}  {}", "Branch:".dimmed(), workspace.sync_branch);
    println!("  {}  {}", "Sync enabled:".dimmed(), workspace.sync_enabled);
    println!(
        "  {}  {} (every {}s)",
        "Auto sync:".dimmed(),
        workspace.auto_sync,
        workspace.sync_interval
    );
    println!("  {}  {}", "Default:".dimmed(), workspace.is_default);

    if !workspace.filters.is_empty() {
        println!();
        println!("{}", "Filters:".bold());
        let filters = &workspace.filters;
        if !filters.lore_types.is_empty() {
            let types: Vec<&str> = filters.lore_types.iter().map(|t| t.as_str()).collect();
            println!("  {}  {}", "Types:".dimmed(), types.join(", "));
        }
        if !filters.exclude_tags.is_empty() {
            let tags: Vec<&str> = filters.exclude_tags.iter().map(String::as_str).collect();
            println!("  {}  {}", "Excluded tags:".dimmed(), tags.join(", "));
        }
        if let Some(min) = filters.min_confidence {
            println!("  {}  {:.2}", "Min confidence:".dimmed(), min);
        }
    }

    println!();
    println!("{}", "Realms:".bold());
    if realms.is_empty() {
        println!("  {}", "(none attached)".dimmed());
    }
    for realm in realms {
        println!("  {}  {}", realm.id.to_string()[..8].cyan(), realm.name);
    }

    if let Some(state) = state {
        println!();
        println!("{}", "Sync state:".bold());
        println!(
            "  {}  {}",
            "Last sync:".dimmed(),
            state
                .last_sync_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
        println!("  {}  {}", "Pending:".dimmed(), state.pending_changes);
    }
}
