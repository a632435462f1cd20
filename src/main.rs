use std::path::Path;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use cli::commands;

/// The main CLI command line interface.
#[derive(Parser)]
#[command(name = "lore")]
#[command(version)]
#[command(about = "Decisions and learnings for code, synced across devices")]
#[command(long_about = "Lore records the decisions, risks and learnings behind a project\n\
    in realms, and syncs them between your devices through a git remote.\n\n\
    Every change is logged with a vector clock. Pulling replays what other\n\
    devices recorded and flags concurrent edits as conflicts.")]
#[command(after_help = "EXAMPLES:\n    \
    lore realm add api                       Create a realm\n    \
    lore add -r api \"Use SQLite\"             Record a decision\n    \
    lore list                                List lores\n    \
    lore workspace create team --repo <url>  Create a sync workspace\n    \
    lore workspace attach api team           Sync the realm through it\n    \
    lore sync push team                      Publish local changes\n    \
    lore sync pull team                      Apply changes from other devices\n\n\
    For more information about a command, run 'lore <command> --help'.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output for debugging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Show lore counts, workspaces and recent lores
    Status(commands::status::Args),

    /// Manage realms
    #[command(long_about = "A realm groups the lore of one project. Realms are synced by\n\
        attaching them to a workspace.")]
    Realm(commands::realm::Args),

    /// Record a new lore
    Add(commands::add::Args),

    /// List lores
    List(commands::list::Args),

    /// Show a lore with its relations
    #[command(long_about = "Displays a lore and the relations to and from it.\n\
        \n\
        Supports multiple output formats:\n\
        - text: colored terminal output (default)\n\
        - json: machine-readable structured output\n\
        - markdown: formatted for documentation")]
    Show(commands::show::Args),

    /// Edit a lore
    Update(commands::update::Args),

    /// Permanently delete a lore
    Delete(commands::delete::Args),

    /// Link two lores
    Relate(commands::relate::Args),

    /// Remove a link between two lores
    Unrelate(commands::relate::Args),

    /// Manage sync workspaces
    #[command(long_about = "A workspace pairs a set of realms with a git remote. Changes to\n\
        attached realms are recorded in the workspace and exchanged with\n\
        'lore sync'. Workspace filters limit which lores are synced.")]
    Workspace(commands::workspace::Args),

    /// Push, pull and inspect sync state
    #[command(long_about = "Exchanges change logs with the workspace remote. Push publishes\n\
        local changes; pull replays changes recorded on other devices and\n\
        flags concurrent edits as conflicts instead of merging them.")]
    Sync(commands::sync::Args),

    /// View and manage configuration settings
    #[command(long_about = "Provides subcommands to show, get, and set configuration values.\n\
        Configuration is stored in ~/.lore/config.yaml (or $LORE_HOME).")]
    Config(commands::config::Args),

    /// Generate shell completion scripts
    Completions(commands::completions::Args),
}

impl Commands {
    fn log_file(&self) -> Option<&Path> {
        match self {
            Commands::Sync(args) => args.command.log_file().map(|p| p.as_path()),
            _ => None,
        }
    }
}

/// Logs go to stderr, or to `log_file` when one is given. The returned
/// guard must live until exit so buffered lines are flushed.
fn setup_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = if verbose { "lore=debug" } else { "lore=info" };
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into())
    };

    let Some(log_file) = log_file else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().without_time().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Invalid log file path {}", log_file.display()))?;

    let (non_blocking, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();
    Ok(Some(guard))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.verbose, cli.command.log_file())?;

    match cli.command {
        Commands::Status(args) => commands::status::run(args),
        Commands::Realm(args) => commands::realm::run(args),
        Commands::Add(args) => commands::add::run(args),
        Commands::List(args) => commands::list::run(args),
        Commands::Show(args) => commands::show::run(args),
        Commands::Update(args) => commands::update::run(args),
        Commands::Delete(args) => commands::delete::run(args),
        Commands::Relate(args) => commands::relate::run(args),
        Commands::Unrelate(args) => commands::relate::run_unrelate(args),
        Commands::Workspace(args) => commands::workspace::run(args),
        Commands::Sync(args) => commands::sync::run(args),
        Commands::Config(args) => commands::config::run(args),
        Commands::Completions(args) => {
            commands::completions::run(args, &mut Cli::command());
            Ok(())
        }
    }
}
