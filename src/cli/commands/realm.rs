//! Realm command - manage the projects lore is attached to.

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;

use crate::cli::context::AppContext;
use crate::cli::format::{print_json, OutputFormat};

/// Arguments for the realm command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore realm add api                 Add a realm for the current directory\n    \
    lore realm add web --path ~/web    Add a realm for another directory\n    \
    lore realm list                    List realms\n    \
    lore realm remove api              Delete a realm and its lore")]
pub struct Args {
    #[command(subcommand)]
    pub command: RealmCommand,
}

#[derive(Subcommand)]
pub enum RealmCommand {
    /// Add a realm
    Add {
        /// Realm name
        name: String,

        /// Project directory (defaults to the current directory)
        #[arg(long)]
        path: Option<String>,
    },

    /// List realms
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Delete a realm together with its lore
    Remove {
        /// Realm id or name
        realm: String,
    },
}

/// Executes the realm command.
pub fn run(args: Args) -> Result<()> {
    let ctx = AppContext::open()?;

    match args.command {
        RealmCommand::Add { name, path } => {
            let path = match path {
                Some(path) => path,
                None => std::env::current_dir()?.to_string_lossy().to_string(),
            };
            let realm = ctx.store.create_realm(&name, &path)?;
            println!(
                "{} realm {} ({})",
                "Created".green(),
                realm.name.bold(),
                &realm.id.to_string()[..8]
            );
        }
        RealmCommand::List { format } => {
            let realms = ctx.store.list_realms()?;
            if format == OutputFormat::Json {
                print_json(&realms)?;
            } else if realms.is_empty() {
                println!("{}", "No realms yet. Run 'lore realm add <name>'.".dimmed());
            } else {
                for realm in realms {
                    println!(
                        "  {}  {:20}  {}",
                        realm.id.to_string()[..8].cyan(),
                        realm.name,
                        realm.path.dimmed()
                    );
                }
            }
        }
        RealmCommand::Remove { realm } => {
            let Some(found) = ctx.store.find_realm(&realm)? else {
                bail!("No realm found matching '{realm}'. Run 'lore realm list' to see realms.");
            };
            ctx.store.delete_realm(&found.id)?;
            println!("{} realm {}", "Deleted".green(), found.name.bold());
        }
    }

    ctx.finish()
}
