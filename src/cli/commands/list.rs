//! List command - show lores, newest first.

use anyhow::{bail, Result};
use colored::Colorize;

use crate::cli::context::AppContext;
use crate::cli::format::{print_json, OutputFormat};
use lore_sync::storage::LoreType;

/// Arguments for the list command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore list                   List all lores\n    \
    lore list -r api            List lores in the api realm\n    \
    lore list -t risk           List risks only\n    \
    lore list --format json     Machine-readable output")]
pub struct Args {
    /// Only lores in this realm (id or name)
    #[arg(short, long)]
    pub realm: Option<String>,

    /// Only lores of this kind
    #[arg(short = 't', long = "type")]
    pub lore_type: Option<LoreType>,

    /// Maximum number of lores to show
    #[arg(short, long, default_value_t = 50)]
    pub limit: usize,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Executes the list command.
pub fn run(args: Args) -> Result<()> {
    let ctx = AppContext::open()?;

    let realm_id = match &args.realm {
        Some(key) => match ctx.store.find_realm(key)? {
            Some(realm) => Some(realm.id),
            None => bail!("No realm found matching '{key}'"),
        },
        None => None,
    };

    let lores: Vec<_> = ctx
        .store
        .list_lores(realm_id.as_ref())?
        .into_iter()
        .filter(|lore| args.lore_type.map_or(true, |t| lore.lore_type == t))
        .take(args.limit)
        .collect();

    if args.format == OutputFormat::Json {
        return print_json(&lores);
    }

    if lores.is_empty() {
        println!("{}", "No lores found.".dimmed());
        return Ok(());
    }

    for lore in &lores {
        let content = if lore.content.chars().count() > 60 {
            format!("{}...", lore.content.chars().take(57).collect::<String>())
        } else {
            lore.content.clone()
        };
        println!(
            "  {}  {:10}  {:4.2}  {}",
            lore.id.to_string()[..8].cyan(),
            lore.lore_type.to_string().yellow(),
            lore.confidence,
            content
        );
    }

    Ok(())
}
