//! Delete command - permanently remove a lore.
//!
//! Relations to and from the lore are removed with it. This operation is
//! irreversible locally; peers remove it on their next pull.

use std::io::{self, Write};

use anyhow::{bail, Result};
use colored::Colorize;

use crate::cli::context::AppContext;

/// Arguments for the delete command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore delete abc123             Delete lore (prompts for confirmation)\n    \
    lore delete abc123 --force     Delete without confirmation")]
pub struct Args {
    /// Lore id or unique id prefix
    #[arg(value_name = "LORE")]
    pub lore: String,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub force: bool,
}

/// Executes the delete command.
pub fn run(args: Args) -> Result<()> {
    let ctx = AppContext::open()?;
    let Some(lore) = ctx.store.find_lore(&args.lore)? else {
        bail!(
            "No lore found matching '{}'. Run 'lore list' to see lores.",
            args.lore
        );
    };
    let lore_short = &lore.id.to_string()[..8];

    println!();
    println!("{} {}", lore.lore_type.to_string().bold(), lore_short.cyan());
    println!("  {}", lore.content);
    println!();

    if !args.force {
        print!("Delete lore {}? [y/N] ", lore_short.cyan());
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("{}", "Cancelled.".dimmed());
            return Ok(());
        }
    }

    ctx.store.delete_lore(&lore.id)?;
    println!("{} lore {}", "Deleted".green(), lore_short.cyan());

    ctx.finish()
}
