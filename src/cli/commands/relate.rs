//! Relate and unrelate commands - link lores to each other.

use anyhow::{bail, Result};
use colored::Colorize;

use crate::cli::context::AppContext;
use lore_sync::storage::{Lore, RelationType};

/// Arguments shared by relate and unrelate.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore relate abc123 supersedes def456\n    \
    lore relate abc123 depends-on def456\n    \
    lore unrelate abc123 relates_to def456")]
pub struct Args {
    /// Source lore id or prefix
    #[arg(value_name = "FROM")]
    pub from: String,

    /// Relation type
    #[arg(value_name = "TYPE")]
    #[arg(long_help = "Relation type: supersedes, depends_on, relates_to or contradicts.\n\
        Dashes are accepted in place of underscores.")]
    pub relation_type: RelationType,

    /// Target lore id or prefix
    #[arg(value_name = "TO")]
    pub to: String,
}

/// Creates a relation. Relating the same pair twice is a no-op.
pub fn run(args: Args) -> Result<()> {
    let ctx = AppContext::open()?;
    let (from, to) = resolve_pair(&ctx, &args)?;

    ctx.store.relate(&from.id, args.relation_type, &to.id)?;
    println!(
        "{} {} {} {}",
        "Related".green(),
        from.id.to_string()[..8].cyan(),
        args.relation_type.to_string().yellow(),
        to.id.to_string()[..8].cyan()
    );

    ctx.finish()
}

/// Removes a relation.
pub fn run_unrelate(args: Args) -> Result<()> {
    let ctx = AppContext::open()?;
    let (from, to) = resolve_pair(&ctx, &args)?;

    if ctx.store.unrelate(&from.id, args.relation_type, &to.id)? {
        println!(
            "{} {} {} {}",
            "Removed".green(),
            from.id.to_string()[..8].cyan(),
            args.relation_type.to_string().yellow(),
            to.id.to_string()[..8].cyan()
        );
    } else {
        println!("{}", "No such relation.".dimmed());
    }

    ctx.finish()
}

fn resolve_pair(ctx: &AppContext, args: &Args) -> Result<(Lore, Lore)> {
    let Some(from) = ctx.store.find_lore(&args.from)? else {
        bail!("No lore found matching '{}'", args.from);
    };
    let Some(to) = ctx.store.find_lore(&args.to)? else {
        bail!("No lore found matching '{}'", args.to);
    };
    if from.id == to.id {
        bail!("A lore cannot be related to itself");
    }
    Ok((from, to))
}
