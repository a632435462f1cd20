//! Update command - edit an existing lore.

use anyhow::{bail, Result};
use colored::Colorize;

use crate::cli::context::AppContext;
use lore_sync::storage::LoreType;

/// Arguments for the update command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore update abc123 --content \"Use Postgres instead\"\n    \
    lore update abc123 --confidence 0.4 --why \"Benchmarks pending\"\n    \
    lore update abc123 --tag db --tag perf")]
pub struct Args {
    /// Lore id or unique id prefix
    #[arg(value_name = "LORE")]
    pub lore: String,

    /// New content
    #[arg(long)]
    pub content: Option<String>,

    /// New kind
    #[arg(short = 't', long = "type")]
    pub lore_type: Option<LoreType>,

    /// New reasoning
    #[arg(long)]
    pub why: Option<String>,

    /// New confidence between 0 and 1
    #[arg(long)]
    pub confidence: Option<f64>,

    /// Replace tags (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

/// Executes the update command.
pub fn run(args: Args) -> Result<()> {
    if let Some(confidence) = args.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            bail!("Confidence must be between 0 and 1, got {confidence}");
        }
    }

    let ctx = AppContext::open()?;
    let Some(mut lore) = ctx.store.find_lore(&args.lore)? else {
        bail!("No lore found matching '{}'", args.lore);
    };

    let before = lore.clone();
    if let Some(content) = args.content {
        lore.content = content;
    }
    if let Some(lore_type) = args.lore_type {
        lore.lore_type = lore_type;
    }
    if let Some(why) = args.why {
        lore.why = Some(why);
    }
    if let Some(confidence) = args.confidence {
        lore.confidence = confidence;
    }
    if !args.tags.is_empty() {
        lore.set_tags(args.tags);
    }

    if lore == before {
        println!("{}", "Nothing to update.".dimmed());
        return Ok(());
    }

    ctx.store.update_lore(&mut lore)?;
    println!("{} {}", "Updated".green(), lore.id.to_string()[..8].cyan());

    ctx.finish()
}
