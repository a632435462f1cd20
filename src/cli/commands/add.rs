//! Add command - record a new lore in a realm.

use anyhow::{bail, Result};
use colored::Colorize;

use crate::cli::context::AppContext;
use lore_sync::storage::{Lore, LoreType};

/// Arguments for the add command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore add -r api \"Use SQLite for local state\"\n    \
    lore add -r api -t risk \"Single writer only\" --why \"WAL mode\" --tag db\n    \
    lore add -r api -t learning \"Retries need jitter\" --confidence 0.7")]
pub struct Args {
    /// What was decided, learned or assumed
    pub content: String,

    /// Realm id or name
    #[arg(short, long)]
    pub realm: String,

    /// Kind of lore
    #[arg(short = 't', long = "type", default_value = "decision")]
    #[arg(long_help = "Kind of lore: decision, risk, learning, constraint, pattern\n\
        or assumption.")]
    pub lore_type: LoreType,

    /// The reasoning behind it
    #[arg(long)]
    pub why: Option<String>,

    /// Confidence between 0 and 1
    #[arg(long, default_value_t = 1.0)]
    pub confidence: f64,

    /// Tags (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

/// Executes the add command.
pub fn run(args: Args) -> Result<()> {
    if !(0.0..=1.0).contains(&args.confidence) {
        bail!("Confidence must be between 0 and 1, got {}", args.confidence);
    }

    let ctx = AppContext::open()?;
    let Some(realm) = ctx.store.find_realm(&args.realm)? else {
        bail!(
            "No realm found matching '{}'. Run 'lore realm add {}' first.",
            args.realm,
            args.realm
        );
    };

    let mut lore = Lore::new(realm.id, args.lore_type, &args.content);
    lore.why = args.why;
    lore.confidence = args.confidence;
    lore.set_tags(args.tags);
    let lore = ctx.store.add_lore(lore)?;

    println!(
        "{} {} {} in {}",
        "Added".green(),
        lore.lore_type.to_string().yellow(),
        lore.id.to_string()[..8].cyan(),
        realm.name.bold()
    );

    ctx.finish()
}
