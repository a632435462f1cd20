//! Show command - display a single lore with its relations.

use anyhow::{bail, Result};
use colored::Colorize;
use serde::Serialize;

use crate::cli::context::AppContext;
use crate::cli::format::{print_json, OutputFormat};
use lore_sync::storage::{Lore, Relation};

/// Arguments for the show command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore show abc123                 Show a lore\n    \
    lore show abc123 --format json   Output as JSON\n    \
    lore show abc123 -f markdown     Output as Markdown")]
pub struct Args {
    /// Lore id or unique id prefix
    #[arg(value_name = "LORE")]
    pub lore: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Serialize)]
struct LoreDetails<'a> {
    #[serde(flatten)]
    lore: &'a Lore,
    relations: &'a [Relation],
}

/// Executes the show command.
pub fn run(args: Args) -> Result<()> {
    let ctx = AppContext::open()?;
    let Some(lore) = ctx.store.find_lore(&args.lore)? else {
        bail!(
            "No lore found matching '{}'. Run 'lore list' to see lores.",
            args.lore
        );
    };
    let relations = ctx.store.relations_for_lore(&lore.id)?;

    match args.format {
        OutputFormat::Json => print_json(&LoreDetails {
            lore: &lore,
            relations: &relations,
        }),
        OutputFormat::Markdown => {
            print!("{}", render_markdown(&lore, &relations));
            Ok(())
        }
        OutputFormat::Text => {
            print_text(&lore, &relations);
            Ok(())
        }
    }
}

fn print_text(lore: &Lore, relations: &[Relation]) {
    println!("{} {}", lore.lore_type.to_string().yellow().bold(), lore.id.to_string().cyan());
    println!();
    println!("{}", lore.content);
    if let Some(why) = &lore.why {
        println!();
        println!("  {}  {}", "Why:".dimmed(), why);
    }
    println!("  {}  {:.2}", "Confidence:".dimmed(), lore.confidence);
    if !lore.tags.is_empty() {
        println!("  {}  {}", "Tags:".dimmed(), lore.tags.join(", "));
    }
    println!(
        "  {}  {}",
        "Updated:".dimmed(),
        lore.updated_at.format("%Y-%m-%d %H:%M:%S")
    );

    if !relations.is_empty() {
        println!();
        println!("{}", "Relations:".bold());
        for relation in relations {
            println!("  {}", describe(lore, relation));
        }
    }
}

fn describe(lore: &Lore, relation: &Relation) -> String {
    if relation.from_lore_id == lore.id {
        format!(
            "{} {}",
            relation.relation_type,
            &relation.to_lore_id.to_string()[..8]
        )
    } else {
        format!(
            "{} by {}",
            relation.relation_type,
            &relation.from_lore_id.to_string()[..8]
        )
    }
}

fn render_markdown(lore: &Lore, relations: &[Relation]) -> String {
    let mut out = format!("## {}: {}\n\n", lore.lore_type, lore.content);
    if let Some(why) = &lore.why {
        out.push_str(&format!("**Why:** {why}\n\n"));
    }
    out.push_str(&format!("- Confidence: {:.2}\n", lore.confidence));
    if !lore.tags.is_empty() {
        out.push_str(&format!("- Tags: {}\n", lore.tags.join(", ")));
    }
    for relation in relations {
        out.push_str(&format!("- {}\n", describe(lore, relation)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lore_sync::storage::{LoreType, RelationType};
    use uuid::Uuid;

    #[test]
    fn test_render_markdown() {
        let mut lore = Lore::new(Uuid::new_v4(), LoreType::Risk, "Single writer");
        lore.why = Some("SQLite locks".to_string());
        lore.tags = vec!["db".to_string()];
        let other = Uuid::new_v4();
        let relations = vec![Relation::new(lore.id, RelationType::DependsOn, other)];

        let md = render_markdown(&lore, &relations);
        assert!(md.starts_with("## risk: Single writer"));
        assert!(md.contains("**Why:** SQLite locks"));
        assert!(md.contains("- Tags: db"));
        assert!(md.contains(&format!("depends_on {}", &other.to_string()[..8])));
    }

    #[test]
    fn test_describe_incoming_relation() {
        let lore = Lore::new(Uuid::new_v4(), LoreType::Decision, "old");
        let newer = Uuid::new_v4();
        let relation = Relation::new(newer, RelationType::Supersedes, lore.id);
        assert_eq!(
            describe(&lore, &relation),
            format!("supersedes by {}", &newer.to_string()[..8])
        );
    }
}
