//! Completions command - print shell completion scripts for `lore`.

use clap::Command;
use clap_complete::{generate, Shell};
use std::io;

/// Arguments for the completions command.
#[derive(clap::Args)]
#[command(after_help = "EXAMPLES:\n    \
    lore completions bash > ~/.local/share/bash-completion/completions/lore\n    \
    lore completions zsh > ~/.zfunc/_lore\n    \
    lore completions fish > ~/.config/fish/completions/lore.fish\n\n\
INSTALLATION:\n    \
    Bash:       Save to ~/.local/share/bash-completion/completions/lore\n              \
    or /etc/bash_completion.d/lore\n    \
    Zsh:        Save to a directory in your $fpath (e.g., ~/.zfunc/_lore)\n              \
    and add 'autoload -Uz compinit && compinit' to ~/.zshrc\n    \
    Fish:       Save to ~/.config/fish/completions/lore.fish\n    \
    PowerShell: Add output to your $PROFILE\n    \
    Elvish:     Save to ~/.config/elvish/lib/lore.elv and use 'use lore'")]
pub struct Args {
    /// Shell to generate completions for
    #[arg(value_name = "SHELL", value_enum)]
    pub shell: Shell,
}

/// Writes the completion script for `shell` to stdout. Takes the root
/// command because only main.rs can build it.
pub fn run(args: Args, cmd: &mut Command) {
    generate(args.shell, cmd, "lore", &mut io::stdout());
}
