//! `planloop config` subcommands.

use std::io::Write;

use clap::Subcommand;
use planloop_core::Config;

use crate::agent::context::resolve_database_path;

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the resolved configuration as JSON
    Show,
    /// Print the registry database path that would be opened
    Path,
}

pub fn run(config: &Config, action: ConfigAction, out: &mut impl Write) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            writeln!(out, "{}", serde_json::to_string_pretty(config)?)?;
        }
        ConfigAction::Path => match resolve_database_path(config) {
            Some(path) => writeln!(out, "{}", path.display())?,
            None => writeln!(out, "No database path available.")?,
        },
    }
    Ok(())
}
