//! `planloop` CLI
//!
//! Inspects the subagent run registry, the tool-call audit log, saved
//! sessions, the authorization policy and the resolved configuration.

use std::io;

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use planloop_core::config::load_config;
use planloop_runtime::agent::context::resolve_database_path;
use planloop_runtime::cli::{self, Cli, Command};
use planloop_runtime::storage::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let log_filter = format!("planloop_runtime={}", args.log_level);
    planloop_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let mut config = load_config(args.project_dir.as_deref())?;
    if let Some(path) = args.db_path {
        config.storage.database_path = Some(path);
    }
    let mut out = io::stdout().lock();

    match args.command {
        Command::Runs { action } => {
            let db = open_database(&config).await?;
            cli::runs_cmd::run(&db, action, &mut out).await?;
        }
        Command::Sessions { action } => {
            let db = open_database(&config).await?;
            cli::sessions_cmd::run(&db, action, &mut out).await?;
        }
        Command::Audit(audit_args) => {
            let db = open_database(&config).await?;
            cli::audit_cmd::run(&db, audit_args, &mut out).await?;
        }
        Command::Policy { action } => cli::policy_cmd::run(&config, action, &mut out)?,
        Command::Config { action } => cli::config_cmd::run(&config, action, &mut out)?,
    }
    Ok(())
}

/// Open the registry without starting a scheduler, so inspecting runs never
/// triggers restart recovery on another process's live runs.
async fn open_database(config: &planloop_core::Config) -> anyhow::Result<Database> {
    let path = resolve_database_path(config)
        .context("No database path configured and no config directory available")?;
    debug!(path = %path.display(), "Opening database");
    Database::open(&path)
        .await
        .with_context(|| format!("Failed to open database at {}", path.display()))
}
