//! `planloop` command-line interface.
//!
//! Inspection of the run registry, the audit log, saved sessions, the
//! resolved configuration and the authorization policy. User-facing output uses
//! writeln! to the given writer (this is a CLI, not debug output).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod audit_cmd;
pub mod config_cmd;
pub mod policy_cmd;
pub mod runs_cmd;
pub mod sessions_cmd;

pub use audit_cmd::AuditArgs;
pub use config_cmd::ConfigAction;
pub use policy_cmd::PolicyAction;
pub use runs_cmd::RunsAction;
pub use sessions_cmd::SessionsAction;

#[derive(Parser, Debug)]
#[command(name = "planloop")]
#[command(version, about = "planloop - planner loop and subagent run registry")]
pub struct Cli {
    /// Run registry database path (overrides `storage.database_path`)
    #[arg(long, global = true, env = "PLANLOOP_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Project directory whose `.planloop/settings.json` is merged in
    #[arg(long, global = true, env = "PLANLOOP_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "warn", env = "PLANLOOP_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "PLANLOOP_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect subagent runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
    /// Inspect saved conversations
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Show audited tool calls
    Audit(AuditArgs),
    /// Evaluate the authorization policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Inspect the resolved configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Truncate a string to a maximum display width.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

/// Format a unix-millis timestamp as seconds with millisecond precision.
pub(crate) fn format_millis(ms: i64) -> String {
    format!("{}.{:03}", ms / 1000, (ms % 1000).abs())
}
