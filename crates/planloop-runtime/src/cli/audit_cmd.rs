//! `planloop audit`.

use std::io::Write;

use clap::Args;

use crate::storage::Database;

use super::{format_millis, truncate};

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Only show calls made by this session
    #[arg(short, long)]
    pub session: Option<String>,
    /// Maximum number of events, oldest first
    #[arg(short, long, default_value_t = 50)]
    pub limit: i64,
}

pub async fn run(db: &Database, args: AuditArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let events = db.list_audit_events(args.session.as_deref(), args.limit).await?;
    if events.is_empty() {
        writeln!(out, "No audit events found.")?;
        return Ok(());
    }

    writeln!(
        out,
        "{:<15}  {:<12}  {:<20}  {:<8}  {:>8}  ERROR",
        "TIME", "ROLE", "TOOL", "OUTCOME", "MS"
    )?;
    for event in &events {
        let outcome = if event.success { "ok" } else { "failed" };
        let error = match (&event.failure_kind, &event.detail) {
            (Some(kind), Some(detail)) => format!("{kind}: {}", truncate(detail, 60)),
            (Some(kind), None) => kind.clone(),
            _ => String::new(),
        };
        writeln!(
            out,
            "{:<15}  {:<12}  {:<20}  {:<8}  {:>8}  {}",
            format_millis(event.created_at),
            truncate(&event.role, 12),
            truncate(&event.tool_name, 20),
            outcome,
            event.duration_ms,
            error,
        )?;
    }
    writeln!(out, "\n{} event(s)", events.len())?;
    Ok(())
}
