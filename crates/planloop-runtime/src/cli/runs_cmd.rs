//! `planloop runs` subcommands.

use std::io::Write;

use clap::Subcommand;

use crate::storage::{Database, DatabaseError, RunStatus, SubagentRun};

use super::{format_millis, truncate};

#[derive(Subcommand, Debug)]
pub enum RunsAction {
    /// List runs spawned by a session, in submission order
    List {
        /// Parent session ID
        #[arg(short, long)]
        parent: String,
    },
    /// Show one run in full
    Show {
        /// Run ID
        id: String,
    },
    /// List runs currently pending or running
    Active,
}

pub async fn run(db: &Database, action: RunsAction, out: &mut impl Write) -> anyhow::Result<()> {
    match action {
        RunsAction::List { parent } => {
            let runs = db.list_runs_for_parent(&parent).await?;
            write_table(out, &runs)?;
        }
        RunsAction::Show { id } => match db.get_run(&id).await {
            Ok(run) => write_detail(out, &run)?,
            Err(DatabaseError::NotFound(_)) => {
                writeln!(out, "Run {id} not found.")?;
            }
            Err(e) => return Err(e.into()),
        },
        RunsAction::Active => {
            let mut runs = db.list_runs_with_status(RunStatus::Running).await?;
            runs.extend(db.list_runs_with_status(RunStatus::Pending).await?);
            write_table(out, &runs)?;
        }
    }
    Ok(())
}

fn write_table(out: &mut impl Write, runs: &[SubagentRun]) -> std::io::Result<()> {
    if runs.is_empty() {
        return writeln!(out, "No runs found.");
    }
    writeln!(out, "{:<36}  {:<24}  {:<10}  DURATION", "ID", "LABEL", "STATUS")?;
    for run in runs {
        let duration = run
            .run_duration_ms()
            .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
        writeln!(
            out,
            "{:<36}  {:<24}  {:<10}  {}",
            run.id,
            truncate(&run.label, 24),
            run.status,
            duration,
        )?;
    }
    writeln!(out, "\n{} run(s)", runs.len())
}

fn write_detail(out: &mut impl Write, run: &SubagentRun) -> std::io::Result<()> {
    writeln!(out, "Run {}", run.id)?;
    writeln!(out, "  Parent:   {}", run.parent_session_id)?;
    writeln!(out, "  Label:    {}", run.label)?;
    writeln!(out, "  Status:   {}", run.status)?;
    writeln!(out, "  Created:  {}", format_millis(run.created_at))?;
    if let Some(started) = run.started_at {
        writeln!(out, "  Started:  {}", format_millis(started))?;
    }
    if let Some(ended) = run.ended_at {
        writeln!(out, "  Ended:    {}", format_millis(ended))?;
    }
    writeln!(out, "  Task:\n    {}", run.task)?;
    if let Some(result) = &run.result {
        writeln!(out, "  Result:\n    {result}")?;
    }
    if let Some(error) = &run.error {
        writeln!(out, "  Error:    {error}")?;
    }
    Ok(())
}
