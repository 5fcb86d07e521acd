//! `planloop sessions` subcommands.

use std::io::Write;

use clap::Subcommand;

use crate::storage::{Database, DatabaseError, SessionRecord};

use super::{format_millis, truncate};

/// Width of message previews in `sessions show`.
const PREVIEW_CHARS: usize = 100;

#[derive(Subcommand, Debug)]
pub enum SessionsAction {
    /// List saved conversations, most recently updated first
    List {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
    /// Show a saved conversation's history window
    Show {
        /// Session ID
        id: String,
    },
    /// Delete a saved conversation
    Delete {
        /// Session ID
        id: String,
    },
}

pub async fn run(
    db: &Database,
    action: SessionsAction,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match action {
        SessionsAction::List { limit } => {
            let sessions = db.list_sessions(limit).await?;
            write_table(out, &sessions)?;
        }
        SessionsAction::Show { id } => match db.get_session(&id).await {
            Ok(session) => {
                let messages = db.load_session_messages(&id).await?;
                writeln!(out, "Session {}", session.id)?;
                writeln!(out, "  Persona:  {}", session.persona)?;
                writeln!(out, "  Role:     {}", session.role)?;
                writeln!(out, "  Updated:  {}", format_millis(session.updated_at))?;
                writeln!(out, "  Messages: {}", session.message_count)?;
                for message in &messages {
                    let preview = truncate(&message.content.replace('\n', " "), PREVIEW_CHARS);
                    writeln!(out, "  [{}] {:<9} {}", message.position, message.role, preview)?;
                }
            }
            Err(DatabaseError::NotFound(_)) => writeln!(out, "Session {id} not found.")?,
            Err(e) => return Err(e.into()),
        },
        SessionsAction::Delete { id } => {
            if db.delete_session(&id).await? {
                writeln!(out, "Deleted session {id}.")?;
            } else {
                writeln!(out, "Session {id} not found.")?;
            }
        }
    }
    Ok(())
}

fn write_table(out: &mut impl Write, sessions: &[SessionRecord]) -> std::io::Result<()> {
    if sessions.is_empty() {
        return writeln!(out, "No sessions found.");
    }
    writeln!(out, "{:<36}  {:<16}  {:<8}  {:>8}  UPDATED", "ID", "PERSONA", "ROLE", "MESSAGES")?;
    for session in sessions {
        writeln!(
            out,
            "{:<36}  {:<16}  {:<8}  {:>8}  {}",
            session.id,
            truncate(&session.persona, 16),
            truncate(&session.role, 8),
            session.message_count,
            format_millis(session.updated_at),
        )?;
    }
    writeln!(out, "\n{} session(s)", sessions.len())
}
