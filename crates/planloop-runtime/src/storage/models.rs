//! Database models for the planloop runtime.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::db::DatabaseError;

/// Lifecycle state of a subagent run.
///
/// Transitions only move forward: `pending -> running -> completed|failed`,
/// or `pending -> failed` when a queued run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` admit no further transition.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DatabaseError::Query(format!("unknown run status '{other}'"))),
        }
    }
}

/// Subagent run row as stored in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubagentRunRow {
    pub seq: i64,
    pub id: String,
    pub parent_session_id: String,
    pub label: String,
    pub task: String,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

/// A subagent run record. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentRun {
    pub id: String,
    pub parent_session_id: String,
    pub label: String,
    pub task: String,
    pub status: RunStatus,
    /// Present iff `status == Completed`.
    pub result: Option<String>,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

/// Leading text of the error recorded for a run that hit its deadline.
pub const TIMEOUT_ERROR_PREFIX: &str = "Timed out after";

impl SubagentRun {
    /// Wall-clock time spent running, once the run has ended.
    pub fn run_duration_ms(&self) -> Option<i64> {
        Some(self.ended_at? - self.started_at?)
    }

    /// Whether the run failed because it ran past its deadline.
    pub fn timed_out(&self) -> bool {
        self.status == RunStatus::Failed
            && self
                .error
                .as_deref()
                .is_some_and(|e| e.starts_with(TIMEOUT_ERROR_PREFIX))
    }
}

impl TryFrom<SubagentRunRow> for SubagentRun {
    type Error = DatabaseError;

    fn try_from(row: SubagentRunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse()?,
            id: row.id,
            parent_session_id: row.parent_session_id,
            label: row.label,
            task: row.task,
            result: row.result,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}

/// Parameters for registering a new run.
#[derive(Debug, Clone, Copy)]
pub struct NewRun<'a> {
    pub id: &'a str,
    pub parent_session_id: &'a str,
    pub label: &'a str,
    pub task: &'a str,
}

/// One dispatched tool call, as written to the audit log.
#[derive(Debug, Clone)]
pub struct NewAuditEvent<'a> {
    pub session_id: &'a str,
    pub role: &'a str,
    pub tool_name: &'a str,
    pub call_id: &'a str,
    pub success: bool,
    /// Failure category (`authorization_denied`, `unknown_tool`, ...).
    pub failure_kind: Option<&'a str>,
    pub detail: Option<&'a str>,
    pub duration_ms: i64,
}

/// Audit log record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub tool_name: String,
    pub call_id: String,
    pub success: bool,
    pub failure_kind: Option<String>,
    pub detail: Option<String>,
    pub duration_ms: i64,
    pub created_at: i64,
}

/// Saved top-level conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub persona: String,
    pub role: String,
    pub message_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Identity of a session being saved.
#[derive(Debug, Clone, Copy)]
pub struct NewSession<'a> {
    pub id: &'a str,
    pub persona: &'a str,
    pub role: &'a str,
}

/// One history message to save. `payload` is the full message as JSON;
/// `role` and `content` are kept alongside for listing.
#[derive(Debug, Clone, Copy)]
pub struct NewSessionMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
    pub payload: &'a str,
}

/// Saved history message, in window order.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SessionMessageRow {
    pub position: i64,
    pub role: String,
    pub content: String,
    pub payload: String,
}
