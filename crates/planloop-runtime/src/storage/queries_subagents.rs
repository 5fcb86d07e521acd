//! Database queries for the subagent run registry.
//!
//! Status updates are conditional on the current status, so a transition
//! that lost a race (for example a completion arriving after a timeout)
//! affects zero rows instead of moving a run backwards.

use planloop_core::db::unix_timestamp_millis;

use super::db::{Database, DatabaseError};
use super::models::{NewRun, RunStatus, SubagentRun, SubagentRunRow};

impl Database {
    /// Register a new run in `pending` state.
    pub async fn insert_run(&self, run: &NewRun<'_>) -> Result<SubagentRun, DatabaseError> {
        let now = unix_timestamp_millis();

        sqlx::query(
            r"
            INSERT INTO subagent_runs (id, parent_session_id, label, task, status, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?)
            ",
        )
        .bind(run.id)
        .bind(run.parent_session_id)
        .bind(run.label)
        .bind(run.task)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_run(run.id).await
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &str) -> Result<SubagentRun, DatabaseError> {
        sqlx::query_as::<_, SubagentRunRow>("SELECT * FROM subagent_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Subagent run {id}")))?
            .try_into()
    }

    /// List runs spawned by a parent session, in submission order.
    pub async fn list_runs_for_parent(
        &self,
        parent_session_id: &str,
    ) -> Result<Vec<SubagentRun>, DatabaseError> {
        sqlx::query_as::<_, SubagentRunRow>(
            "SELECT * FROM subagent_runs WHERE parent_session_id = ? ORDER BY seq ASC",
        )
        .bind(parent_session_id)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(SubagentRun::try_from)
        .collect()
    }

    /// List runs currently in the given status, in submission order.
    pub async fn list_runs_with_status(
        &self,
        status: RunStatus,
    ) -> Result<Vec<SubagentRun>, DatabaseError> {
        sqlx::query_as::<_, SubagentRunRow>(
            "SELECT * FROM subagent_runs WHERE status = ? ORDER BY seq ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(SubagentRun::try_from)
        .collect()
    }

    /// `pending -> running`. Returns whether the transition happened.
    pub async fn mark_run_running(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE subagent_runs SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(unix_timestamp_millis())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `running -> completed`. Returns whether the transition happened.
    pub async fn mark_run_completed(&self, id: &str, output: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE subagent_runs SET status = 'completed', result = ?, ended_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(output)
        .bind(unix_timestamp_millis())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `pending|running -> failed`. Returns whether the transition happened.
    pub async fn mark_run_failed(&self, id: &str, error: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE subagent_runs SET status = 'failed', error = ?, ended_at = ? WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(error)
        .bind(unix_timestamp_millis())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fail every run a previous process left `pending` or `running`.
    ///
    /// Returns the number of runs marked failed.
    pub async fn fail_interrupted_runs(&self, reason: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE subagent_runs SET status = 'failed', error = ?, ended_at = ? WHERE status IN ('pending', 'running')",
        )
        .bind(reason)
        .bind(unix_timestamp_millis())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
