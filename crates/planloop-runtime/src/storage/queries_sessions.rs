//! Database queries for saved conversations.

use planloop_core::db::unix_timestamp_millis;

use super::db::{Database, DatabaseError};
use super::models::{NewSession, NewSessionMessage, SessionMessageRow, SessionRecord};

impl Database {
    /// Create or update a session and replace its saved history.
    ///
    /// Runs in one transaction so a reader never sees a half-written window.
    pub async fn save_session(
        &self,
        session: &NewSession<'_>,
        messages: &[NewSessionMessage<'_>],
    ) -> Result<SessionRecord, DatabaseError> {
        let now = unix_timestamp_millis();
        let count = i64::try_from(messages.len()).unwrap_or(i64::MAX);
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO sessions (id, persona, role, message_count, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET persona = ?, role = ?, message_count = ?, updated_at = ?",
        )
        .bind(session.id)
        .bind(session.persona)
        .bind(session.role)
        .bind(count)
        .bind(now)
        .bind(now)
        .bind(session.persona)
        .bind(session.role)
        .bind(count)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM session_messages WHERE session_id = ?")
            .bind(session.id)
            .execute(&mut *tx)
            .await?;

        for (position, message) in (0_i64..).zip(messages) {
            sqlx::query(
                "INSERT INTO session_messages (session_id, position, role, content, payload) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(session.id)
            .bind(position)
            .bind(message.role)
            .bind(message.content)
            .bind(message.payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get_session(session.id).await
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionRecord, DatabaseError> {
        sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Session {id}")))
    }

    /// Saved history of a session, oldest first.
    pub async fn load_session_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionMessageRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, SessionMessageRow>(
            "SELECT position, role, content, payload FROM session_messages \
             WHERE session_id = ? ORDER BY position ASC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Most recently updated sessions first.
    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<SessionRecord>, DatabaseError> {
        let sessions = sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions ORDER BY updated_at DESC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(sessions)
    }

    /// Delete a session and its history. Returns false if it did not exist.
    pub async fn delete_session(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
