//! Database queries for the tool-call audit log.

use planloop_core::db::unix_timestamp_millis;

use super::db::{Database, DatabaseError};
use super::models::{AuditEvent, NewAuditEvent};

impl Database {
    /// Append one tool-call record. Returns the new row ID.
    pub async fn record_audit_event(&self, event: &NewAuditEvent<'_>) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            r"
            INSERT INTO audit_events
                (session_id, role, tool_name, call_id, success, failure_kind, detail, duration_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(event.session_id)
        .bind(event.role)
        .bind(event.tool_name)
        .bind(event.call_id)
        .bind(event.success)
        .bind(event.failure_kind)
        .bind(event.detail)
        .bind(event.duration_ms)
        .bind(unix_timestamp_millis())
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// List audit events, oldest first, optionally filtered by session.
    pub async fn list_audit_events(
        &self,
        session_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, DatabaseError> {
        let events = match session_id {
            Some(session_id) => {
                sqlx::query_as::<_, AuditEvent>(
                    "SELECT * FROM audit_events WHERE session_id = ? ORDER BY id ASC LIMIT ?",
                )
                .bind(session_id)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, AuditEvent>("SELECT * FROM audit_events ORDER BY id ASC LIMIT ?")
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await?
            }
        };

        Ok(events)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use crate::storage::{Database, NewAuditEvent};

    fn event<'a>(session_id: &'a str, tool_name: &'a str, success: bool) -> NewAuditEvent<'a> {
        NewAuditEvent {
            session_id,
            role: "guest",
            tool_name,
            call_id: "call-1",
            success,
            failure_kind: (!success).then_some("authorization_denied"),
            detail: None,
            duration_ms: 3,
        }
    }

    #[tokio::test]
    async fn record_and_list_events() {
        let db = Database::open_in_memory().await.unwrap();
        db.record_audit_event(&event("s1", "web_search", true)).await.unwrap();
        db.record_audit_event(&event("s1", "shell_execute", false)).await.unwrap();

        let events = db.list_audit_events(Some("s1"), 100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tool_name, "web_search");
        assert!(events[0].success);
        assert!(events[0].failure_kind.is_none());
        assert_eq!(events[1].tool_name, "shell_execute");
        assert!(!events[1].success);
        assert_eq!(events[1].failure_kind.as_deref(), Some("authorization_denied"));
    }

    #[tokio::test]
    async fn list_filters_by_session_and_limit() {
        let db = Database::open_in_memory().await.unwrap();
        for _ in 0..3 {
            db.record_audit_event(&event("s1", "web_search", true)).await.unwrap();
        }
        db.record_audit_event(&event("s2", "web_search", true)).await.unwrap();

        assert_eq!(db.list_audit_events(Some("s2"), 100).await.unwrap().len(), 1);
        assert_eq!(db.list_audit_events(None, 100).await.unwrap().len(), 4);
        assert_eq!(db.list_audit_events(None, 2).await.unwrap().len(), 2);
    }
}
