//! Process-wide state shared by every executor.

use std::path::PathBuf;
use std::sync::Arc;

use planloop_core::config::{AgentConfig, Config};
use planloop_core::permissions::AuthorizationPolicy;

use crate::orchestration::{ManagerError, ManagerSettings, SubagentManager};
use crate::storage::{Database, DatabaseError, NewAuditEvent};

use super::persona::PersonaCatalog;

/// Errors while assembling a [`RuntimeContext`].
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] planloop_core::Error),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("No database path configured and no config directory available")]
    NoDatabasePath,
}

/// Policy, scheduler, registry and settings, built once and passed to
/// every executor explicitly.
pub struct RuntimeContext {
    agent: AgentConfig,
    default_role: String,
    policy: Arc<AuthorizationPolicy>,
    manager: Arc<SubagentManager>,
    db: Database,
    personas: PersonaCatalog,
    audit_tool_calls: bool,
    persist_sessions: bool,
}

impl RuntimeContext {
    /// Build a context over an already-open database. Starts the subagent
    /// manager, which fails runs left over by a previous process.
    pub async fn new(config: &Config, db: Database) -> Result<Self, ContextError> {
        config.validate()?;
        let policy = config.security.policy()?;
        let manager =
            SubagentManager::start(db.clone(), ManagerSettings::from(&config.agent)).await?;

        Ok(Self {
            agent: config.agent.clone(),
            default_role: config.security.default_role.clone(),
            policy: Arc::new(policy),
            manager: Arc::new(manager),
            db,
            personas: PersonaCatalog::builtin(),
            audit_tool_calls: config.storage.audit_tool_calls,
            persist_sessions: config.storage.persist_sessions,
        })
    }

    /// Open the configured registry database and build a context over it.
    pub async fn open(config: &Config) -> Result<Self, ContextError> {
        let path = resolve_database_path(config).ok_or(ContextError::NoDatabasePath)?;
        let db = Database::open(&path).await?;
        Self::new(config, db).await
    }

    #[must_use]
    pub fn with_personas(mut self, personas: PersonaCatalog) -> Self {
        self.personas = personas;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: AuthorizationPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub const fn agent_config(&self) -> &AgentConfig {
        &self.agent
    }

    pub fn default_role(&self) -> &str {
        &self.default_role
    }

    pub fn policy(&self) -> &AuthorizationPolicy {
        &self.policy
    }

    pub const fn manager(&self) -> &Arc<SubagentManager> {
        &self.manager
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub const fn personas(&self) -> &PersonaCatalog {
        &self.personas
    }

    /// Whether top-level conversations are saved after each run.
    pub const fn persist_sessions(&self) -> bool {
        self.persist_sessions
    }

    /// Append a tool call to the audit log if auditing is on. Failures are
    /// logged, never propagated.
    pub async fn audit(&self, event: &NewAuditEvent<'_>) {
        if !self.audit_tool_calls {
            return;
        }
        if let Err(e) = self.db.record_audit_event(event).await {
            tracing::warn!(tool = event.tool_name, error = %e, "Failed to write audit event");
        }
    }
}

/// Configured database path, or the per-user default.
pub fn resolve_database_path(config: &Config) -> Option<PathBuf> {
    config
        .storage
        .database_path
        .clone()
        .or_else(planloop_core::config::database_path)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_from_default_config() {
        let db = Database::open_in_memory().await.unwrap();
        let ctx = RuntimeContext::new(&Config::default(), db).await.unwrap();
        assert_eq!(ctx.default_role(), "user");
        assert!(!ctx.policy().is_enforced());
        assert_eq!(ctx.manager().settings().max_concurrent, 4);
        assert_eq!(ctx.personas().names().len(), 3);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let mut config = Config::default();
        config.agent.max_concurrent_subagents = 0;
        let result = RuntimeContext::new(&config, db).await;
        assert!(matches!(result, Err(ContextError::Config(_))));
    }

    #[tokio::test]
    async fn open_uses_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.database_path = Some(dir.path().join("nested").join("registry.db"));

        let ctx = RuntimeContext::open(&config).await.unwrap();
        ctx.database().list_runs_for_parent("none").await.unwrap();
        assert!(dir.path().join("nested").join("registry.db").exists());
    }

    #[tokio::test]
    async fn audit_respects_switch() {
        let db = Database::open_in_memory().await.unwrap();
        let mut config = Config::default();
        config.storage.audit_tool_calls = false;
        let ctx = RuntimeContext::new(&config, db).await.unwrap();

        ctx.audit(&NewAuditEvent {
            session_id: "s",
            role: "user",
            tool_name: "echo",
            call_id: "c",
            success: true,
            failure_kind: None,
            detail: None,
            duration_ms: 0,
        })
        .await;
        assert!(ctx.database().list_audit_events(None, 10).await.unwrap().is_empty());
    }
}
