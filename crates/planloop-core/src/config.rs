//! Configuration resolution for planloop.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/planloop/settings.json)
//! 3. Project config (.planloop/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::permissions::{AuthorizationPolicy, RolePolicy, default_roles};

/// Complete planloop configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Agent loop and subagent scheduling limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Ceiling on simultaneously running subagents.
    pub max_concurrent_subagents: usize,
    /// Tool calls allowed per `run()`; 0 means unlimited.
    pub max_tool_calls_per_turn: usize,
    /// History bound for a conversation (system prompt excluded).
    pub max_history_messages: usize,
    /// Estimated-token bound for a conversation, system prompt included.
    /// 0 leaves only the message bound.
    pub max_history_tokens: usize,
    /// Plan/Dispatch cycles per top-level `run()`.
    pub max_iterations: usize,
    /// Plan/Dispatch cycles per subagent run.
    pub subagent_max_iterations: usize,
    pub subagent_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub provider_timeout_secs: u64,
    /// Time a cancelled or timed-out subagent gets to wind down before its
    /// task is dropped and its slot released.
    pub stop_grace_ms: u64,
    /// How deep subagents may nest. 1 means subagents cannot spawn.
    pub max_spawn_depth: usize,
    pub enable_thinking: bool,
    pub default_persona: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subagents: 4,
            max_tool_calls_per_turn: 10,
            max_history_messages: 10,
            max_history_tokens: 0,
            max_iterations: 10,
            subagent_max_iterations: 5,
            subagent_timeout_secs: 60,
            tool_timeout_secs: 60,
            provider_timeout_secs: 120,
            stop_grace_ms: 2_000,
            max_spawn_depth: 1,
            enable_thinking: false,
            default_persona: "default".to_string(),
        }
    }
}

impl AgentConfig {
    pub const fn subagent_timeout(&self) -> Duration {
        Duration::from_secs(self.subagent_timeout_secs)
    }

    pub const fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Role-based access control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// When false every role may use every tool.
    pub enabled: bool,
    /// Role used by executors that are not given one explicitly.
    pub default_role: String,
    /// Roles layered over the built-in `admin`/`user`/`guest` table; an
    /// entry with a built-in name replaces that role.
    pub roles: HashMap<String, RolePolicy>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_role: "user".to_string(),
            roles: HashMap::new(),
        }
    }
}

impl SecurityConfig {
    /// Built-in roles with the configured ones layered on top.
    pub fn effective_roles(&self) -> HashMap<String, RolePolicy> {
        let mut roles = default_roles();
        roles.extend(self.roles.clone());
        roles
    }

    /// Build the immutable authorization policy described by this section.
    pub fn policy(&self) -> Result<AuthorizationPolicy> {
        if self.enabled {
            AuthorizationPolicy::new(self.effective_roles())
        } else {
            Ok(AuthorizationPolicy::permissive())
        }
    }
}

/// Run registry storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
    /// Record every dispatched tool call in the audit log.
    pub audit_tool_calls: bool,
    /// Save top-level conversations after each run so they can be resumed.
    pub persist_sessions: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            audit_tool_calls: true,
            persist_sessions: true,
        }
    }
}

impl Config {
    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_concurrent_subagents == 0 {
            return Err(Error::Config(
                "agent.max_concurrent_subagents must be at least 1".to_string(),
            ));
        }
        if self.agent.max_history_messages == 0 {
            return Err(Error::Config(
                "agent.max_history_messages must be at least 1".to_string(),
            ));
        }
        if self.agent.max_iterations == 0 || self.agent.subagent_max_iterations == 0 {
            return Err(Error::Config(
                "agent iteration limits must be at least 1".to_string(),
            ));
        }
        if self.security.default_role.is_empty() {
            return Err(Error::Config(
                "security.default_role must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".planloop").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    // Apply environment overrides
    apply_env_overrides(&mut config);

    config.validate()?;
    Ok(config)
}

/// Base directory for planloop's per-user files.
fn config_dir() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .map(|p| p.join("planloop"))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Get the default run registry path.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("registry.db"))
}

pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.agent = overlay.agent;

    // Roles merge by name so a project file can add one role without
    // restating the global table.
    base.security.enabled = overlay.security.enabled;
    base.security.default_role = overlay.security.default_role;
    base.security.roles.extend(overlay.security.roles);

    if overlay.storage.database_path.is_some() {
        base.storage.database_path = overlay.storage.database_path;
    }
    base.storage.audit_tool_calls = overlay.storage.audit_tool_calls;
    base.storage.persist_sessions = overlay.storage.persist_sessions;
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(n) = env_parse("PLANLOOP_MAX_CONCURRENT_SUBAGENTS") {
        config.agent.max_concurrent_subagents = n;
    }
    if let Some(n) = env_parse("PLANLOOP_MAX_TOOL_CALLS_PER_TURN") {
        config.agent.max_tool_calls_per_turn = n;
    }
    if let Some(n) = env_parse("PLANLOOP_MAX_HISTORY_MESSAGES") {
        config.agent.max_history_messages = n;
    }
    if let Some(n) = env_parse("PLANLOOP_MAX_HISTORY_TOKENS") {
        config.agent.max_history_tokens = n;
    }
    if let Some(n) = env_parse("PLANLOOP_SUBAGENT_TIMEOUT_SECS") {
        config.agent.subagent_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("PLANLOOP_DEFAULT_ROLE") {
        config.security.default_role = val;
    }
    if let Ok(val) = std::env::var("PLANLOOP_DB_PATH") {
        config.storage.database_path = Some(PathBuf::from(val));
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
