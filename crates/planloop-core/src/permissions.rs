//! Role-based tool authorization.
//!
//! Evaluates `(role, tool)` pairs against a static policy table. Every role
//! carries an allow-set and a deny-set of tool patterns. Patterns are exact
//! names (`web_search`), prefix globs (`mcp__*`), or the catch-all `*`.
//!
//! Matching goes from the most specific tier to the least specific one, and
//! within a tier a deny entry wins over an allow entry:
//!
//! 1. exact deny, 2. exact allow,
//! 3. prefix deny, 4. prefix allow,
//! 5. `*` deny, 6. `*` allow,
//! 7. default deny.
//!
//! So `*` only decides for names that no other entry of the role mentions,
//! and an unknown role behaves like a role with an empty allow-set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Allow and deny patterns for a single role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl RolePolicy {
    pub fn new<A, D>(allow: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            allow: allow.into_iter().map(Into::into).collect(),
            deny: deny.into_iter().map(Into::into).collect(),
        }
    }
}

/// Specificity of a pattern match. Lower is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchTier {
    Exact,
    Prefix,
    Any,
}

/// Result of evaluating a tool request against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Pattern that decided the outcome (`None` for default-deny or a
    /// permissive policy).
    pub matched: Option<String>,
    /// Human-readable explanation.
    pub reason: String,
}

/// Immutable role -> {allow, deny} table.
///
/// Read-only after construction; share it behind an `Arc` and call
/// [`can_use`](Self::can_use) from any task without synchronization.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationPolicy {
    roles: HashMap<String, RolePolicy>,
    enforced: bool,
}

impl AuthorizationPolicy {
    /// Create an enforcing policy from a role table.
    ///
    /// Rejects patterns that place `*` anywhere but at the end.
    pub fn new(roles: HashMap<String, RolePolicy>) -> Result<Self> {
        for (role, policy) in &roles {
            for pattern in policy.allow.iter().chain(&policy.deny) {
                validate_pattern(pattern).map_err(|reason| {
                    Error::Policy(format!("role '{role}': pattern '{pattern}' {reason}"))
                })?;
            }
        }
        Ok(Self {
            roles,
            enforced: true,
        })
    }

    /// A policy that allows every tool for every role.
    ///
    /// Used when security enforcement is switched off in the configuration.
    pub fn permissive() -> Self {
        Self {
            roles: HashMap::new(),
            enforced: false,
        }
    }

    /// Whether this policy enforces its role table.
    pub const fn is_enforced(&self) -> bool {
        self.enforced
    }

    /// Look up the table entry for a role.
    pub fn role(&self, role: &str) -> Option<&RolePolicy> {
        self.roles.get(role)
    }

    /// Names of all configured roles, sorted.
    pub fn role_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.roles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Decide whether `role` may invoke `tool_name`.
    pub fn can_use(&self, role: &str, tool_name: &str) -> bool {
        self.evaluate(role, tool_name).allowed
    }

    /// Evaluate a request and explain the outcome.
    pub fn evaluate(&self, role: &str, tool_name: &str) -> AuthorizationDecision {
        if !self.enforced {
            return AuthorizationDecision {
                allowed: true,
                matched: None,
                reason: "authorization is not enforced".to_string(),
            };
        }

        let Some(policy) = self.roles.get(role) else {
            warn!(role, tool = tool_name, "Unknown role, denying by default");
            return AuthorizationDecision {
                allowed: false,
                matched: None,
                reason: format!("role '{role}' is not defined"),
            };
        };

        let deny = best_match(&policy.deny, tool_name);
        let allow = best_match(&policy.allow, tool_name);

        let decision = match (deny, allow) {
            (Some((deny_tier, pattern)), Some((allow_tier, _))) if deny_tier <= allow_tier => {
                denied(role, tool_name, pattern)
            }
            (_, Some((_, pattern))) => AuthorizationDecision {
                allowed: true,
                matched: Some(pattern.to_string()),
                reason: format!("role '{role}' allows '{pattern}'"),
            },
            (Some((_, pattern)), None) => denied(role, tool_name, pattern),
            (None, None) => AuthorizationDecision {
                allowed: false,
                matched: None,
                reason: format!("role '{role}' has no allow rule for '{tool_name}'"),
            },
        };

        debug!(
            role,
            tool = tool_name,
            allowed = decision.allowed,
            matched = ?decision.matched,
            "Authorization evaluated"
        );
        decision
    }
}

fn denied(role: &str, tool_name: &str, pattern: &str) -> AuthorizationDecision {
    AuthorizationDecision {
        allowed: false,
        matched: Some(pattern.to_string()),
        reason: format!("role '{role}' denies '{tool_name}' (matched '{pattern}')"),
    }
}

/// Most specific pattern in `patterns` matching `tool_name`.
fn best_match<'a>(patterns: &'a [String], tool_name: &str) -> Option<(MatchTier, &'a str)> {
    patterns
        .iter()
        .filter_map(|p| matches_tool(p, tool_name).map(|tier| (tier, p.as_str())))
        .min_by_key(|(tier, _)| *tier)
}

/// Check if a tool name matches a pattern, returning the match tier.
fn matches_tool(pattern: &str, tool_name: &str) -> Option<MatchTier> {
    if pattern == "*" {
        return Some(MatchTier::Any);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return tool_name.starts_with(prefix).then_some(MatchTier::Prefix);
    }
    (pattern == tool_name).then_some(MatchTier::Exact)
}

fn validate_pattern(pattern: &str) -> std::result::Result<(), &'static str> {
    if pattern.is_empty() {
        return Err("is empty");
    }
    let body = pattern.strip_suffix('*').unwrap_or(pattern);
    if body.contains('*') {
        return Err("may only use '*' as a trailing wildcard");
    }
    Ok(())
}

/// Built-in role table: `admin`, `user`, and `guest`.
pub fn default_roles() -> HashMap<String, RolePolicy> {
    HashMap::from([
        ("admin".to_string(), RolePolicy::new(["*"], Vec::<String>::new())),
        (
            "user".to_string(),
            RolePolicy::new(["*"], ["shell_execute", "file_delete"]),
        ),
        (
            "guest".to_string(),
            RolePolicy::new(["web_search", "browser_content", "query_memory"], ["*"]),
        ),
    ])
}
