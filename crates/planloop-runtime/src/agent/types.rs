//! Conversation messages, tool calls, and tool results.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Calls issued by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool messages: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Reasoning extracted from `<thought>` segments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            thinking: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant message carrying a batch of tool calls.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    /// Tool message reporting one result back to the model.
    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            tool_call_id: Some(result.call_id.clone()),
            tool_name: Some(result.tool_name.clone()),
            ..Self::plain(Role::Tool, result.to_content())
        }
    }

    #[must_use]
    pub fn with_thinking(mut self, thinking: Option<String>) -> Self {
        self.thinking = thinking;
        self
    }
}

/// A tool invocation requested by the model. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Plan/Dispatch cycle that issued the call (1-based).
    #[serde(default)]
    pub iteration: usize,
}

impl ToolCall {
    /// New call with a generated ID.
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
            iteration: 0,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Build a call from a JSON object literal; non-object values give no arguments.
    pub fn from_json(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(name, arguments)
    }

    /// String argument by key.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// Why a tool call produced no useful output. Absorbed into the
/// conversation as a failed [`ToolResult`]; never aborts the loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolFailure {
    #[error("role '{role}' is not permitted to use tool '{tool}'")]
    AuthorizationDenied { role: String, tool: String },

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("{0}")]
    Execution(String),

    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("subagent {run_id} did not finish within {waited:?}")]
    SubagentTimeout { run_id: String, waited: Duration },

    #[error("subagent {run_id} failed: {message}")]
    SubagentFailed { run_id: String, message: String },

    #[error("tool call limit of {limit} per turn reached")]
    CallLimitExceeded { limit: usize },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("subagents cannot spawn beyond depth {max_depth}")]
    SpawnDepthExceeded { max_depth: usize },
}

impl ToolFailure {
    /// Stable category name, as written to the audit log.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Execution(_) => "execution",
            Self::Timeout(_) => "timeout",
            Self::SubagentTimeout { .. } => "subagent_timeout",
            Self::SubagentFailed { .. } => "subagent_failed",
            Self::CallLimitExceeded { .. } => "call_limit_exceeded",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::SpawnDepthExceeded { .. } => "spawn_depth_exceeded",
        }
    }
}

/// Outcome of exactly one [`ToolCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub output: Value,
    /// Present iff `success` is false.
    pub error: Option<ToolFailure>,
    pub duration: Duration,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, output: Value, duration: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: true,
            output,
            error: None,
            duration,
        }
    }

    pub fn failed(call: &ToolCall, failure: ToolFailure, duration: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: false,
            output: Value::Null,
            error: Some(failure),
            duration,
        }
    }

    /// Text shown to the model in the tool message.
    pub fn to_content(&self) -> String {
        match (&self.error, &self.output) {
            (Some(failure), _) => format!("Error: {failure}"),
            (None, Value::String(text)) => text.clone(),
            (None, Value::Null) => String::new(),
            (None, other) => other.to_string(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub const fn duration_ms(&self) -> i64 {
        self.duration.as_millis() as i64
    }
}

/// Tool description offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// What the model produced for one Plan step.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    /// Terminal answer; ends the run.
    Final { content: String },
    /// One or more tool calls, possibly with accompanying text.
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
}

impl ProviderResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Final {
            content: content.into(),
        }
    }

    pub const fn calls(calls: Vec<ToolCall>) -> Self {
        Self::ToolCalls {
            content: None,
            calls,
        }
    }
}
