//! Progress events emitted by an executor.

use super::executor::OutcomeStatus;
use super::types::{ToolCall, ToolResult};

/// Broadcast channel buffer size for agent events.
pub const AGENT_EVENT_CAPACITY: usize = 256;

/// Observable progress of one executor. Sent on a broadcast channel;
/// nobody listening is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A Plan step is about to call the provider.
    ThinkingStarted { session_id: String, iteration: usize },
    /// A `<thought>` segment extracted from the model's reply.
    Thought { session_id: String, content: String },
    ToolCallIssued { session_id: String, call: ToolCall },
    ToolResultReceived {
        session_id: String,
        result: ToolResult,
    },
    /// A Plan/Dispatch cycle has been appended to the conversation.
    TurnComplete { session_id: String, iteration: usize },
    RunFinished {
        session_id: String,
        status: OutcomeStatus,
        iterations: usize,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::ThinkingStarted { session_id, .. }
            | Self::Thought { session_id, .. }
            | Self::ToolCallIssued { session_id, .. }
            | Self::ToolResultReceived { session_id, .. }
            | Self::TurnComplete { session_id, .. }
            | Self::RunFinished { session_id, .. } => session_id,
        }
    }
}
