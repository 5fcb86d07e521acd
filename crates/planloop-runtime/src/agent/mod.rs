//! The planner agent: conversation, capabilities, and the executor loop.
//!
//! - [`AgentExecutor`]: Plan/Dispatch loop over a [`ConversationState`].
//! - [`CompletionProvider`] and [`Tool`]: capabilities supplied by the embedder.
//! - [`RuntimeContext`]: policy, scheduler and registry shared by all executors.

pub mod context;
pub mod conversation;
pub mod events;
pub mod executor;
pub mod persona;
pub mod provider;
pub mod subagent;
pub mod tool;
pub mod types;

pub use context::{ContextError, RuntimeContext};
pub use conversation::{ConversationState, estimate_message_tokens, estimate_tokens};
pub use events::AgentEvent;
pub use executor::{AgentError, AgentExecutor, OutcomeStatus, RunOutcome};
pub use persona::{Persona, PersonaCatalog, UnknownPersona};
pub use provider::{CompletionProvider, FallbackProvider, GenerationConfig, ProviderError};
pub use subagent::SPAWN_SUBAGENT_TOOL;
pub use tool::{Tool, ToolOutput, ToolRegistry};
pub use types::{
    Message, ProviderResponse, Role, ToolCall, ToolDefinition, ToolFailure, ToolResult,
};
