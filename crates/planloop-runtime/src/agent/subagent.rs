//! The built-in `spawn_subagent` tool.
//!
//! Spawning is handled by the executor itself rather than through
//! [`Tool`](super::tool::Tool): a spawn has to submit a run to the shared
//! manager and build a child executor from the parent's provider and tools.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestration::SubagentTask;

use super::context::RuntimeContext;
use super::executor::{AgentError, AgentExecutor};
use super::persona::SUBAGENT_PERSONA;
use super::provider::{CompletionProvider, GenerationConfig};
use super::tool::ToolRegistry;
use super::types::{ToolCall, ToolDefinition, ToolFailure};

pub const SPAWN_SUBAGENT_TOOL: &str = "spawn_subagent";

/// Labels default to the start of the task text.
const DEFAULT_LABEL_CHARS: usize = 50;

pub fn spawn_subagent_definition() -> ToolDefinition {
    ToolDefinition {
        name: SPAWN_SUBAGENT_TOOL.to_string(),
        description: "Delegate a self-contained task to a subagent that runs in parallel \
                      with other subagents. The subagent's final answer is returned as \
                      this tool's result."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete, unambiguous description of the task."
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label, e.g. 'pricing_research'."
                }
            },
            "required": ["task"]
        }),
    }
}

/// Validated `spawn_subagent` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnArgs {
    pub task: String,
    pub label: String,
}

impl SpawnArgs {
    pub fn parse(call: &ToolCall) -> Result<Self, ToolFailure> {
        let task = call
            .str_arg("task")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ToolFailure::InvalidArguments("'task' must be a non-empty string".to_string())
            })?
            .to_string();

        let label = call
            .str_arg("label")
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map_or_else(
                || task.chars().take(DEFAULT_LABEL_CHARS).collect(),
                str::to_string,
            );

        Ok(Self { task, label })
    }
}

/// Everything needed to build a child executor once its run is promoted.
pub(crate) struct ChildSpec {
    pub ctx: Arc<RuntimeContext>,
    pub provider: Arc<dyn CompletionProvider>,
    pub tools: Arc<ToolRegistry>,
    pub generation: GenerationConfig,
    pub role: String,
    pub depth: usize,
}

impl ChildSpec {
    /// Task that runs a fresh executor on `task` with the subagent persona
    /// and the subagent iteration budget.
    pub fn into_task(self, run_id: String, task: String) -> SubagentTask {
        Box::new(move |cancel: CancellationToken| {
            async move {
                let max_iterations = self.ctx.agent_config().subagent_max_iterations;
                let mut child = AgentExecutor::new(self.ctx, self.provider, self.tools)
                    .with_session_id(run_id.clone())
                    .with_role(self.role)
                    .with_depth(self.depth)
                    .with_generation_config(self.generation);
                if let Err(e) = child.set_persona(SUBAGENT_PERSONA) {
                    warn!(run_id = %run_id, error = %e, "Subagent persona missing, using default");
                }

                info!(run_id = %run_id, depth = child.depth(), "Subagent executor starting");
                match child.run(&task, max_iterations, &cancel).await {
                    Ok(outcome) => Ok(outcome.content),
                    Err(AgentError::Cancelled) => Err("cancelled".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
            .boxed()
        })
    }
}

/// Tool output reported to the parent for a completed run.
pub fn completed_output(run_id: &str, label: &str, result: Option<String>) -> Value {
    json!({
        "run_id": run_id,
        "label": label,
        "status": "completed",
        "result": result.unwrap_or_default(),
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_requires_task() {
        let call = ToolCall::from_json(SPAWN_SUBAGENT_TOOL, json!({"label": "x"}));
        assert!(matches!(
            SpawnArgs::parse(&call),
            Err(ToolFailure::InvalidArguments(_))
        ));

        let call = ToolCall::from_json(SPAWN_SUBAGENT_TOOL, json!({"task": "   "}));
        assert!(SpawnArgs::parse(&call).is_err());
    }

    #[test]
    fn label_defaults_to_task_prefix() {
        let task = "a".repeat(80);
        let call = ToolCall::from_json(SPAWN_SUBAGENT_TOOL, json!({ "task": task }));
        let args = SpawnArgs::parse(&call).unwrap();
        assert_eq!(args.label.len(), DEFAULT_LABEL_CHARS);
        assert_eq!(args.task.len(), 80);
    }

    #[test]
    fn explicit_label_is_kept() {
        let call = ToolCall::from_json(
            SPAWN_SUBAGENT_TOOL,
            json!({"task": "look it up", "label": "lookup"}),
        );
        assert_eq!(
            SpawnArgs::parse(&call).unwrap(),
            SpawnArgs {
                task: "look it up".to_string(),
                label: "lookup".to_string(),
            }
        );
    }

    #[test]
    fn definition_requires_task() {
        let def = spawn_subagent_definition();
        assert_eq!(def.name, SPAWN_SUBAGENT_TOOL);
        assert_eq!(def.parameters["required"], json!(["task"]));
    }
}
