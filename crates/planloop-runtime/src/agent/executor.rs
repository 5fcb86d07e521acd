//! The planner loop.
//!
//! [`AgentExecutor::run`] alternates Plan (ask the provider for the next
//! step) and Dispatch (run every tool call in the batch concurrently) until
//! the model answers without tool calls or the iteration budget runs out.
//! The assistant message and all of its tool results are appended to the
//! conversation together, in issuance order.

use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Instant;

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestration::{ManagerError, SubagentRequest};
use crate::storage::{
    DatabaseError, NewAuditEvent, NewSession, NewSessionMessage, RunStatus as RegistryStatus,
};

use super::context::RuntimeContext;
use super::conversation::ConversationState;
use super::events::{AGENT_EVENT_CAPACITY, AgentEvent};
use super::persona::UnknownPersona;
use super::provider::{CompletionProvider, GenerationConfig, ProviderError};
use super::subagent::{
    ChildSpec, SPAWN_SUBAGENT_TOOL, SpawnArgs, completed_output, spawn_subagent_definition,
};
use super::tool::{ToolOutput, ToolRegistry, check_required_arguments};
use super::types::{
    Message, ProviderResponse, ToolCall, ToolDefinition, ToolFailure, ToolResult,
};

static THOUGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<thought>(.*?)</thought>").expect("static regex is valid"));

/// Failures that end a `run()`. Tool problems never do; they become
/// failed tool results instead.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Session store error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Saved message {position} of session {session_id} is unreadable: {message}")]
    CorruptSession {
        session_id: String,
        position: i64,
        message: String,
    },
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The model produced a final answer.
    Completed,
    /// The iteration budget ran out first. Not an error.
    IterationLimit,
}

/// Result of one `run()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: OutcomeStatus,
    /// Final answer, or an explanation when the budget ran out.
    pub content: String,
    /// Plan/Dispatch cycles performed.
    pub iterations: usize,
    /// Tool calls counted against the per-turn budget.
    pub tool_calls: usize,
}

/// Drives one conversation. Owns its history; shares the scheduler, policy
/// and registry through [`RuntimeContext`].
pub struct AgentExecutor {
    session_id: String,
    ctx: Arc<RuntimeContext>,
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<ToolRegistry>,
    role: String,
    persona: String,
    depth: usize,
    generation: GenerationConfig,
    conversation: ConversationState,
    events: broadcast::Sender<AgentEvent>,
}

impl AgentExecutor {
    /// New top-level executor using the configured default role and persona.
    pub fn new(
        ctx: Arc<RuntimeContext>,
        provider: Arc<dyn CompletionProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let config = ctx.agent_config();
        let persona = config.default_persona.clone();
        let system_prompt = match ctx.personas().get(&persona) {
            Ok(p) => Some(p.system_prompt.clone()),
            Err(e) => {
                warn!(error = %e, "Default persona not found, running without a system prompt");
                None
            }
        };
        let conversation = ConversationState::new(system_prompt, config.max_history_messages)
            .with_token_budget(config.max_history_tokens);
        let role = ctx.default_role().to_string();
        let (events, _) = broadcast::channel(AGENT_EVENT_CAPACITY);

        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            ctx,
            provider,
            tools,
            role,
            persona,
            depth: 0,
            generation: GenerationConfig::default(),
            conversation,
            events,
        }
    }

    /// Rebuild a top-level executor from a saved session: same ID, role,
    /// persona and history window.
    pub async fn resume(
        ctx: Arc<RuntimeContext>,
        provider: Arc<dyn CompletionProvider>,
        tools: Arc<ToolRegistry>,
        session_id: &str,
    ) -> Result<Self, AgentError> {
        let record = ctx.database().get_session(session_id).await?;
        let rows = ctx.database().load_session_messages(session_id).await?;
        let messages = rows
            .into_iter()
            .map(|row| {
                serde_json::from_str::<Message>(&row.payload).map_err(|e| {
                    AgentError::CorruptSession {
                        session_id: session_id.to_string(),
                        position: row.position,
                        message: e.to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut executor = Self::new(ctx, provider, tools)
            .with_session_id(record.id)
            .with_role(record.role);
        if let Err(e) = executor.set_persona(&record.persona) {
            warn!(session_id, error = %e, "Saved persona not found, keeping the default");
        }
        executor.conversation.extend(messages);

        info!(session_id, messages = executor.conversation.len(), "Session resumed");
        Ok(executor)
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_persona(mut self, name: &str) -> Result<Self, UnknownPersona> {
        self.set_persona(name)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_generation_config(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    /// Nesting level: 0 for a top-level executor, parent + 1 for a subagent.
    #[must_use]
    pub(crate) fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Swap the pinned system prompt. Takes `&mut self`, so it cannot race
    /// an in-flight `run()`.
    pub fn set_persona(&mut self, name: &str) -> Result<(), UnknownPersona> {
        let persona = self.ctx.personas().get(name)?;
        let missing = persona.missing_tools(&self.tools);
        if !missing.is_empty() {
            warn!(persona = name, missing = ?missing, "Persona expects tools that are not registered");
        }
        self.conversation.set_system_prompt(persona.system_prompt.clone());
        self.persona = name.to_string();
        debug!(session_id = %self.session_id, persona = name, "Persona set");
        Ok(())
    }

    pub fn set_provider(&mut self, provider: Arc<dyn CompletionProvider>) {
        debug!(session_id = %self.session_id, provider = provider.name(), "Provider set");
        self.provider = provider;
    }

    pub fn set_role(&mut self, role: impl Into<String>) {
        self.role = role.into();
    }

    pub fn set_generation_config(&mut self, generation: GenerationConfig) {
        self.generation = generation;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub const fn depth(&self) -> usize {
        self.depth
    }

    pub const fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// Whether this executor may still spawn subagents.
    fn can_spawn(&self) -> bool {
        self.depth < self.ctx.agent_config().max_spawn_depth
    }

    /// Definitions offered to the model. `spawn_subagent` is offered only
    /// while spawning is still possible at this depth.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions = self.tools.definitions();
        if self.can_spawn() && !self.tools.contains(SPAWN_SUBAGENT_TOOL) {
            definitions.push(spawn_subagent_definition());
        }
        definitions
    }

    /// Run the planner loop on `input` for at most `max_iterations`
    /// Plan/Dispatch cycles.
    pub async fn run(
        &mut self,
        input: &str,
        max_iterations: usize,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        self.conversation.push(Message::user(input));
        let definitions = self.tool_definitions();
        let mut calls_used = 0usize;

        info!(
            session_id = %self.session_id,
            role = %self.role,
            depth = self.depth,
            max_iterations,
            "Agent run started"
        );

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            self.emit(AgentEvent::ThinkingStarted {
                session_id: self.session_id.clone(),
                iteration,
            });
            let response = self.plan(&definitions, cancel).await?;

            let (content, mut calls) = match response {
                ProviderResponse::Final { content } => (content, Vec::new()),
                ProviderResponse::ToolCalls { content, calls } => {
                    (content.unwrap_or_default(), calls)
                }
            };
            let (content, thinking) = self.extract_thinking(content);

            if calls.is_empty() {
                self.conversation
                    .push(Message::assistant(content.clone()).with_thinking(thinking));
                self.emit(AgentEvent::TurnComplete {
                    session_id: self.session_id.clone(),
                    iteration,
                });
                self.persist().await;
                return Ok(self.finish(OutcomeStatus::Completed, content, iteration, calls_used));
            }

            for call in &mut calls {
                if call.id.is_empty() {
                    call.id = ToolCall::new(call.name.clone(), serde_json::Map::new()).id;
                }
                call.iteration = iteration;
                self.emit(AgentEvent::ToolCallIssued {
                    session_id: self.session_id.clone(),
                    call: call.clone(),
                });
            }

            debug!(session_id = %self.session_id, iteration, calls = calls.len(), "Dispatching tool batch");
            let results = self.dispatch_batch(&calls, &mut calls_used, cancel).await?;

            let assistant = Message::assistant_with_calls(content, calls).with_thinking(thinking);
            let tool_messages: Vec<Message> = results.iter().map(Message::tool_result).collect();
            self.conversation
                .extend(std::iter::once(assistant).chain(tool_messages));

            self.emit(AgentEvent::TurnComplete {
                session_id: self.session_id.clone(),
                iteration,
            });
        }

        let message = format!(
            "Stopped after {max_iterations} iterations without reaching a final answer."
        );
        warn!(session_id = %self.session_id, max_iterations, "Iteration limit reached");
        self.persist().await;
        Ok(self.finish(
            OutcomeStatus::IterationLimit,
            message,
            max_iterations,
            calls_used,
        ))
    }

    fn finish(
        &self,
        status: OutcomeStatus,
        content: String,
        iterations: usize,
        tool_calls: usize,
    ) -> RunOutcome {
        info!(session_id = %self.session_id, ?status, iterations, tool_calls, "Agent run finished");
        self.emit(AgentEvent::RunFinished {
            session_id: self.session_id.clone(),
            status,
            iterations,
        });
        RunOutcome {
            status,
            content,
            iterations,
            tool_calls,
        }
    }

    /// Save the history window of a top-level conversation. Subagent
    /// conversations live only as long as their run. Failures are logged.
    async fn persist(&self) {
        if self.depth > 0 || !self.ctx.persist_sessions() {
            return;
        }

        let payloads: Vec<String> = match self
            .conversation
            .messages()
            .map(serde_json::to_string)
            .collect::<Result<_, _>>()
        {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to encode session history");
                return;
            }
        };
        let messages: Vec<NewSessionMessage<'_>> = self
            .conversation
            .messages()
            .zip(&payloads)
            .map(|(message, payload)| NewSessionMessage {
                role: message.role.as_str(),
                content: &message.content,
                payload,
            })
            .collect();

        let session = NewSession {
            id: &self.session_id,
            persona: &self.persona,
            role: &self.role,
        };
        match self.ctx.database().save_session(&session, &messages).await {
            Ok(record) => {
                debug!(session_id = %self.session_id, messages = record.message_count, "Session saved");
            }
            Err(e) => warn!(session_id = %self.session_id, error = %e, "Failed to save session"),
        }
    }

    /// Plan step: one provider call, bounded by the provider timeout and
    /// abandoned on cancellation.
    async fn plan(
        &self,
        definitions: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse, AgentError> {
        let timeout = self.ctx.agent_config().provider_timeout();
        let messages = self.conversation.snapshot();
        let generate = self
            .provider
            .generate(&messages, definitions, &self.generation);

        tokio::select! {
            result = tokio::time::timeout(timeout, generate) => match result {
                Ok(response) => Ok(response?),
                Err(_) => Err(ProviderError::Timeout(timeout).into()),
            },
            () = cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }

    /// Split `<thought>` segments out of the reply when thinking is enabled.
    fn extract_thinking(&self, content: String) -> (String, Option<String>) {
        if !self.ctx.agent_config().enable_thinking || !content.contains("<thought>") {
            return (content, None);
        }

        let thoughts: Vec<String> = THOUGHT_RE
            .captures_iter(&content)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if thoughts.is_empty() {
            return (content, None);
        }

        for thought in &thoughts {
            self.emit(AgentEvent::Thought {
                session_id: self.session_id.clone(),
                content: thought.clone(),
            });
        }
        let stripped = THOUGHT_RE.replace_all(&content, "").trim().to_string();
        (stripped, Some(thoughts.join("\n\n")))
    }

    /// Whether `call` is handled as a subagent spawn rather than a
    /// registered tool.
    fn routes_to_spawn(&self, call: &ToolCall) -> bool {
        call.name == SPAWN_SUBAGENT_TOOL && !self.tools.contains(SPAWN_SUBAGENT_TOOL)
    }

    /// Dispatch step: every call runs concurrently; results come back in
    /// issuance order. On cancellation the batch is dropped and every
    /// subagent it submitted is cancelled.
    ///
    /// A subagent whose batch spawns further subagents lends its execution
    /// slot to them for the duration of the batch.
    async fn dispatch_batch(
        &self,
        calls: &[ToolCall],
        calls_used: &mut usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolResult>, AgentError> {
        let limit = self.ctx.agent_config().max_tool_calls_per_turn;
        let spawned = Mutex::new(Vec::<String>::new());
        let spawned_ref = &spawned;

        let lends_slot =
            self.depth > 0 && self.can_spawn() && calls.iter().any(|c| self.routes_to_spawn(c));
        let lent = lends_slot && self.ctx.manager().release_slot(&self.session_id).await;

        let batch = join_all(calls.iter().map(|call| {
            let over_limit = limit > 0 && *calls_used >= limit;
            if !over_limit {
                *calls_used += 1;
            }
            async move {
                let started = Instant::now();
                let result = if over_limit {
                    ToolResult::failed(
                        call,
                        ToolFailure::CallLimitExceeded { limit },
                        started.elapsed(),
                    )
                } else {
                    self.dispatch_one(call, spawned_ref).await
                };
                self.record(&result).await;
                result
            }
        }));

        tokio::select! {
            results = batch => {
                if lent && let Err(e) = self.ctx.manager().reclaim_slot(&self.session_id).await {
                    warn!(session_id = %self.session_id, error = %e, "Failed to reclaim execution slot");
                }
                Ok(results)
            }
            () = cancel.cancelled() => {
                let run_ids = std::mem::take(
                    &mut *spawned.lock().unwrap_or_else(PoisonError::into_inner),
                );
                for run_id in run_ids {
                    match self.ctx.manager().cancel(&run_id, "cancelled").await {
                        Ok(_) | Err(ManagerError::NotFound { .. }) => {}
                        Err(e) => warn!(run_id = %run_id, error = %e, "Failed to cancel subagent run"),
                    }
                }
                info!(session_id = %self.session_id, "Agent run cancelled during dispatch");
                Err(AgentError::Cancelled)
            }
        }
    }

    /// Gate check, then route to a subagent spawn or a registered tool.
    async fn dispatch_one(&self, call: &ToolCall, spawned: &Mutex<Vec<String>>) -> ToolResult {
        let started = Instant::now();

        let decision = self.ctx.policy().evaluate(&self.role, &call.name);
        if !decision.allowed {
            return ToolResult::failed(
                call,
                ToolFailure::AuthorizationDenied {
                    role: self.role.clone(),
                    tool: call.name.clone(),
                },
                started.elapsed(),
            );
        }

        let outcome = if self.routes_to_spawn(call) {
            self.spawn_subagent(call, spawned).await
        } else {
            self.execute_tool(call).await
        };

        match outcome {
            Ok(output) => ToolResult::ok(call, output, started.elapsed()),
            Err(failure) => ToolResult::failed(call, failure, started.elapsed()),
        }
    }

    async fn execute_tool(&self, call: &ToolCall) -> Result<serde_json::Value, ToolFailure> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolFailure::UnknownTool(call.name.clone()))?;
        check_required_arguments(&tool.parameters(), &call.arguments)
            .map_err(ToolFailure::InvalidArguments)?;

        let timeout = self.ctx.agent_config().tool_timeout();
        match tokio::time::timeout(timeout, tool.execute(&call.arguments)).await {
            Ok(ToolOutput::Success(value)) => Ok(value),
            Ok(ToolOutput::Error(message)) => Err(ToolFailure::Execution(message)),
            Err(_) => Err(ToolFailure::Timeout(timeout)),
        }
    }

    /// Submit a child run and wait for it. Time spent queued for a slot is
    /// not counted; once admitted, the wait is bounded by the subagent
    /// timeout plus the stop grace period, after which the run is cancelled.
    async fn spawn_subagent(
        &self,
        call: &ToolCall,
        spawned: &Mutex<Vec<String>>,
    ) -> Result<serde_json::Value, ToolFailure> {
        let config = self.ctx.agent_config();
        if !self.can_spawn() {
            return Err(ToolFailure::SpawnDepthExceeded {
                max_depth: config.max_spawn_depth,
            });
        }
        let args = SpawnArgs::parse(call)?;
        let manager = self.ctx.manager();

        // Registered before submitting so a cancelled batch can find it.
        let run_id = uuid::Uuid::new_v4().to_string();
        spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(run_id.clone());

        let task = self.child_spec().into_task(run_id.clone(), args.task.clone());
        let request = SubagentRequest {
            id: Some(run_id.clone()),
            parent_session_id: self.session_id.clone(),
            label: args.label.clone(),
            task_description: args.task,
            timeout: None,
        };
        manager
            .submit(request, task)
            .await
            .map_err(|e| ToolFailure::Execution(format!("failed to spawn subagent: {e}")))?;

        let waited = config.subagent_timeout();
        manager
            .await_admission(&run_id)
            .await
            .map_err(|e| ToolFailure::Execution(e.to_string()))?;
        match manager.await_result(&run_id, waited + config.stop_grace()).await {
            Ok(run) if run.status == RegistryStatus::Completed => {
                Ok(completed_output(&run_id, &args.label, run.result))
            }
            Ok(run) if run.timed_out() => Err(ToolFailure::SubagentTimeout { run_id, waited }),
            Ok(run) => Err(ToolFailure::SubagentFailed {
                run_id,
                message: run.error.unwrap_or_else(|| format!("ended as {}", run.status)),
            }),
            Err(ManagerError::WaitTimeout { .. }) => {
                if let Err(e) = manager.cancel(&run_id, "parent stopped waiting").await {
                    warn!(run_id = %run_id, error = %e, "Failed to cancel abandoned subagent");
                }
                Err(ToolFailure::SubagentTimeout { run_id, waited })
            }
            Err(e) => Err(ToolFailure::Execution(e.to_string())),
        }
    }

    fn child_spec(&self) -> ChildSpec {
        ChildSpec {
            ctx: Arc::clone(&self.ctx),
            provider: Arc::clone(&self.provider),
            tools: Arc::clone(&self.tools),
            generation: self.generation.clone(),
            role: self.role.clone(),
            depth: self.depth + 1,
        }
    }

    /// Audit and announce a finished call.
    async fn record(&self, result: &ToolResult) {
        let detail = result.error.as_ref().map(ToString::to_string);
        if let Some(failure) = &result.error {
            debug!(
                session_id = %self.session_id,
                tool = %result.tool_name,
                kind = failure.kind(),
                error = %failure,
                "Tool call failed"
            );
        }
        self.ctx
            .audit(&NewAuditEvent {
                session_id: &self.session_id,
                role: &self.role,
                tool_name: &result.tool_name,
                call_id: &result.call_id,
                success: result.success,
                failure_kind: result.error.as_ref().map(ToolFailure::kind),
                detail: detail.as_deref(),
                duration_ms: result.duration_ms(),
            })
            .await;
        self.emit(AgentEvent::ToolResultReceived {
            session_id: self.session_id.clone(),
            result: result.clone(),
        });
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
