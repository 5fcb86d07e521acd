#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for the planner loop.
//!
//! Each test wires a scripted provider and in-process tools into an
//! `AgentExecutor` over an in-memory registry, then checks the conversation,
//! the run registry and the audit log.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use planloop_core::Config;
use planloop_runtime::agent::{
    AgentError, AgentEvent, AgentExecutor, CompletionProvider, GenerationConfig, Message,
    OutcomeStatus, PersonaCatalog, ProviderError, ProviderResponse, Role, RuntimeContext,
    SPAWN_SUBAGENT_TOOL, Tool, ToolCall, ToolDefinition, ToolOutput, ToolRegistry,
    estimate_message_tokens,
};
use planloop_runtime::orchestration::RunEvent;
use planloop_runtime::storage::{Database, RunStatus};

// ---------------------------------------------------------------------------
// Scripted provider and test tools
// ---------------------------------------------------------------------------

type Script =
    dyn Fn(&[Message], &[ToolDefinition]) -> Result<ProviderResponse, ProviderError> + Send + Sync;

struct ScriptedProvider {
    calls: AtomicUsize,
    script: Box<Script>,
}

impl ScriptedProvider {
    fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&[Message], &[ToolDefinition]) -> Result<ProviderResponse, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        _config: &GenerationConfig,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(messages, tools)
    }
}

/// Counts invocations and answers with a fixed text.
struct CountingTool {
    name: &'static str,
    hits: AtomicUsize,
}

impl CountingTool {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            hits: AtomicUsize::new(0),
        })
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Counts calls"
    }

    async fn execute(&self, _arguments: &Map<String, Value>) -> ToolOutput {
        self.hits.fetch_add(1, Ordering::SeqCst);
        ToolOutput::text(format!("{} ran", self.name))
    }
}

/// Sleeps `ms`, then records `tag` in completion order.
struct SleepTool {
    finished: Mutex<Vec<String>>,
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps, then echoes its tag"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"ms": {"type": "integer"}, "tag": {"type": "string"}},
            "required": ["ms", "tag"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> ToolOutput {
        let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
        let tag = arguments
            .get("tag")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.finished.lock().unwrap().push(tag.clone());
        ToolOutput::text(tag)
    }
}

/// Never returns.
struct BlockTool;

#[async_trait]
impl Tool for BlockTool {
    fn name(&self) -> &str {
        "block"
    }

    fn description(&self) -> &str {
        "Blocks forever"
    }

    async fn execute(&self, _arguments: &Map<String, Value>) -> ToolOutput {
        futures::future::pending::<()>().await;
        ToolOutput::text("unreachable")
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn context(config: &Config) -> Arc<RuntimeContext> {
    let db = Database::open_in_memory().await.unwrap();
    Arc::new(RuntimeContext::new(config, db).await.unwrap())
}

fn registry(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolRegistry> {
    Arc::new(ToolRegistry::new(tools))
}

fn tool_messages(messages: &[Message]) -> Vec<&Message> {
    messages.iter().filter(|m| m.role == Role::Tool).collect()
}

fn last_user(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn offers_spawn(tools: &[ToolDefinition]) -> bool {
    tools.iter().any(|t| t.name == SPAWN_SUBAGENT_TOOL)
}

fn call(name: &str, id: &str, arguments: Value) -> ToolCall {
    ToolCall::from_json(name, arguments).with_id(id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_batch_results_follow_issuance_order() {
    let ctx = context(&Config::default()).await;
    let sleep = Arc::new(SleepTool {
        finished: Mutex::new(Vec::new()),
    });
    let provider = ScriptedProvider::new(|messages, _| {
        if tool_messages(messages).is_empty() {
            Ok(ProviderResponse::calls(vec![
                call("sleep", "a", json!({"ms": 60, "tag": "a"})),
                call("sleep", "b", json!({"ms": 120, "tag": "b"})),
                call("sleep", "c", json!({"ms": 0, "tag": "c"})),
            ]))
        } else {
            Ok(ProviderResponse::text("done"))
        }
    });

    let mut executor = AgentExecutor::new(ctx, provider, registry(vec![sleep.clone() as Arc<dyn Tool>]));
    let outcome = executor
        .run("run three sleeps", 5, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(*sleep.finished.lock().unwrap(), vec!["c", "a", "b"]);

    let history: Vec<Message> = executor.conversation().messages().cloned().collect();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Tool,
            Role::Tool,
            Role::Assistant
        ]
    );
    let ids: Vec<&str> = tool_messages(&history)
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    let contents: Vec<&str> = tool_messages(&history)
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_iteration_cap_is_exact() {
    let ctx = context(&Config::default()).await;
    let echo = CountingTool::new("echo");
    let provider = ScriptedProvider::new(|_, _| {
        Ok(ProviderResponse::calls(vec![ToolCall::from_json(
            "echo",
            json!({}),
        )]))
    });

    let mut executor = AgentExecutor::new(ctx, provider.clone(), registry(vec![echo.clone() as Arc<dyn Tool>]));
    let outcome = executor
        .run("loop forever", 3, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::IterationLimit);
    assert_eq!(outcome.iterations, 3);
    assert!(outcome.content.contains("3 iterations"));
    assert_eq!(provider.calls(), 3);
    assert_eq!(echo.hits(), 3);
}

#[tokio::test]
async fn test_guest_denied_shell_then_replans() {
    let mut config = Config::default();
    config.security.enabled = true;
    config.security.default_role = "guest".to_string();
    let ctx = context(&config).await;

    let shell = CountingTool::new("shell_execute");
    let search = CountingTool::new("web_search");
    let provider = ScriptedProvider::new(|messages, _| {
        let results = tool_messages(messages);
        match results.len() {
            0 => Ok(ProviderResponse::calls(vec![call(
                "shell_execute",
                "sh",
                json!({"command": "ls"}),
            )])),
            1 => {
                assert!(results[0].content.starts_with("Error: role 'guest'"));
                Ok(ProviderResponse::calls(vec![call(
                    "web_search",
                    "ws",
                    json!({"query": "ls alternatives"}),
                )]))
            }
            _ => Ok(ProviderResponse::text("summary from search")),
        }
    });

    let mut executor = AgentExecutor::new(
        Arc::clone(&ctx),
        provider,
        registry(vec![
            shell.clone() as Arc<dyn Tool>,
            search.clone() as Arc<dyn Tool>,
        ]),
    );
    assert_eq!(executor.role(), "guest");
    let outcome = executor
        .run("list files", 5, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(outcome.content, "summary from search");
    assert_eq!(outcome.iterations, 3);
    assert_eq!(shell.hits(), 0, "denied tool must never execute");
    assert_eq!(search.hits(), 1);

    let audit = ctx
        .database()
        .list_audit_events(Some(executor.session_id()), 10)
        .await
        .unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].tool_name, "shell_execute");
    assert!(!audit[0].success);
    assert_eq!(audit[0].failure_kind.as_deref(), Some("authorization_denied"));
    assert_eq!(audit[0].role, "guest");
    assert_eq!(audit[1].tool_name, "web_search");
    assert!(audit[1].success);
}

#[tokio::test]
async fn test_spawned_subagents_share_one_slot() {
    let mut config = Config::default();
    config.agent.max_concurrent_subagents = 1;
    let ctx = context(&config).await;

    let provider = ScriptedProvider::new(|messages, tools| {
        if !offers_spawn(tools) {
            return Ok(ProviderResponse::text(format!(
                "result:{}",
                last_user(messages)
            )));
        }
        let results = tool_messages(messages);
        if results.is_empty() {
            let calls = ["alpha", "beta", "gamma"]
                .iter()
                .map(|task| {
                    call(
                        SPAWN_SUBAGENT_TOOL,
                        task,
                        json!({"task": task, "label": task}),
                    )
                })
                .collect();
            Ok(ProviderResponse::calls(calls))
        } else {
            let joined: Vec<&str> = results.iter().map(|m| m.content.as_str()).collect();
            Ok(ProviderResponse::text(joined.join("\n")))
        }
    });

    let mut executor = AgentExecutor::new(Arc::clone(&ctx), provider, registry(Vec::new()));
    let outcome = executor
        .run("research three topics", 5, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    for task in ["alpha", "beta", "gamma"] {
        assert!(outcome.content.contains(&format!("result:{task}")));
    }

    let runs = ctx
        .database()
        .list_runs_for_parent(executor.session_id())
        .await
        .unwrap();
    let labels: Vec<&str> = runs.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(labels, vec!["alpha", "beta", "gamma"]);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
    assert_eq!(runs[0].result.as_deref(), Some("result:alpha"));

    let mut by_start = runs.clone();
    by_start.sort_by_key(|r| r.started_at);
    for pair in by_start.windows(2) {
        assert!(
            pair[0].ended_at.unwrap() <= pair[1].started_at.unwrap(),
            "runs overlapped with a single slot"
        );
    }
}

#[tokio::test]
async fn test_failed_subagent_is_reported_as_tool_error() {
    let ctx = context(&Config::default()).await;
    let provider = ScriptedProvider::new(|messages, tools| {
        if !offers_spawn(tools) {
            return Err(ProviderError::Rejected("bad prompt".to_string()));
        }
        let results = tool_messages(messages);
        if results.is_empty() {
            Ok(ProviderResponse::calls(vec![call(
                SPAWN_SUBAGENT_TOOL,
                "s",
                json!({"task": "doomed"}),
            )]))
        } else {
            Ok(ProviderResponse::text(results[0].content.clone()))
        }
    });

    let mut executor = AgentExecutor::new(ctx, provider, registry(Vec::new()));
    let outcome = executor
        .run("delegate", 5, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert!(outcome.content.starts_with("Error: subagent "));
    assert!(outcome.content.contains("bad prompt"));
}

#[tokio::test]
async fn test_cancellation_mid_batch_appends_nothing() {
    let ctx = context(&Config::default()).await;
    let mut run_events = ctx.manager().subscribe();

    let provider = ScriptedProvider::new(|_, tools| {
        if offers_spawn(tools) {
            Ok(ProviderResponse::calls(vec![
                call("block", "blk", json!({})),
                call(SPAWN_SUBAGENT_TOOL, "sp", json!({"task": "wait around"})),
            ]))
        } else {
            Ok(ProviderResponse::calls(vec![call("block", "child", json!({}))]))
        }
    });

    let executor = AgentExecutor::new(Arc::clone(&ctx), provider, registry(vec![Arc::new(BlockTool) as Arc<dyn Tool>]));
    let session_id = executor.session_id().to_string();
    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move {
        let mut executor = executor;
        let result = executor.run("do two things", 5, &run_token).await;
        (executor, result)
    });

    let run_id = loop {
        if let RunEvent::Started { run_id } = run_events.recv().await.unwrap() {
            break run_id;
        }
    };
    token.cancel();

    let (executor, result) = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AgentError::Cancelled)));

    let history: Vec<&Message> = executor.conversation().messages().collect();
    assert_eq!(history.len(), 1, "only the user message may remain");
    assert_eq!(history[0].role, Role::User);

    let run = ctx
        .manager()
        .await_result(&run_id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.parent_session_id, session_id);
}

#[tokio::test]
async fn test_call_limit_applies_within_a_batch() {
    let mut config = Config::default();
    config.agent.max_tool_calls_per_turn = 2;
    let ctx = context(&config).await;
    let echo = CountingTool::new("echo");

    let provider = ScriptedProvider::new(|messages, _| {
        if tool_messages(messages).is_empty() {
            Ok(ProviderResponse::calls(vec![
                call("echo", "x", json!({})),
                call("echo", "y", json!({})),
                call("echo", "z", json!({})),
            ]))
        } else {
            Ok(ProviderResponse::text("ok"))
        }
    });

    let mut executor = AgentExecutor::new(ctx, provider, registry(vec![echo.clone() as Arc<dyn Tool>]));
    let outcome = executor
        .run("echo thrice", 5, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(outcome.tool_calls, 2);
    assert_eq!(echo.hits(), 2);

    let history: Vec<Message> = executor.conversation().messages().cloned().collect();
    let results = tool_messages(&history);
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].content, "echo ran");
    assert!(results[2].content.contains("tool call limit of 2"));
}

#[tokio::test]
async fn test_bad_calls_become_failed_results() {
    let ctx = context(&Config::default()).await;
    let sleep = Arc::new(SleepTool {
        finished: Mutex::new(Vec::new()),
    });
    let provider = ScriptedProvider::new(|messages, _| {
        let results = tool_messages(messages);
        if results.is_empty() {
            Ok(ProviderResponse::calls(vec![
                call("nope", "n", json!({})),
                call("sleep", "s", json!({"tag": "missing ms"})),
            ]))
        } else {
            let joined: Vec<&str> = results.iter().map(|m| m.content.as_str()).collect();
            Ok(ProviderResponse::text(joined.join("|")))
        }
    });

    let mut executor = AgentExecutor::new(ctx, provider, registry(vec![sleep.clone() as Arc<dyn Tool>]));
    let outcome = executor
        .run("misbehave", 5, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(
        outcome.content,
        "Error: unknown tool 'nope'|Error: invalid arguments: missing required argument(s): ms"
    );
    assert!(sleep.finished.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_thinking_is_extracted() {
    let mut config = Config::default();
    config.agent.enable_thinking = true;
    let ctx = context(&config).await;
    let provider = ScriptedProvider::new(|_, _| {
        Ok(ProviderResponse::text(
            "<thought>check the arithmetic</thought>The answer is 4.",
        ))
    });

    let mut executor = AgentExecutor::new(ctx, provider, registry(Vec::new()));
    let mut events = executor.subscribe();
    let outcome = executor
        .run("what is 2 + 2?", 2, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.content, "The answer is 4.");
    let last = executor.conversation().last().unwrap();
    assert_eq!(last.thinking.as_deref(), Some("check the arithmetic"));

    let mut thoughts = Vec::new();
    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            AgentEvent::Thought { content, .. } => thoughts.push(content),
            AgentEvent::RunFinished { status, .. } => {
                assert_eq!(status, OutcomeStatus::Completed);
                finished = true;
            }
            _ => {}
        }
    }
    assert_eq!(thoughts, vec!["check the arithmetic"]);
    assert!(finished);
}

#[tokio::test]
async fn test_spawn_refused_at_max_depth() {
    let mut config = Config::default();
    config.agent.max_spawn_depth = 0;
    let ctx = context(&config).await;

    let provider = ScriptedProvider::new(|messages, tools| {
        assert!(!offers_spawn(tools), "spawn must not be offered at max depth");
        let results = tool_messages(messages);
        if results.is_empty() {
            Ok(ProviderResponse::calls(vec![call(
                SPAWN_SUBAGENT_TOOL,
                "sp",
                json!({"task": "go deeper"}),
            )]))
        } else {
            Ok(ProviderResponse::text(results[0].content.clone()))
        }
    });

    let mut executor = AgentExecutor::new(Arc::clone(&ctx), provider, registry(Vec::new()));
    let outcome = executor
        .run("try to spawn", 3, &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.content.contains("cannot spawn beyond depth 0"));
    let runs = ctx
        .database()
        .list_runs_for_parent(executor.session_id())
        .await
        .unwrap();
    assert!(runs.is_empty());
}

#[tokio::test]
async fn test_subagent_deadline_is_audited_as_timeout() {
    let mut config = Config::default();
    config.agent.subagent_timeout_secs = 1;
    config.agent.stop_grace_ms = 50;
    let ctx = context(&config).await;

    let provider = ScriptedProvider::new(|messages, tools| {
        if !offers_spawn(tools) {
            return Ok(ProviderResponse::calls(vec![call("block", "stall", json!({}))]));
        }
        let results = tool_messages(messages);
        if results.is_empty() {
            Ok(ProviderResponse::calls(vec![call(
                SPAWN_SUBAGENT_TOOL,
                "sp",
                json!({"task": "never finishes", "label": "stuck"}),
            )]))
        } else {
            Ok(ProviderResponse::text(results[0].content.clone()))
        }
    });

    let mut executor = AgentExecutor::new(
        Arc::clone(&ctx),
        provider,
        registry(vec![Arc::new(BlockTool) as Arc<dyn Tool>]),
    );
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        executor.run("delegate a stuck task", 3, &CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert!(outcome.content.contains("did not finish within 1s"), "{}", outcome.content);

    let audit = ctx
        .database()
        .list_audit_events(Some(executor.session_id()), 10)
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].tool_name, SPAWN_SUBAGENT_TOOL);
    assert_eq!(audit[0].failure_kind.as_deref(), Some("subagent_timeout"));

    let runs = ctx
        .database()
        .list_runs_for_parent(executor.session_id())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].timed_out());
}

#[tokio::test]
async fn test_nested_spawns_complete_with_one_slot() {
    let mut config = Config::default();
    config.agent.max_concurrent_subagents = 1;
    config.agent.max_spawn_depth = 2;
    config.agent.subagent_timeout_secs = 5;
    let ctx = context(&config).await;

    let provider = ScriptedProvider::new(|messages, _| {
        let task = last_user(messages);
        let results = tool_messages(messages);
        if task == "leaf" {
            return Ok(ProviderResponse::text("leaf done"));
        }
        if !results.is_empty() {
            return Ok(ProviderResponse::text(results[0].content.clone()));
        }
        let next = if task == "top" { "middle" } else { "leaf" };
        Ok(ProviderResponse::calls(vec![call(
            SPAWN_SUBAGENT_TOOL,
            next,
            json!({"task": next, "label": next}),
        )]))
    });

    let mut executor = AgentExecutor::new(Arc::clone(&ctx), provider, registry(Vec::new()));
    let outcome = tokio::time::timeout(
        Duration::from_secs(4),
        executor.run("top", 3, &CancellationToken::new()),
    )
    .await
    .unwrap_or_else(|_| panic!("nested spawn waited on a slot its parent holds"))
    .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert!(outcome.content.contains("leaf done"), "{}", outcome.content);

    let middle = ctx
        .database()
        .list_runs_for_parent(executor.session_id())
        .await
        .unwrap();
    assert_eq!(middle.len(), 1);
    assert_eq!(middle[0].status, RunStatus::Completed);
    let leaf = ctx.database().list_runs_for_parent(&middle[0].id).await.unwrap();
    assert_eq!(leaf.len(), 1);
    assert_eq!(leaf[0].result.as_deref(), Some("leaf done"));

    // Only the top-level conversation is saved.
    let sessions = ctx.database().list_sessions(10).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, executor.session_id());
}

#[tokio::test]
async fn test_saved_session_resumes_with_history() {
    let ctx = context(&Config::default()).await;
    let provider = ScriptedProvider::new(|messages, _| {
        let asked = last_user(messages);
        if asked == "what did I ask first?" {
            let first = messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ProviderResponse::text(format!("you asked: {first}")))
        } else {
            Ok(ProviderResponse::text("noted"))
        }
    });

    let mut first = AgentExecutor::new(Arc::clone(&ctx), provider.clone(), registry(Vec::new()))
        .with_role("admin");
    first
        .run("remember the number 7", 3, &CancellationToken::new())
        .await
        .unwrap();
    let session_id = first.session_id().to_string();
    drop(first);

    let saved = ctx.database().get_session(&session_id).await.unwrap();
    assert_eq!(saved.message_count, 2);
    assert_eq!(saved.role, "admin");

    let mut resumed =
        AgentExecutor::resume(Arc::clone(&ctx), provider, registry(Vec::new()), &session_id)
            .await
            .unwrap();
    assert_eq!(resumed.session_id(), session_id);
    assert_eq!(resumed.role(), "admin");
    assert_eq!(resumed.conversation().len(), 2);

    let outcome = resumed
        .run("what did I ask first?", 3, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.content, "you asked: remember the number 7");
    assert_eq!(
        ctx.database().get_session(&session_id).await.unwrap().message_count,
        4
    );

    let unused = ScriptedProvider::new(|_, _| Ok(ProviderResponse::text("unused")));
    let missing = AgentExecutor::resume(ctx, unused, registry(Vec::new()), "no-such-session").await;
    assert!(matches!(missing, Err(AgentError::Storage(_))));
}

#[tokio::test]
async fn test_token_budget_drops_oldest_turns() {
    let system = PersonaCatalog::builtin()
        .get("default")
        .unwrap()
        .system_prompt
        .clone();
    let mut config = Config::default();
    config.agent.max_history_messages = 100;
    // Room for two 40-char questions (14 tokens each) and two short answers.
    config.agent.max_history_tokens = estimate_message_tokens(&Message::system(system)) + 40;
    config.storage.persist_sessions = false;
    let ctx = context(&config).await;

    let first_question = format!("q1{}", "x".repeat(38));
    let seen_first = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&seen_first);
    let first_text = first_question.clone();
    let provider = ScriptedProvider::new(move |messages, _| {
        seen.lock()
            .unwrap()
            .push(messages.iter().any(|m| m.content == first_text));
        Ok(ProviderResponse::text("ok"))
    });

    let mut executor = AgentExecutor::new(Arc::clone(&ctx), provider, registry(Vec::new()));
    for question in [
        first_question.clone(),
        format!("q2{}", "x".repeat(38)),
        format!("q3{}", "x".repeat(38)),
    ] {
        executor
            .run(&question, 2, &CancellationToken::new())
            .await
            .unwrap();
    }

    assert_eq!(*seen_first.lock().unwrap(), vec![true, true, false]);
    assert!(executor.conversation().estimated_tokens() <= config.agent.max_history_tokens);
    assert!(ctx.database().list_sessions(10).await.unwrap().is_empty());
}
