// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent dispatcher: bounded, persona-typed child agent loops exposed
//! to the model as `run_subagent` and `run_parallel_subagents`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use ledit_events::EventBus;
use ledit_model::{PricingTable, ProviderClient};
use ledit_tools::{
    register_builtin, Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolRegistry,
    ToolResult,
};

use crate::agent::{AgentLoop, LoopDeps};
use crate::prompts::persona_prompt;
use crate::state::RunStateStore;

/// Recursion ceiling, enforced only here: a child may spawn grandchildren,
/// grandchildren may not go deeper.
const MAX_DEPTH: usize = 2;

/// Concurrency bound for `run_parallel_subagents`.
const MAX_PARALLEL: usize = 4;

/// Default iteration cap for children; a focused sub-task should not need
/// the parent's full allowance.
const CHILD_ITERATIONS: u32 = 10;

pub struct SubAgentDispatcher {
    client: Arc<ProviderClient>,
    pricing: Arc<PricingTable>,
    config: Arc<ledit_config::Config>,
    bus: EventBus,
    workspace_root: PathBuf,
    exec_ctx: ExecContext,
    state_dir: PathBuf,
    depth: Arc<AtomicUsize>,
}

impl SubAgentDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ProviderClient>,
        pricing: Arc<PricingTable>,
        config: Arc<ledit_config::Config>,
        bus: EventBus,
        workspace_root: PathBuf,
        exec_ctx: ExecContext,
        control: &ledit_config::ControlDir,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            pricing,
            config,
            bus,
            workspace_root,
            exec_ctx,
            state_dir: control.root().join("subagents"),
            depth: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Register both sub-agent tools on a registry.  A disabled feature flag
    /// is still enforced at spawn time, so tools registered before a config
    /// reload cannot bypass it.
    pub fn register_tools(self: &Arc<Self>, registry: &mut ToolRegistry) {
        registry.register(RunSubagentTool {
            dispatcher: Arc::clone(self),
        });
        registry.register(RunParallelSubagentsTool {
            dispatcher: Arc::clone(self),
        });
    }

    /// Run one child loop to completion and return its report.
    pub async fn spawn(
        &self,
        persona: &str,
        task: &str,
        max_iterations: Option<u32>,
    ) -> Result<String, (ErrorKind, String)> {
        if !self.config.agent.subagents_enabled {
            return Err((
                ErrorKind::Permission,
                "sub-agents are disabled (LEDIT_NO_SUBAGENTS or agent.subagents_enabled)".into(),
            ));
        }
        let Some(persona_text) = persona_prompt(persona) else {
            return Err((
                ErrorKind::InvalidArgs,
                format!("unknown persona '{persona}'; use coder, tester, reviewer, debugger or researcher"),
            ));
        };

        let current = self.depth.load(Ordering::Relaxed);
        if current >= MAX_DEPTH {
            return Err((
                ErrorKind::Permission,
                format!("sub-agent depth cap ({MAX_DEPTH}) reached"),
            ));
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(persona, depth = current + 1, "spawning sub-agent");

        let result = self.run_child(persona_text, task, max_iterations).await;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn run_child(
        &self,
        persona_text: &str,
        task: &str,
        max_iterations: Option<u32>,
    ) -> Result<String, (ErrorKind, String)> {
        // Children get their own (smaller) budgets and iteration caps.
        let mut config = (*self.config).clone();
        config.agent.max_iterations = max_iterations.unwrap_or(CHILD_ITERATIONS);
        config.budgets.token_cap = (config.budgets.token_cap / 4).max(10_000);
        config.budgets.cost_cap_usd = (config.budgets.cost_cap_usd / 4.0).max(0.1);
        config.budgets.time_cap_secs = (config.budgets.time_cap_secs / 4).max(60);
        let config = Arc::new(config);

        let mut registry = ToolRegistry::new(&config.tools);
        register_builtin(&mut registry);
        // Grandchildren share this dispatcher, so the depth counter is the
        // single enforcement point.
        let self_arc = Arc::new(self.shallow_clone());
        self_arc.register_tools(&mut registry);
        let registry = Arc::new(registry.with_dry_run(config.agent.dry_run));

        if let Err(e) = std::fs::create_dir_all(&self.state_dir) {
            return Err((ErrorKind::Internal, format!("state dir: {e}")));
        }
        let child_cancel = self.exec_ctx.cancel.child_token();
        let deps = LoopDeps {
            client: Arc::clone(&self.client),
            registry,
            bus: self.bus.clone(),
            pricing: Arc::clone(&self.pricing),
            store: RunStateStore::at_path(
                self.state_dir
                    .join(format!("{}.json", uuid::Uuid::new_v4())),
            ),
            config,
            workspace_root: self.workspace_root.clone(),
            cancel: child_cancel.clone(),
            exec_ctx: self.exec_ctx.clone().with_cancel(child_cancel),
        };

        let child = AgentLoop::new_with_persona(task, Some(persona_text), deps);
        let (state, summary) = child.run().await;

        let last_text = state
            .conversation
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ledit_model::Role::Assistant)
            .and_then(|m| m.as_text())
            .unwrap_or("")
            .to_string();

        Ok(format!(
            "sub-agent finished: {:?}\n{}\n{}",
            summary.reason,
            last_text,
            summary.render()
        ))
    }

    /// Clone sharing the depth counter and all backend handles.
    fn shallow_clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            pricing: Arc::clone(&self.pricing),
            config: Arc::clone(&self.config),
            bus: self.bus.clone(),
            workspace_root: self.workspace_root.clone(),
            exec_ctx: self.exec_ctx.clone(),
            state_dir: self.state_dir.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

/// `run_subagent` tool surface.
pub struct RunSubagentTool {
    dispatcher: Arc<SubAgentDispatcher>,
}

#[async_trait]
impl Tool for RunSubagentTool {
    fn name(&self) -> &str {
        "run_subagent"
    }

    fn description(&self) -> &str {
        "Spawn a persona-typed child agent with its own conversation and \
         budget, wait for it, and return its report. Personas: coder, \
         tester, reviewer, debugger, researcher."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "persona": {
                    "type": "string",
                    "enum": ["coder", "tester", "reviewer", "debugger", "researcher"],
                    "description": "Preset role for the child agent"
                },
                "task": {
                    "type": "string",
                    "description": "The focused task for the child"
                },
                "max_iterations": {
                    "type": "integer",
                    "description": "Iteration cap for the child (optional)"
                }
            },
            "required": ["persona", "task"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::spawn()
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ExecContext) -> ToolResult {
        let persona = call.args.get("persona").and_then(Value::as_str).unwrap_or("");
        let task = match call.args.get("task").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => t,
            _ => return ToolResult::err(&call.id, ErrorKind::InvalidArgs, "missing 'task'"),
        };
        let max_iterations = call
            .args
            .get("max_iterations")
            .and_then(Value::as_u64)
            .map(|n| n as u32);

        match self.dispatcher.spawn(persona, task, max_iterations).await {
            Ok(report) => ToolResult::ok(&call.id, report),
            Err((kind, msg)) => ToolResult::err(&call.id, kind, msg),
        }
    }
}

/// `run_parallel_subagents` tool surface.
pub struct RunParallelSubagentsTool {
    dispatcher: Arc<SubAgentDispatcher>,
}

#[async_trait]
impl Tool for RunParallelSubagentsTool {
    fn name(&self) -> &str {
        "run_parallel_subagents"
    }

    fn description(&self) -> &str {
        "Spawn up to 4 child agents concurrently, each with an independent \
         budget, and return all reports. Use for independent sub-tasks only."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "description": "Child specs: [{\"persona\": \"coder\", \"task\": \"...\"}]"
                }
            },
            "required": ["tasks"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::spawn()
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ExecContext) -> ToolResult {
        let Some(tasks) = call.args.get("tasks").and_then(Value::as_array) else {
            return ToolResult::err(&call.id, ErrorKind::InvalidArgs, "missing 'tasks' array");
        };
        if tasks.is_empty() || tasks.len() > MAX_PARALLEL {
            return ToolResult::err(
                &call.id,
                ErrorKind::InvalidArgs,
                format!("'tasks' must contain between 1 and {MAX_PARALLEL} entries"),
            );
        }

        let futures: Vec<_> = tasks
            .iter()
            .map(|spec| {
                let persona = spec.get("persona").and_then(Value::as_str).unwrap_or("").to_string();
                let task = spec.get("task").and_then(Value::as_str).unwrap_or("").to_string();
                let dispatcher = Arc::clone(&self.dispatcher);
                async move {
                    if task.is_empty() {
                        return format!("[{persona}] error: empty task");
                    }
                    match dispatcher.spawn(&persona, &task, None).await {
                        Ok(report) => format!("[{persona}] {report}"),
                        Err((kind, msg)) => format!("[{persona}] error ({kind}): {msg}"),
                    }
                }
            })
            .collect();

        let reports = futures::future::join_all(futures).await;
        ToolResult::ok(&call.id, reports.join("\n\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use ledit_model::mock::ScriptedMockProvider;
    use ledit_model::ResponseEvent;

    use super::*;

    fn dispatcher_with(
        scripts: Vec<Vec<ResponseEvent>>,
        subagents_enabled: bool,
        root: &std::path::Path,
    ) -> Arc<SubAgentDispatcher> {
        let mut config = ledit_config::Config::default();
        config.agent.subagents_enabled = subagents_enabled;
        config.web.enabled = false;
        let config = Arc::new(config);
        let control = ledit_config::ControlDir::new(root);
        control.ensure().unwrap();
        let client = Arc::new(ProviderClient::single(Arc::new(ScriptedMockProvider::new(
            scripts,
        ))));
        let pricing = Arc::new(PricingTable::from_map(Default::default()));
        let exec_ctx = ExecContext::new(root, Arc::new(config.tools.clone()));
        SubAgentDispatcher::new(
            client,
            pricing,
            config,
            EventBus::new(),
            root.to_path_buf(),
            exec_ctx,
            &control,
        )
    }

    fn text(s: &str) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::TextDelta(s.into()),
            ResponseEvent::Usage(ledit_model::Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
            }),
            ResponseEvent::Done,
        ]
    }

    #[tokio::test]
    async fn child_runs_to_completion_and_reports() {
        let tmp = tempfile::tempdir().unwrap();
        // Child loop: planner says completed, evaluator confirms.
        let scripts = vec![
            text(r#"{"action": "completed", "stop_when": ""}"#),
            text(r#"{"status": "completed", "reason": "research done"}"#),
        ];
        let d = dispatcher_with(scripts, true, tmp.path());
        let report = d
            .spawn("researcher", "summarize the workspace", None)
            .await
            .unwrap();
        assert!(report.contains("sub-agent finished"), "{report}");
    }

    #[tokio::test]
    async fn disabled_flag_rejects_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dispatcher_with(vec![], false, tmp.path());
        let err = d.spawn("coder", "x", None).await.unwrap_err();
        assert_eq!(err.0, ErrorKind::Permission);
    }

    #[tokio::test]
    async fn unknown_persona_is_invalid_args() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dispatcher_with(vec![], true, tmp.path());
        let err = d.spawn("barista", "x", None).await.unwrap_err();
        assert_eq!(err.0, ErrorKind::InvalidArgs);
    }

    #[tokio::test]
    async fn depth_cap_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dispatcher_with(vec![], true, tmp.path());
        d.depth.store(MAX_DEPTH, Ordering::Relaxed);
        let err = d.spawn("coder", "x", None).await.unwrap_err();
        assert_eq!(err.0, ErrorKind::Permission);
        assert!(err.1.contains("depth"));
    }

    #[tokio::test]
    async fn parallel_tool_rejects_oversized_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dispatcher_with(vec![], true, tmp.path());
        let tool = RunParallelSubagentsTool { dispatcher: d };
        let call = ToolCall {
            id: "1".into(),
            name: "run_parallel_subagents".into(),
            args: json!({"tasks": [{}, {}, {}, {}, {}]}),
        };
        let ctx = ExecContext::new(tmp.path(), Arc::new(ledit_config::ToolsConfig::default()));
        let r = tool.execute(&call, &ctx).await;
        assert_eq!(r.error_kind, Some(ErrorKind::InvalidArgs));
    }
}
