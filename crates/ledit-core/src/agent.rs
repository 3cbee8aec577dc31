// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent loop: Planner → Executor → Evaluator iteration driving one
//! user intent to completion, budget exhaustion, interrupt, or the
//! iteration cap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledit_events::{EventBus, EventKind};
use ledit_model::{
    CompletionRequest, Message, ModelError, PricingTable, ProviderClient, ToolSchema, TurnKind,
};
use ledit_tools::{ErrorKind, ExecContext, ToolCall, ToolRegistry, ToolResult};

use crate::budget::{BudgetEventKind, BudgetTracker, Dimension, Phase};
use crate::plan::{parse_structured, EvalStatus, Evaluation, Plan, PlanAction};
use crate::prompts;
use crate::state::{AgentState, RunStateStore};
use crate::summary::{RunSummary, TerminationReason};

/// Hard per-run caps on exploration tools.
const WORKSPACE_CONTEXT_CAP: u32 = 2;
const RUN_SHELL_CAP: u32 = 5;

/// Bounded retry for transient tool failures.
const TOOL_RETRY_ATTEMPTS: u32 = 3;
const TOOL_RETRY_BASE_MS: u64 = 300;

/// Everything the loop needs, assembled once at the wiring site.
pub struct LoopDeps {
    pub client: Arc<ProviderClient>,
    pub registry: Arc<ToolRegistry>,
    pub bus: EventBus,
    pub pricing: Arc<PricingTable>,
    pub store: RunStateStore,
    pub config: Arc<ledit_config::Config>,
    pub workspace_root: PathBuf,
    pub cancel: CancellationToken,
    pub exec_ctx: ExecContext,
}

/// Progress counters recovered from the conversation on resume.
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    reads: u32,
    edits: u32,
    validations: u32,
    workspace_context: u32,
    run_shell: u32,
}

pub struct AgentLoop {
    deps: LoopDeps,
    state: AgentState,
    budget: BudgetTracker,
    counters: Counters,
    last_validation_ok: Option<bool>,
    last_validation_output: String,
    idle_streak: u32,
    call_seq: u32,
}

impl AgentLoop {
    /// Fresh run for `intent`.
    pub fn new(intent: &str, deps: LoopDeps) -> Self {
        Self::new_with_persona(intent, None, deps)
    }

    /// Fresh run whose system message carries a sub-agent persona preset.
    pub fn new_with_persona(intent: &str, persona: Option<&str>, deps: LoopDeps) -> Self {
        let mut state = AgentState::new(intent, &deps.config);
        let mut system = prompts::system_prompt(&deps.workspace_root.to_string_lossy());
        if let Some(persona) = persona {
            system.push_str("\n\n");
            system.push_str(persona);
        }
        state.conversation.push(Message::system(system));
        state.conversation.push(Message::user(intent));
        let budget = BudgetTracker::new(deps.config.budgets.clone(), deps.config.agent.max_iterations);
        Self {
            deps,
            state,
            budget,
            counters: Counters::default(),
            last_validation_ok: None,
            last_validation_output: String::new(),
            idle_streak: 0,
            call_seq: 0,
        }
    }

    /// Continue a persisted run.  Counters and budgets are rebuilt from the
    /// stored conversation and snapshot so the next action matches what the
    /// pre-crash loop would have done.
    pub fn resume(state: AgentState, deps: LoopDeps) -> Self {
        let budget = BudgetTracker::from_snapshot(
            deps.config.budgets.clone(),
            state.max_iterations,
            &state.budgets,
        );
        let counters = Self::recount(&state);
        let last_validation_ok = Self::last_validation_verdict(&state);
        info!(run_id = %state.run_id, iteration = state.iteration, "resuming run");
        Self {
            deps,
            state,
            budget,
            counters,
            last_validation_ok,
            last_validation_output: String::new(),
            idle_streak: 0,
            call_seq: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    /// Drive the loop to a terminal state.  Returns the final state and the
    /// structured summary (also emitted as `query_completed`).
    pub async fn run(mut self) -> (AgentState, RunSummary) {
        self.deps.bus.emit(
            EventKind::QueryStarted,
            json!({ "run_id": self.state.run_id, "intent": self.state.user_intent }),
        );

        let reason = self.drive().await;

        self.state.completed = matches!(reason, TerminationReason::Completed);
        self.state.interrupted = matches!(reason, TerminationReason::Interrupted);
        self.state.budgets = self.budget.snapshot();

        if self.state.completed {
            // Invariant: a normally-terminated run leaves no state file.
            self.deps.store.clear();
        } else if let Err(e) = self.deps.store.save(&self.state) {
            warn!("failed to persist final state: {e}");
        }

        let summary = RunSummary {
            run_id: self.state.run_id.clone(),
            reason,
            iterations: self.state.iteration,
            budgets: self.state.budgets.clone(),
            wall_time_secs: self.budget.time_used().as_secs(),
            active_provider: self.deps.client.active_provider(),
        };
        self.deps.bus.emit(
            EventKind::QueryCompleted,
            serde_json::to_value(&summary).unwrap_or_default(),
        );
        (self.state, summary)
    }

    async fn drive(&mut self) -> TerminationReason {
        loop {
            if self.deps.cancel.is_cancelled() {
                self.deps.bus.emit(EventKind::Interrupt, json!({}));
                return TerminationReason::Interrupted;
            }

            // Budget precheck at the iteration boundary.
            for ev in self.budget.poll_events(self.state.iteration) {
                let kind = match ev.kind {
                    BudgetEventKind::SoftWarn => "soft_warn",
                    BudgetEventKind::HardStop => "hard_stop",
                };
                self.deps.bus.emit(
                    EventKind::MetricsUpdate,
                    json!({ "budget_event": kind, "dimension": ev.dimension.to_string() }),
                );
            }
            if let Some(dim) = self.budget.hard_tripped() {
                return match dim {
                    Dimension::Iterations => TerminationReason::IterationCap,
                    other => TerminationReason::BudgetExceeded(other),
                };
            }

            // Planner.
            let plan = match self.next_plan().await {
                Ok(plan) => plan,
                Err(reason) => return reason,
            };
            debug!(action = ?plan.action, target = ?plan.target, "plan");
            self.state.last_plan = Some(plan.clone());

            // Executor: at most one tool call per iteration.
            let mut progressed = false;
            match plan.action {
                PlanAction::Completed | PlanAction::Continue => {}
                _ => match self.execute_plan(&plan).await {
                    Ok(did) => progressed = did,
                    Err(reason) => return reason,
                },
            }

            // Stuck detector: two structurally idle iterations force a
            // deterministic step on the next plan.
            if progressed {
                self.idle_streak = 0;
            } else {
                self.idle_streak += 1;
                if self.idle_streak >= 2 {
                    self.state
                        .conversation
                        .push(Message::user(prompts::STUCK_NUDGE));
                    self.idle_streak = 0;
                }
            }

            // Evaluator.
            match self.evaluate(&plan).await {
                Ok(Some(reason)) => return reason,
                Ok(None) => {}
                Err(reason) => return reason,
            }

            // Persist and advance.
            self.state.budgets = self.budget.snapshot();
            if let Err(e) = self.deps.store.save(&self.state) {
                warn!("failed to persist run state: {e}");
            }
            self.state.iteration += 1;
            self.deps.bus.emit(
                EventKind::MetricsUpdate,
                json!({
                    "iteration": self.state.iteration,
                    "tokens": self.budget.tokens_used(),
                    "cost": self.budget.cost_used(),
                }),
            );
        }
    }

    // ── Planner ───────────────────────────────────────────────────────────────

    async fn next_plan(&mut self) -> Result<Plan, TerminationReason> {
        if let Some(plan) = self.deterministic_plan() {
            debug!(action = ?plan.action, "deterministic short-circuit");
            return Ok(plan);
        }

        let phase = if self.state.iteration == 0 {
            Phase::IntentAnalysis
        } else {
            Phase::Planning
        };

        let mut messages = self.state.conversation.messages.clone();
        messages.push(Message::user(prompts::PLANNER_INSTRUCTION));

        let retries = self.deps.config.agent.plan_retry_limit;
        let mut last_hint = String::new();
        for _ in 0..=retries {
            let req = CompletionRequest {
                messages: messages.clone(),
                tools: vec![],
                stream: false,
                annotation: TurnKind::Control,
            };
            let completion = match self.control_complete(req, phase).await {
                Ok(c) => c,
                Err(reason) => return Err(reason),
            };
            match parse_structured::<Plan>(&completion.text) {
                Ok(plan) => return Ok(self.apply_policy(plan)),
                Err(hint) => {
                    warn!("malformed planner response: {hint}");
                    messages.push(Message::assistant(&completion.text));
                    messages.push(Message::user(prompts::plan_schema_reminder(&hint)));
                    last_hint = hint;
                }
            }
        }
        Err(TerminationReason::FatalError(format!(
            "planner returned malformed plans after {retries} reminders ({last_hint})"
        )))
    }

    /// Deterministic plans that skip the model entirely.
    fn deterministic_plan(&self) -> Option<Plan> {
        // First iteration: when the intent names a concrete file that
        // exists, read it instead of exploring the workspace.
        if self.state.iteration == 0 && self.counters.reads == 0 {
            if let Some(target) = find_target_file(&self.state.user_intent, &self.deps.workspace_root)
            {
                return Some(Plan {
                    action: PlanAction::ReadFile,
                    target: Some(target),
                    instructions: None,
                    stop_when: None,
                });
            }
        }
        // Compilation-class validation failure: force a targeted fix plan.
        if self.last_validation_ok == Some(false)
            && is_compilation_failure(&self.last_validation_output)
        {
            return Some(Plan {
                action: PlanAction::EditFile,
                target: None,
                instructions: Some(format!(
                    "Fix the compilation errors reported by validation:\n{}",
                    tail(&self.last_validation_output, 2000)
                )),
                stop_when: Some("build passes".into()),
            });
        }
        None
    }

    /// Loop-policy overrides applied to every model-produced plan.
    fn apply_policy(&self, mut plan: Plan) -> Plan {
        // Edits executed but never validated: validation comes before any
        // further exploration or a completion claim.
        if self.counters.edits > 0
            && self.counters.validations == 0
            && !plan.action.is_edit()
            && plan.action != PlanAction::Validate
        {
            debug!("policy: forcing validate after unvalidated edits");
            plan = Plan {
                action: PlanAction::Validate,
                target: None,
                instructions: None,
                stop_when: plan.stop_when,
            };
        }
        // Reading forever without editing: force the edit.
        else if self.counters.reads >= 2
            && self.counters.edits == 0
            && matches!(plan.action, PlanAction::ReadFile | PlanAction::Analyze)
        {
            debug!("policy: forcing edit after repeated exploration");
            plan = Plan {
                action: PlanAction::EditFile,
                target: plan.target,
                instructions: Some(self.state.user_intent.clone()),
                stop_when: plan.stop_when,
            };
        }

        // Exploration caps.
        if plan.action == PlanAction::Analyze
            && self.counters.workspace_context >= WORKSPACE_CONTEXT_CAP
        {
            debug!("policy: workspace_context cap reached; downgrading to search");
            plan.action = PlanAction::RunShell;
            plan.instructions = Some(format!(
                "grep -rn '{}' . | head -50",
                plan.instructions.as_deref().unwrap_or("").replace('\'', "")
            ));
        }
        if plan.action == PlanAction::RunShell && self.counters.run_shell >= RUN_SHELL_CAP {
            debug!("policy: run_shell cap reached; forcing validate");
            plan = Plan {
                action: PlanAction::Validate,
                target: None,
                instructions: None,
                stop_when: plan.stop_when,
            };
        }
        plan
    }

    // ── Executor ──────────────────────────────────────────────────────────────

    /// Dispatch the plan's single tool call.  Returns whether the iteration
    /// made structural progress (an edit or a validation).
    async fn execute_plan(&mut self, plan: &Plan) -> Result<bool, TerminationReason> {
        let call = match self.build_call(plan).await? {
            Some(call) => call,
            // Codegen turn produced no usable tool call; evaluator sees the
            // conversation as-is.
            None => return Ok(false),
        };

        let result = self.dispatch_with_retry(&call).await;

        // Append the exchange to the conversation in wire order.
        self.state
            .conversation
            .push_tool_call(&call.id, &call.name, &call.args);
        let body = if result.success {
            result.output.clone()
        } else {
            format!(
                "[{}] {}",
                result.error_kind.unwrap_or(ErrorKind::Internal),
                result.output
            )
        };
        self.state.conversation.push_tool_result(&call.id, &body);

        self.deps.bus.emit(
            EventKind::ToolCompleted,
            json!({
                "id": call.id,
                "name": call.name,
                "success": result.success,
                "served_from_cache": result.served_from_cache,
                "duration_ms": result.duration.as_millis() as u64,
                "error_kind": result.error_kind.map(|k| k.to_string()),
                "dry_run": result.dry_run,
            }),
        );

        // Progress accounting.
        match call.name.as_str() {
            "read_file" => self.counters.reads += 1,
            "workspace_context" => self.counters.workspace_context += 1,
            "run_shell" => {
                if !result.served_from_cache {
                    self.counters.run_shell += 1;
                }
            }
            "validate" => {
                self.counters.validations += 1;
                self.last_validation_ok = Some(result.success || result.dry_run);
                self.last_validation_output = result.output.clone();
                self.budget
                    .record(Phase::Validation, Default::default(), 0.0, result.duration);
            }
            "write_file" | "edit_file_section" | "micro_edit" => {
                if result.success {
                    self.counters.edits += 1;
                    // The edit invalidates any earlier validation verdict;
                    // completion needs fresh evidence.
                    self.last_validation_ok = None;
                }
            }
            _ => {}
        }

        let progressed = matches!(
            call.name.as_str(),
            "write_file" | "edit_file_section" | "micro_edit" | "validate"
        ) && (result.success || result.dry_run);
        Ok(progressed)
    }

    /// Translate a plan into one concrete tool call.  Edit actions need a
    /// codegen model turn to produce the actual change.
    async fn build_call(&mut self, plan: &Plan) -> Result<Option<ToolCall>, TerminationReason> {
        let id = self.next_call_id();
        let call = match plan.action {
            PlanAction::ReadFile => ToolCall {
                id,
                name: "read_file".into(),
                args: json!({ "path": plan.target.clone().unwrap_or_default() }),
            },
            PlanAction::RunShell => ToolCall {
                id,
                name: "run_shell".into(),
                args: json!({ "command": plan.instructions.clone().unwrap_or_default() }),
            },
            PlanAction::Validate => {
                let mut args = json!({});
                if let Some(cmd) = &plan.instructions {
                    if !cmd.is_empty() {
                        args = json!({ "command": cmd });
                    }
                }
                ToolCall {
                    id,
                    name: "validate".into(),
                    args,
                }
            }
            PlanAction::Analyze => ToolCall {
                id,
                name: "workspace_context".into(),
                args: json!({ "query": plan.instructions.clone().unwrap_or_default() }),
            },
            PlanAction::EditFile | PlanAction::MicroEdit => {
                return self.codegen_edit_call(plan).await;
            }
            PlanAction::Completed | PlanAction::Continue => return Ok(None),
        };
        Ok(Some(call))
    }

    /// Codegen turn: ask the capable model to express the edit as a tool
    /// call against the edit tools.
    async fn codegen_edit_call(&mut self, plan: &Plan) -> Result<Option<ToolCall>, TerminationReason> {
        let target = plan.target.clone().unwrap_or_default();
        let instructions = plan
            .instructions
            .clone()
            .unwrap_or_else(|| self.state.user_intent.clone());

        let tools: Vec<ToolSchema> = self
            .deps
            .registry
            .specs()
            .into_iter()
            .filter(|s| {
                matches!(
                    s.name.as_str(),
                    "edit_file_section" | "micro_edit" | "write_file" | "read_file"
                )
            })
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let mut messages = self.state.conversation.messages.clone();
        messages.push(Message::user(prompts::edit_instruction(
            &target,
            &instructions,
        )));

        for attempt in 0..2 {
            let (sink_tx, sink_task) = self.stream_to_bus();
            let req = CompletionRequest {
                messages: messages.clone(),
                tools: tools.clone(),
                stream: self.deps.config.agent.stream,
                annotation: TurnKind::Codegen,
            };
            let started = Instant::now();
            let completion = match self
                .deps
                .client
                .complete(req, sink_tx.as_ref(), &self.deps.cancel)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    drop(sink_tx);
                    if let Some(task) = sink_task {
                        let _ = task.await;
                    }
                    return Err(self.map_model_error(e));
                }
            };
            drop(sink_tx);
            if let Some(task) = sink_task {
                let _ = task.await;
            }
            let cost = self.deps.pricing.cost(
                &self.deps.client.model_for(TurnKind::Codegen),
                completion.usage,
            );
            self.budget
                .record(Phase::Codegen, completion.usage, cost, started.elapsed());

            if let Some(inv) = completion.tool_calls.into_iter().next() {
                return Ok(Some(ToolCall {
                    id: inv.id,
                    name: inv.name,
                    args: inv.arguments,
                }));
            }
            if attempt == 0 {
                messages.push(Message::assistant(&completion.text));
                messages.push(Message::user(prompts::EDIT_NEEDS_TOOL_CALL));
            } else {
                warn!("codegen turn produced no tool call twice; recording text only");
                if !completion.text.is_empty() {
                    self.state
                        .conversation
                        .push(Message::assistant(&completion.text));
                }
            }
        }
        Ok(None)
    }

    /// Dispatch with bounded retry on transient failures; a timeout gets
    /// exactly one retry before surfacing.
    async fn dispatch_with_retry(&mut self, call: &ToolCall) -> ToolResult {
        self.deps.bus.emit(
            EventKind::ToolCalled,
            json!({ "id": call.id, "name": call.name, "args": call.args }),
        );

        let mut result = self.deps.registry.dispatch(call, &self.deps.exec_ctx).await;
        let mut attempt = 1;
        loop {
            let retry = match result.error_kind {
                Some(ErrorKind::Transient) => attempt < TOOL_RETRY_ATTEMPTS,
                Some(ErrorKind::Timeout) => attempt < 2,
                _ => false,
            };
            if result.success || !retry || self.deps.cancel.is_cancelled() {
                return result;
            }
            let backoff = Duration::from_millis(TOOL_RETRY_BASE_MS * (1 << attempt));
            debug!(tool = %call.name, attempt, "retrying transient tool failure");
            tokio::select! {
                _ = self.deps.cancel.cancelled() => return result,
                _ = tokio::time::sleep(backoff) => {}
            }
            result = self.deps.registry.dispatch(call, &self.deps.exec_ctx).await;
            attempt += 1;
        }
    }

    // ── Evaluator ─────────────────────────────────────────────────────────────

    /// Run the evaluator turn.  `Ok(Some(reason))` terminates the loop.
    async fn evaluate(&mut self, plan: &Plan) -> Result<Option<TerminationReason>, TerminationReason> {
        let mut messages = self.state.conversation.messages.clone();
        messages.push(Message::user(prompts::EVALUATOR_INSTRUCTION));

        let mut evaluation: Option<Evaluation> = None;
        for _ in 0..2 {
            let req = CompletionRequest {
                messages: messages.clone(),
                tools: vec![],
                stream: false,
                annotation: TurnKind::Control,
            };
            let completion = self.control_complete(req, Phase::Evaluation).await?;
            match parse_structured::<Evaluation>(&completion.text) {
                Ok(ev) => {
                    evaluation = Some(ev);
                    break;
                }
                Err(hint) => {
                    messages.push(Message::assistant(&completion.text));
                    messages.push(Message::user(prompts::plan_schema_reminder(&hint)));
                }
            }
        }
        let Some(mut evaluation) = evaluation else {
            // A broken evaluator response is not fatal; keep iterating.
            warn!("evaluator returned malformed responses; continuing");
            return Ok(None);
        };

        // Code changes need passing validation evidence before completion;
        // docs-only intents may complete without it.
        let docs_only = is_docs_only_intent(&self.state.user_intent);
        if evaluation.status == EvalStatus::Completed
            && !docs_only
            && !self.deps.config.agent.dry_run
            && self.counters.edits > 0
            && self.last_validation_ok != Some(true)
        {
            debug!("evaluator claimed completion without validation evidence; overriding");
            evaluation = Evaluation {
                status: EvalStatus::Continue,
                reason: "completion claimed without passing validation".into(),
                next_action: Some("run validate".into()),
            };
        }

        self.state.last_evaluation = Some(evaluation.clone());

        match evaluation.status {
            EvalStatus::Completed => match self.verify_evidence(plan) {
                Ok(()) => Ok(Some(TerminationReason::Completed)),
                Err(detail) => {
                    info!("evidence verification rejected completion: {detail}");
                    self.state
                        .conversation
                        .push(Message::user(prompts::evidence_rejection(&detail)));
                    Ok(None)
                }
            },
            EvalStatus::Continue => Ok(None),
            EvalStatus::Revise => {
                if let Some(next) = &evaluation.next_action {
                    self.state
                        .conversation
                        .push(Message::user(format!("Revise the plan: {next}")));
                }
                Ok(None)
            }
        }
    }

    /// Deterministic checks behind a completion claim: the stop_when
    /// predicate, file existence, and validation evidence.  Dry-run mode
    /// accepts simulated results (the working tree is intentionally
    /// untouched).
    fn verify_evidence(&self, plan: &Plan) -> Result<(), String> {
        if self.deps.config.agent.dry_run {
            return Ok(());
        }
        let stop_when = plan
            .stop_when
            .as_deref()
            .or_else(|| {
                self.state
                    .last_plan
                    .as_ref()
                    .and_then(|p| p.stop_when.as_deref())
            })
            .unwrap_or("");

        if let Some(pattern) = stop_when.strip_prefix("regex:") {
            let target = plan
                .target
                .clone()
                .or_else(|| self.last_edit_target())
                .ok_or_else(|| "stop_when is a regex but no target file is known".to_string())?;
            let path = self.deps.workspace_root.join(&target);
            let content = std::fs::read_to_string(&path)
                .map_err(|_| format!("target file {target} does not exist"))?;
            let re = regex::RegexBuilder::new(pattern)
                .multi_line(true)
                .build()
                .map_err(|e| format!("stop_when regex does not compile: {e}"))?;
            if !re.is_match(&content) {
                return Err(format!("regex '{pattern}' does not match {target}"));
            }
            return Ok(());
        }

        if self.counters.edits > 0 && !is_docs_only_intent(&self.state.user_intent) {
            if self.last_validation_ok != Some(true) {
                return Err("no passing validation recorded for a code change".into());
            }
        }
        if let Some(target) = &plan.target {
            if !target.is_empty() && !self.deps.workspace_root.join(target).exists() {
                return Err(format!("target {target} does not exist"));
            }
        }
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn control_complete(
        &mut self,
        req: CompletionRequest,
        phase: Phase,
    ) -> Result<ledit_model::Completion, TerminationReason> {
        let started = Instant::now();
        let completion = self
            .deps
            .client
            .complete(req, None, &self.deps.cancel)
            .await
            .map_err(|e| self.map_model_error(e))?;
        let cost = self.deps.pricing.cost(
            &self.deps.client.model_for(TurnKind::Control),
            completion.usage,
        );
        self.budget
            .record(phase, completion.usage, cost, started.elapsed());
        Ok(completion)
    }

    fn map_model_error(&self, e: ModelError) -> TerminationReason {
        match e {
            ModelError::Cancelled => TerminationReason::Interrupted,
            // Transient exhaustion escalates to the caller as internal.
            ModelError::Transient(msg) | ModelError::Fatal(msg) => {
                self.deps
                    .bus
                    .emit(EventKind::Error, json!({ "message": msg }));
                TerminationReason::FatalError(msg)
            }
        }
    }

    fn stream_to_bus(
        &self,
    ) -> (
        Option<mpsc::Sender<String>>,
        Option<tokio::task::JoinHandle<()>>,
    ) {
        if !self.deps.config.agent.stream {
            return (None, None);
        }
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let bus = self.deps.bus.clone();
        let task = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                bus.emit(EventKind::StreamChunk, json!({ "text": chunk }));
            }
        });
        (Some(tx), Some(task))
    }

    fn next_call_id(&mut self) -> String {
        self.call_seq += 1;
        format!("call_{}_{:03}", self.state.iteration, self.call_seq)
    }

    fn last_edit_target(&self) -> Option<String> {
        for msg in self.state.conversation.messages.iter().rev() {
            if let ledit_model::MessageContent::ToolCall { function, .. } = &msg.content {
                if matches!(
                    function.name.as_str(),
                    "write_file" | "edit_file_section" | "micro_edit"
                ) {
                    let args: serde_json::Value =
                        serde_json::from_str(&function.arguments).ok()?;
                    return args
                        .get("path")
                        .and_then(serde_json::Value::as_str)
                        .map(String::from);
                }
            }
        }
        None
    }

    fn recount(state: &AgentState) -> Counters {
        let mut c = Counters::default();
        for msg in &state.conversation.messages {
            if let ledit_model::MessageContent::ToolCall { function, .. } = &msg.content {
                match function.name.as_str() {
                    "read_file" => c.reads += 1,
                    "write_file" | "edit_file_section" | "micro_edit" => c.edits += 1,
                    "validate" => c.validations += 1,
                    "workspace_context" => c.workspace_context += 1,
                    "run_shell" => c.run_shell += 1,
                    _ => {}
                }
            }
        }
        c
    }

    fn last_validation_verdict(state: &AgentState) -> Option<bool> {
        let mut awaiting: Option<&str> = None;
        let mut verdict = None;
        for msg in &state.conversation.messages {
            match &msg.content {
                ledit_model::MessageContent::ToolCall {
                    tool_call_id,
                    function,
                } if function.name == "validate" => awaiting = Some(tool_call_id),
                ledit_model::MessageContent::ToolResult {
                    tool_call_id,
                    content,
                } if awaiting == Some(tool_call_id.as_str()) => {
                    verdict = Some(content.contains("validation passed"));
                    awaiting = None;
                }
                _ => {}
            }
        }
        verdict
    }
}

/// Scan the intent for a token that names an existing file under the root.
/// Tokens are stripped of surrounding quotes, backticks, and sentence
/// punctuation so "edit `x.txt`." still resolves.
fn find_target_file(intent: &str, root: &Path) -> Option<String> {
    for token in intent.split_whitespace() {
        let cleaned = token
            .trim_start_matches(|c: char| matches!(c, '`' | '\'' | '"' | '('))
            .trim_end_matches(|c: char| {
                matches!(c, '.' | ',' | ':' | ';' | '!' | '?' | '`' | '\'' | '"' | ')')
            });
        if cleaned.contains('.') && !cleaned.starts_with('-') && root.join(cleaned).is_file() {
            return Some(cleaned.to_string());
        }
    }
    None
}

/// Heuristic for intents whose completion needs no build evidence.
fn is_docs_only_intent(intent: &str) -> bool {
    let re = regex::Regex::new(r"(?i)\b(comment|doc|docs|readme|changelog|license|typo)\b")
        .expect("static regex");
    re.is_match(intent)
}

/// Compiler-shaped failure detection for the revise-plan short-circuit.
fn is_compilation_failure(output: &str) -> bool {
    let lowered = output.to_lowercase();
    ["error[e", "compilation failed", "cannot find", "undefined:", "syntax error", "expected"]
        .iter()
        .any(|marker| lowered.contains(marker))
        && lowered.contains("validation failed")
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_target_file_matches_existing_only() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("main.go"), "package main\n").unwrap();
        assert_eq!(
            find_target_file("Add a comment to main.go please", tmp.path()),
            Some("main.go".to_string())
        );
        assert_eq!(find_target_file("Add a comment to other.go", tmp.path()), None);
        assert_eq!(find_target_file("no file here", tmp.path()), None);
    }

    #[test]
    fn find_target_file_strips_punctuation() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.txt"), "").unwrap();
        assert_eq!(
            find_target_file("write 'hi' to `x.txt`.", tmp.path()),
            Some("x.txt".to_string())
        );
    }

    #[test]
    fn docs_only_heuristic() {
        assert!(is_docs_only_intent("Add a top-line comment to main.go"));
        assert!(is_docs_only_intent("update the README"));
        assert!(!is_docs_only_intent("rename function foo to bar"));
    }

    #[test]
    fn compilation_failure_detection() {
        assert!(is_compilation_failure(
            "validation failed\nmain.go:3: undefined: foo"
        ));
        assert!(is_compilation_failure(
            "validation failed\nerror[E0425]: cannot find value `foo`"
        ));
        assert!(!is_compilation_failure("validation failed\n2 tests failed"));
        assert!(!is_compilation_failure("error[E0425] without validate framing"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "é".repeat(10);
        let t = tail(&s, 5);
        assert!(t.len() <= 5);
        assert!(!t.is_empty());
    }
}
