// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Assembly: the single wiring site where provider client, tool registry,
//! event bus, web server, and interrupt controller are constructed and
//! bound to one cancellation scope.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ledit_cache::EvidenceCache;
use ledit_config::{Config, ControlDir};
use ledit_core::{
    AgentLoop, AgentState, InstanceRegistry, InterruptController, LoopDeps, RevisionLog,
    RunStateStore, RunSummary, SubAgentDispatcher,
};
use ledit_events::{EventBus, EventKind};
use ledit_model::{PricingTable, ProviderClient, RetryPolicy};
use ledit_tools::{register_builtin, ExecContext, ToolRegistry};
use ledit_web::ControlCommand;

/// Assembled process-wide components, all bound to `cancel`.
pub struct App {
    pub config: Arc<Config>,
    pub control: ControlDir,
    pub workspace_root: PathBuf,
    pub bus: EventBus,
    pub client: Arc<ProviderClient>,
    pub pricing: Arc<PricingTable>,
    pub registry: Arc<ToolRegistry>,
    pub exec_ctx: ExecContext,
    pub cancel: CancellationToken,
    pub instances: InstanceRegistry,
    pub dispatcher: Arc<SubAgentDispatcher>,
    pub web_port: Option<u16>,
    pub web_commands: Option<mpsc::Receiver<ControlCommand>>,
    web_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    interrupt_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Cancellation token of the run currently in flight, for the web UI's
    /// cancel endpoint.
    current_run: std::sync::Mutex<Option<CancellationToken>>,
    session_id: String,
}

impl App {
    /// Wire every component under one cancellation scope.
    ///
    /// `with_signals` is false for one-shot utility commands that must not
    /// install a ctrl-c handler (and for tests).
    pub async fn assemble(
        config: Arc<Config>,
        workspace_root: PathBuf,
        with_signals: bool,
    ) -> anyhow::Result<Self> {
        let control = ControlDir::new(&workspace_root);
        control.ensure().context("creating .ledit control directory")?;

        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let session_id = uuid::Uuid::new_v4().to_string();

        let interrupt_task = with_signals.then(|| {
            InterruptController::new(cancel.clone(), bus.clone()).spawn()
        });

        let pricing = Arc::new(PricingTable::load_or_init(&control.pricing_file()));

        // Provider stack: primary, then the routing failover list, plus the
        // optional cheaper control-plane model.
        let primary = ledit_model::from_config(&config.model)?;
        let mut providers = vec![primary];
        for name in &config.routing.failover {
            match config.providers.get(name) {
                Some(model_cfg) => match ledit_model::from_config(model_cfg) {
                    Ok(p) => providers.push(p),
                    Err(e) => warn!(provider = %name, "skipping failover entry: {e}"),
                },
                None => warn!(provider = %name, "failover entry not found in providers map"),
            }
        }
        let control_provider = config
            .routing
            .control
            .as_ref()
            .and_then(|name| config.providers.get(name))
            .and_then(|cfg| ledit_model::from_config(cfg).ok());
        let client = Arc::new(ProviderClient::new(
            providers,
            control_provider,
            RetryPolicy::default(),
            std::time::Duration::from_secs(config.routing.quarantine_secs),
        ));

        // Tools: registry + evidence cache + revision journal, sharing the
        // run-wide cancellation token.
        let revisions = Arc::new(RevisionLog::new(&control, &workspace_root, &session_id));
        let exec_ctx = ExecContext::new(&workspace_root, Arc::new(config.tools.clone()))
            .with_cancel(cancel.clone())
            .with_revisions(revisions);

        let mut registry = ToolRegistry::new(&config.tools);
        register_builtin(&mut registry);
        let dispatcher = SubAgentDispatcher::new(
            Arc::clone(&client),
            Arc::clone(&pricing),
            Arc::clone(&config),
            bus.clone(),
            workspace_root.clone(),
            exec_ctx.clone(),
            &control,
        );
        dispatcher.register_tools(&mut registry);

        let mut registry = registry.with_dry_run(config.agent.dry_run);
        if config.cache.enabled {
            match EvidenceCache::open(
                &control.evidence_cache_dir(),
                &workspace_root,
                config.cache.max_entries,
            ) {
                Ok(cache) => registry = registry.with_cache(Arc::new(cache)),
                Err(e) => warn!("evidence cache unavailable: {e}"),
            }
        }
        let registry = Arc::new(registry);

        // Web UI, observing the bus and feeding queries back through a
        // command channel.
        let (web, web_commands) = if config.web.enabled {
            let (tx, rx) = mpsc::channel(16);
            match ledit_web::serve(
                &config.web,
                bus.clone(),
                workspace_root.clone(),
                tx,
                cancel.clone(),
            )
            .await
            {
                Ok(server) => {
                    info!(port = server.port, "web UI available");
                    (Some(server), Some(rx))
                }
                Err(e) => {
                    warn!("web UI disabled: {e}");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let instances = InstanceRegistry::new(&control);
        instances.register(web.as_ref().map(|w| w.port));
        let web_port = web.as_ref().map(|w| w.port);
        let web_task = web.map(|w| w.task);

        Ok(Self {
            config,
            control,
            workspace_root,
            bus,
            client,
            pricing,
            registry,
            exec_ctx,
            cancel,
            instances,
            dispatcher,
            web_port,
            web_commands,
            web_task: std::sync::Mutex::new(web_task),
            interrupt_task: std::sync::Mutex::new(interrupt_task),
            current_run: std::sync::Mutex::new(None),
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Dependencies for one agent-loop run under `cancel`.
    pub fn loop_deps(&self, cancel: CancellationToken) -> LoopDeps {
        LoopDeps {
            client: Arc::clone(&self.client),
            registry: Arc::clone(&self.registry),
            bus: self.bus.clone(),
            pricing: Arc::clone(&self.pricing),
            store: RunStateStore::new(&self.control),
            config: Arc::clone(&self.config),
            workspace_root: self.workspace_root.clone(),
            cancel: cancel.clone(),
            exec_ctx: self.exec_ctx.clone().with_cancel(cancel),
        }
    }

    /// Run one intent through the loop, resuming compatible persisted state
    /// when its intent matches.  Returns the summary.
    pub async fn run_intent(&self, intent: &str) -> RunSummary {
        // Each run gets a child token so the web UI can cancel just this
        // run while ctrl-c still tears down the whole scope.
        let run_cancel = self.cancel.child_token();
        *self.current_run.lock().unwrap() = Some(run_cancel.clone());

        let deps = self.loop_deps(run_cancel);
        let store = RunStateStore::new(&self.control);
        let resumable: Option<AgentState> = store
            .load_resumable(&self.config)
            .filter(|s| s.user_intent == intent);

        let agent = match resumable {
            Some(state) => {
                info!(run_id = %state.run_id, "resuming persisted run");
                AgentLoop::resume(state, deps)
            }
            None => AgentLoop::new(intent, deps),
        };

        let (_state, summary) = agent.run().await;
        *self.current_run.lock().unwrap() = None;
        self.record_insight(&summary);
        summary
    }

    /// Cancel the run currently in flight, if any (web cancel endpoint).
    pub fn cancel_current_run(&self) {
        if let Some(token) = self.current_run.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Append the run summary to the insights journal for `ledit insights`.
    fn record_insight(&self, summary: &RunSummary) {
        use std::io::Write;
        let path = self.control.root().join("insights.jsonl");
        if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            if let Ok(line) = serde_json::to_string(summary) {
                let _ = writeln!(f, "{line}");
            }
        }
    }

    /// Tear down: cancel the scope, close the bus, drop the instance entry.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.interrupt_task.lock().unwrap().take() {
            task.abort();
        }
        let web_task = self.web_task.lock().unwrap().take();
        if let Some(task) = web_task {
            // Graceful shutdown rides the token; give it a moment.
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), task).await;
        }
        self.bus.emit(EventKind::Shutdown, serde_json::json!({}));
        self.bus.close();
        self.instances.deregister();
    }
}
