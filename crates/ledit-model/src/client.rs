// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider client: failover, backoff, routing, and stream accumulation.
//!
//! The agent loop talks to this client only.  It owns a prioritized provider
//! list, probes health before first use, quarantines failed providers for a
//! cooldown, retries transient HTTP failures with exponential backoff and
//! full jitter, and routes control-plane turns (planning, evaluation) to a
//! cheaper model when one is configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    openai_compat::HttpStatusError, Completion, CompletionRequest, ModelProvider, ResponseEvent,
    ToolInvocation, TurnKind, Usage,
};

/// Output byte cap for control turns; planner/evaluator responses beyond it
/// are cut at the marker so their size is deterministic.
const CONTROL_OUTPUT_CAP: usize = 8 * 1024;

/// Marker appended when the control-turn bound truncates output.
pub const OUTPUT_TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// Errors surfaced to the loop, already mapped onto the error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Retries and failover both exhausted; the caller may try again later.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The request itself is unacceptable (4xx) or the client is misconfigured.
    #[error("provider failure: {0}")]
    Fatal(String),
    #[error("completion cancelled")]
    Cancelled,
}

/// Bounded exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-based): full-jitter exponential:
    /// a uniform draw over [0, min(initial · 2^attempt, max)].
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.initial_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        Duration::from_millis((rand::random::<f64>() * capped) as u64)
    }
}

struct ClientState {
    /// Provider name → quarantine expiry.
    quarantined: HashMap<String, Instant>,
    /// Providers whose health probe already ran this session.
    probed: std::collections::HashSet<String>,
    /// Name of the provider that served the last successful completion.
    active: Option<String>,
}

/// Provider-abstracted completion client with failover and routing.
pub struct ProviderClient {
    /// Priority-ordered candidates for codegen turns; index 0 is primary.
    providers: Vec<Arc<dyn ModelProvider>>,
    /// Optional cheaper model for control turns.
    control: Option<Arc<dyn ModelProvider>>,
    retry: RetryPolicy,
    quarantine: Duration,
    state: Mutex<ClientState>,
}

impl ProviderClient {
    pub fn new(
        providers: Vec<Arc<dyn ModelProvider>>,
        control: Option<Arc<dyn ModelProvider>>,
        retry: RetryPolicy,
        quarantine: Duration,
    ) -> Self {
        Self {
            providers,
            control,
            retry,
            quarantine,
            state: Mutex::new(ClientState {
                quarantined: HashMap::new(),
                probed: std::collections::HashSet::new(),
                active: None,
            }),
        }
    }

    /// Convenience constructor for a single provider (tests, sub-agents).
    pub fn single(provider: Arc<dyn ModelProvider>) -> Self {
        Self::new(vec![provider], None, RetryPolicy::default(), Duration::from_secs(300))
    }

    /// Name of the provider that served the most recent completion.
    pub fn active_provider(&self) -> Option<String> {
        self.state.lock().unwrap().active.clone()
    }

    /// Model name used for the given turn kind (for pricing lookups).
    pub fn model_for(&self, kind: TurnKind) -> String {
        match (kind, &self.control) {
            (TurnKind::Control, Some(p)) => p.model_name().to_string(),
            _ => self
                .providers
                .first()
                .map(|p| p.model_name().to_string())
                .unwrap_or_default(),
        }
    }

    /// Run one completion.  Text deltas stream into `sink` while the full
    /// response accumulates; control turns never stream and their output is
    /// bounded deterministically.
    pub async fn complete(
        &self,
        mut req: CompletionRequest,
        sink: Option<&mpsc::Sender<String>>,
        cancel: &CancellationToken,
    ) -> Result<Completion, ModelError> {
        let is_control = req.annotation == TurnKind::Control;
        if is_control {
            req.stream = false;
        }

        let candidates = self.candidates(is_control);
        if candidates.is_empty() {
            return Err(ModelError::Fatal("no providers configured".into()));
        }

        let mut last_err = String::new();
        for provider in candidates {
            let pname = provider.name().to_string();
            if self.is_quarantined(&pname) {
                debug!(provider = %pname, "skipping quarantined provider");
                continue;
            }
            if let Err(e) = self.ensure_probed(provider.as_ref()).await {
                warn!(provider = %pname, "health probe failed: {e}");
                self.quarantine(&pname);
                last_err = format!("{pname}: {e}");
                continue;
            }

            match self
                .complete_with_retries(provider.as_ref(), &req, sink, cancel, is_control)
                .await
            {
                Ok(done) => {
                    self.state.lock().unwrap().active = Some(pname);
                    return Ok(done);
                }
                Err(ModelError::Cancelled) => return Err(ModelError::Cancelled),
                Err(ModelError::Fatal(e)) => return Err(ModelError::Fatal(e)),
                Err(ModelError::Transient(e)) => {
                    warn!(provider = %pname, "provider exhausted retries: {e}; quarantining");
                    self.quarantine(&pname);
                    last_err = e;
                }
            }
        }

        Err(ModelError::Transient(format!(
            "all providers exhausted (last error: {last_err})"
        )))
    }

    fn candidates(&self, control: bool) -> Vec<Arc<dyn ModelProvider>> {
        let mut out = Vec::new();
        if control {
            if let Some(c) = &self.control {
                out.push(Arc::clone(c));
            }
        }
        out.extend(self.providers.iter().cloned());
        out
    }

    fn is_quarantined(&self, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.quarantined.get(name) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                state.quarantined.remove(name);
                false
            }
            None => false,
        }
    }

    fn quarantine(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .quarantined
            .insert(name.to_string(), Instant::now() + self.quarantine);
    }

    async fn ensure_probed(&self, provider: &dyn ModelProvider) -> anyhow::Result<()> {
        let fresh = self
            .state
            .lock()
            .unwrap()
            .probed
            .insert(provider.name().to_string());
        if fresh {
            provider.health().await?;
        }
        Ok(())
    }

    async fn complete_with_retries(
        &self,
        provider: &dyn ModelProvider,
        req: &CompletionRequest,
        sink: Option<&mpsc::Sender<String>>,
        cancel: &CancellationToken,
        bound_output: bool,
    ) -> Result<Completion, ModelError> {
        let mut last = String::new();
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay(attempt - 1);
                debug!(provider = provider.name(), attempt, ?delay, "backing off before retry");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            match self.attempt(provider, req, sink, cancel, bound_output).await {
                Ok(done) => return Ok(done),
                Err(ModelError::Transient(e)) => last = e,
                Err(other) => return Err(other),
            }
        }
        Err(ModelError::Transient(last))
    }

    async fn attempt(
        &self,
        provider: &dyn ModelProvider,
        req: &CompletionRequest,
        sink: Option<&mpsc::Sender<String>>,
        cancel: &CancellationToken,
        bound_output: bool,
    ) -> Result<Completion, ModelError> {
        use futures::StreamExt;

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            res = provider.complete(req.clone()) => res.map_err(classify)?,
        };

        let mut out = Completion::default();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                ev = stream.next() => ev,
            };
            let event = match event {
                None => break,
                Some(Ok(ev)) => ev,
                Some(Err(e)) => return Err(classify(e)),
            };
            match event {
                ResponseEvent::TextDelta(delta) => {
                    if let Some(sink) = sink {
                        let _ = sink.send(delta.clone()).await;
                    }
                    out.text.push_str(&delta);
                }
                ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let ptc = pending.entry(index).or_default();
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage(u) => out.usage.add(u),
                ResponseEvent::MaxTokens => {
                    warn!(provider = provider.name(), "completion hit output token limit");
                }
                ResponseEvent::Done => break,
            }
        }

        // Flush accumulated parallel tool calls, ordered by index.  Calls
        // with an empty name cannot be dispatched and are dropped; an empty
        // id gets a synthetic fallback so the turn can still complete.
        let mut pending: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        pending.sort_by_key(|(idx, _)| *idx);
        for (i, (_, ptc)) in pending.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name from model");
                continue;
            }
            let mut call = ptc.finish();
            if call.id.is_empty() {
                call.id = format!("tc_synthetic_{i}");
            }
            out.tool_calls.push(call);
        }

        if bound_output && out.text.len() > CONTROL_OUTPUT_CAP {
            out.text.truncate(CONTROL_OUTPUT_CAP);
            out.text.push_str(OUTPUT_TRUNCATION_MARKER);
            out.truncated = true;
        }

        Ok(out)
    }
}

/// Map a driver error onto the retryable/fatal split.  HTTP statuses carry
/// the decision; anything without a status (connect failure, reset stream)
/// is assumed transient.
fn classify(err: anyhow::Error) -> ModelError {
    match err.downcast_ref::<HttpStatusError>() {
        Some(http) if http.is_retryable() => ModelError::Transient(err.to_string()),
        Some(_) => ModelError::Fatal(err.to_string()),
        None => ModelError::Transient(err.to_string()),
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolInvocation {
        // Always resolve to a JSON object: the registry validates arguments
        // against the tool schema and `null` would mask the real problem.
        let arguments = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool_name = %self.name,
                        tool_call_id = %self.id,
                        error = %e,
                        "model sent tool call with invalid JSON arguments; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        ToolInvocation {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
