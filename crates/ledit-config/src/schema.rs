// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper - returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub budgets: BudgetConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Named provider configurations.
    ///
    /// Define failover targets, local servers, or additional accounts here
    /// and reference them by name in `routing.failover` or with
    /// `--model <key>/<model>`.
    ///
    /// ```json
    /// {
    ///   "providers": {
    ///     "local": { "provider": "ollama", "name": "qwen2.5-coder" },
    ///     "backup": { "provider": "openrouter", "name": "deepseek/deepseek-chat" }
    ///   }
    /// }
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

impl Config {
    /// Stable fingerprint over the fields that affect loop semantics.
    ///
    /// Persisted run state records this snapshot; a resume offer is only
    /// made when the stored snapshot matches the active configuration, so a
    /// model or cap change invalidates stale state instead of silently
    /// continuing under different rules.
    pub fn snapshot_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let subset = serde_json::json!({
            "model": { "provider": self.model.provider, "name": self.model.name },
            "routing": self.routing,
            "budgets": self.budgets,
            "max_iterations": self.agent.max_iterations,
            "subagents": self.agent.subagents_enabled,
        });
        let mut hasher = Sha256::new();
        hasher.update(subset.to_string().as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier.  Run `ledit instances --providers` for the full
    /// list.  Common values: "openai" | "anthropic" | "groq" | "deepseek" |
    /// "openrouter" | "ollama" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    /// When unset, the driver registry's conventional `<PROVIDER>_API_KEY`
    /// name is used.
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies or self-hosted servers.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
        }
    }
}

fn default_max_iterations() -> u32 {
    40
}
fn default_plan_retries() -> u32 {
    3
}
fn default_policy_version() -> String {
    "v2-adaptive".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard iteration cap for one run of the agent loop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// How many schema-reminder retries a malformed planner response gets
    /// before the run fails with an internal error.
    #[serde(default = "default_plan_retries")]
    pub plan_retry_limit: u32,
    /// Stream model output to the console as it arrives.
    #[serde(default = "default_true")]
    pub stream: bool,
    /// Simulate mutating tools instead of executing them.
    #[serde(default)]
    pub dry_run: bool,
    /// Allow the `run_subagent` / `run_parallel_subagents` tools.
    #[serde(default = "default_true")]
    pub subagents_enabled: bool,
    /// Skip interactive confirmations (also implied by CI=1).
    #[serde(default)]
    pub skip_prompt: bool,
    /// Identifies the prompt/loop-policy bundle in use; logged and persisted
    /// for reproducibility and resume compatibility.
    #[serde(default = "default_policy_version")]
    pub policy_version: String,
    /// Policy variant label (A/B experiments); free-form.
    #[serde(default)]
    pub policy_variant: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            plan_retry_limit: default_plan_retries(),
            stream: true,
            dry_run: false,
            subagents_enabled: true,
            skip_prompt: false,
            policy_version: default_policy_version(),
            policy_variant: String::new(),
        }
    }
}

fn default_token_cap() -> u64 {
    400_000
}
fn default_cost_cap() -> f64 {
    4.0
}
fn default_time_cap() -> u64 {
    1_800
}
fn default_soft_fraction() -> f64 {
    0.8
}

/// Caps for the four bounded run dimensions.  Each dimension emits one
/// soft warning at `soft_fraction × cap` and terminates the loop at the cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Total tokens (prompt + completion) across the whole run.
    #[serde(default = "default_token_cap")]
    pub token_cap: u64,
    /// Dollar ceiling, priced from the model pricing table.
    #[serde(default = "default_cost_cap")]
    pub cost_cap_usd: f64,
    /// Wall-clock ceiling in seconds.
    #[serde(default = "default_time_cap")]
    pub time_cap_secs: u64,
    /// Fraction of a cap at which the soft warning fires.
    #[serde(default = "default_soft_fraction")]
    pub soft_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            token_cap: default_token_cap(),
            cost_cap_usd: default_cost_cap(),
            time_cap_secs: default_time_cap(),
            soft_fraction: default_soft_fraction(),
        }
    }
}

fn default_tool_timeout() -> u64 {
    60
}
fn default_output_cap() -> usize {
    20_000
}
fn default_shell() -> String {
    "bash".into()
}
fn default_cpu_limit() -> u64 {
    120
}
fn default_mem_limit() -> u64 {
    2 * 1024 * 1024 * 1024
}
fn default_file_size_limit() -> u64 {
    64 * 1024 * 1024
}
fn default_denylist() -> Vec<String> {
    [
        "shutdown *",
        "reboot *",
        "mkfs*",
        "dd if=*of=/dev/*",
        ":(){ *",
        "sudo *",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default per-tool execution deadline in seconds.
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Byte cap for normalized tool output; beyond it the deterministic
    /// truncation marker is appended.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
    /// Shell binary used by `run_shell` (overridden by LEDIT_SHELL).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// CPU-seconds rlimit for spawned shell commands.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit_secs: u64,
    /// Address-space rlimit in bytes for spawned shell commands.
    #[serde(default = "default_mem_limit")]
    pub mem_limit_bytes: u64,
    /// Largest file a spawned command may create (RLIMIT_FSIZE).
    #[serde(default = "default_file_size_limit")]
    pub file_size_limit_bytes: u64,
    /// Glob patterns for shell commands that are always rejected.
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
    /// Extra secret-detection regexes merged with the built-in set before
    /// output redaction.
    #[serde(default)]
    pub secret_patterns: Vec<String>,
    /// Permit file writes outside the workspace root.  Off by default; the
    /// interceptor rejects such writes with a permission error.
    #[serde(default)]
    pub allow_outside_writes: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            output_cap_bytes: default_output_cap(),
            shell: default_shell(),
            cpu_limit_secs: default_cpu_limit(),
            mem_limit_bytes: default_mem_limit(),
            file_size_limit_bytes: default_file_size_limit(),
            denylist: default_denylist(),
            secret_patterns: Vec::new(),
            allow_outside_writes: false,
        }
    }
}

/// Static model routing: control-plane turns (planning, evaluation) may use
/// a cheaper model than codegen turns.  Values name entries in
/// `Config::providers`; `None` falls back to the primary model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Provider key for planner/evaluator turns.
    pub control: Option<String>,
    /// Provider key for codegen turns.
    pub codegen: Option<String>,
    /// Prioritized failover list consulted when the active provider is
    /// unhealthy.  Entries name keys in `Config::providers`.
    #[serde(default)]
    pub failover: Vec<String>,
    /// Seconds a failed provider stays quarantined before re-probe.
    #[serde(default = "default_cooldown")]
    pub quarantine_secs: u64,
}

fn default_cooldown() -> u64 {
    300
}

fn default_port_start() -> u16 {
    8998
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Serve the embedded web UI alongside interactive runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// First port tried; the server scans upward for a free one.
    #[serde(default = "default_port_start")]
    pub port_start: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port_start: default_port_start(),
        }
    }
}

fn default_cache_entries() -> usize {
    2_048
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// LRU bound on in-memory entries; the persisted store is compacted to
    /// the same bound on open.
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_entries(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
