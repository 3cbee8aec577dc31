// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Central tool registry and the dispatch pipeline every call runs through:
//! resolution → argument validation → safety interceptor → cache check →
//! dry-run short-circuit → execution → normalization → error classification.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use ledit_cache::{canonical_key, EvidenceCache, FileValidator};

use crate::interceptor::{CallClass, Interceptor};
use crate::redact::{truncate_with_marker, Redactor};
use crate::tool::{spec_of, ErrorKind, ExecContext, Tool, ToolCall, ToolResult, ToolSpec};

/// Grace added on top of the configured tool timeout for the registry-level
/// backstop, so tools that manage their own deadline (shell) report the
/// richer timeout message before the backstop fires.
const TIMEOUT_GRACE_SECS: u64 = 10;

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    interceptor: Interceptor,
    redactor: Redactor,
    cache: Option<Arc<EvidenceCache>>,
    output_cap: usize,
    timeout: Duration,
    dry_run: bool,
    /// Serializes writes to the same path across parallel sub-agents.
    write_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl ToolRegistry {
    pub fn new(cfg: &ledit_config::ToolsConfig) -> Self {
        Self {
            tools: HashMap::new(),
            interceptor: Interceptor::from_config(cfg),
            redactor: Redactor::from_config(&cfg.secret_patterns),
            cache: None,
            output_cap: cfg.output_cap_bytes,
            timeout: Duration::from_secs(cfg.timeout_secs + TIMEOUT_GRACE_SECS),
            dry_run: false,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<EvidenceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Specs for all registered tools, name-sorted so the schema block sent
    /// to the model is stable across runs.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| spec_of(t.as_ref())).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Run one call through the full dispatch pipeline.  Never returns
    /// `Err`: every failure mode is a classified [`ToolResult`].
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let started = Instant::now();
        let mut result = self.dispatch_inner(call, ctx).await;
        result.duration = started.elapsed();
        if !result.success && result.error_kind.is_none() {
            result.error_kind = Some(ErrorKind::Internal);
        }
        result
    }

    async fn dispatch_inner(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        // 1. Resolution - an unknown name never reaches a tool.
        let Some(tool) = self.tools.get(&call.name).cloned() else {
            return ToolResult::err(
                &call.id,
                ErrorKind::InvalidArgs,
                format!(
                    "unknown tool '{}'; available tools: {}",
                    call.name,
                    self.names().join(", ")
                ),
            );
        };
        let caps = tool.capabilities();

        // 2. Argument validation against the parameter schema.
        if let Err(hint) = validate_args(&tool.parameters_schema(), &call.args) {
            return ToolResult::err(
                &call.id,
                ErrorKind::InvalidArgs,
                format!("invalid arguments for {}: {hint}", call.name),
            );
        }

        // 3. Safety interceptor: classify, normalize, check.
        let mut call = call.clone();
        self.interceptor.normalize(&mut call, &ctx.workspace_root);
        let class = self.interceptor.classify(caps, &call);
        if let Err((kind, msg)) = self.interceptor.check(class, &call, &ctx.workspace_root) {
            return ToolResult::err(&call.id, kind, msg);
        }

        // 4. Cache check (read-only classified calls only).  Shell keys
        //    additionally cover the working directory and an environment
        //    fingerprint: the same `git status` in a different directory or
        //    under a different PATH is a different observation.
        let cache_key = match (&self.cache, class.cacheable()) {
            (Some(_), true) => {
                let key_args = if matches!(class, CallClass::Shell { .. }) {
                    let mut augmented = call.args.clone();
                    if let Some(obj) = augmented.as_object_mut() {
                        obj.entry("workdir").or_insert_with(|| {
                            Value::String(ctx.workspace_root.to_string_lossy().into_owned())
                        });
                        obj.insert("env".into(), Value::String(env_fingerprint()));
                    }
                    augmented
                } else {
                    call.args.clone()
                };
                Some(canonical_key(&call.name, &key_args, &ctx.workspace_root))
            }
            _ => None,
        };
        let _key_guard = match (&self.cache, &cache_key) {
            (Some(cache), Some(key)) => {
                let guard = cache.lock_key(key).await;
                if let Some(hit) = cache.lookup(key) {
                    debug!(tool = %call.name, "served from evidence cache");
                    let mut r = ToolResult::ok(&call.id, hit);
                    r.served_from_cache = true;
                    return r;
                }
                Some(guard)
            }
            _ => None,
        };

        // 5. Dry-run short-circuit: simulate anything that would mutate.
        if self.dry_run && class.mutating() {
            let mut r = ToolResult::ok(
                &call.id,
                format!("[dry-run] {} not executed; arguments: {}", call.name, call.args),
            );
            r.dry_run = true;
            return r;
        }

        // 6. Execution, serialized per write path, with a deadline backstop
        //    and panic isolation.
        let _path_guard = match (class.mutating(), self.write_target(&call, ctx)) {
            (true, Some(path)) => Some(self.lock_path(path).await),
            _ => None,
        };

        let exec_tool = Arc::clone(&tool);
        let exec_call = call.clone();
        let exec_ctx = ctx.clone();
        let handle =
            tokio::spawn(async move { exec_tool.execute(&exec_call, &exec_ctx).await });
        let abort_handle = handle.abort_handle();

        let mut result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                abort_handle.abort();
                ToolResult::err(&call.id, ErrorKind::Internal, "execution cancelled")
            }
            joined = tokio::time::timeout(self.timeout, handle) => match joined {
                Err(_) => ToolResult::err(
                    &call.id,
                    ErrorKind::Timeout,
                    format!("{} exceeded its deadline", call.name),
                ),
                Ok(Err(join_err)) => ToolResult::err(
                    &call.id,
                    ErrorKind::Internal,
                    format!("tool execution panicked: {join_err}"),
                ),
                Ok(Ok(r)) => r,
            },
        };

        // 7. Normalization: secret redaction then the deterministic length cap.
        let (redacted, hit) = self.redactor.redact(&result.output);
        if hit {
            result.output = redacted;
            result.redacted = true;
        }
        let (bounded, _cut) = truncate_with_marker(&result.output, self.output_cap);
        result.output = bounded;

        // Populate the cache after a successful read-only execution.
        if result.success {
            if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                cache.insert(key, &result.output, self.file_validator(caps, &call, ctx));
            }
        }

        result
    }

    /// Content-hash validator for file-derived cache entries.
    fn file_validator(
        &self,
        caps: crate::tool::Capabilities,
        call: &ToolCall,
        ctx: &ExecContext,
    ) -> Option<FileValidator> {
        if !caps.reads_fs {
            return None;
        }
        let raw = call.args.get("path").and_then(Value::as_str)?;
        let hash = ledit_cache::file_content_hash(&ctx.resolve(raw))?;
        Some(FileValidator {
            path: PathBuf::from(raw),
            content_hash: hash,
        })
    }

    fn write_target(&self, call: &ToolCall, ctx: &ExecContext) -> Option<PathBuf> {
        let raw = call
            .args
            .get("path")
            .or_else(|| call.args.get("file"))
            .and_then(Value::as_str)?;
        Some(ctx.resolve(raw))
    }

    async fn lock_path(&self, path: PathBuf) -> tokio::sync::OwnedMutexGuard<()> {
        let m = {
            let mut locks = self.write_locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(path)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        m.lock_owned().await
    }
}

/// Environment variables that change what a shell command observes.  Only
/// these names feed the cache key; values of anything secret-shaped never
/// leave the process.
const ENV_KEY_VARS: &[&str] = &["PATH", "HOME", "LANG", "CC", "CXX", "RUSTFLAGS"];

fn env_fingerprint() -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for name in ENV_KEY_VARS {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(std::env::var(name).unwrap_or_default().as_bytes());
        hasher.update(b"\x1f");
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Validate `args` against a JSON-schema-shaped parameter description.
/// Covers the subset the tools actually declare: `required` membership and
/// primitive `type` tags on `properties`.
fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    if !args.is_object() {
        return Err("arguments must be a JSON object".into());
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if args.get(name).is_none() {
                return Err(format!("missing required field '{name}'"));
            }
        }
    }
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            let Some(value) = args.get(name) else { continue };
            let Some(expected) = prop.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(format!(
                    "field '{name}' should be of type {expected}, got {}",
                    json_type_name(value)
                ));
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, v: &Value) -> bool {
    match expected {
        "string" => v.is_string(),
        "integer" => v.is_i64() || v.is_u64(),
        "number" => v.is_number(),
        "boolean" => v.is_boolean(),
        "array" => v.is_array(),
        "object" => v.is_object(),
        _ => true,
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
