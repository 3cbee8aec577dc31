// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Classification of every non-success tool result.  Exactly one kind is
/// attached; the loop's propagation policy keys on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgs,
    Transient,
    Permission,
    NotFound,
    Timeout,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgs => "invalid_args",
            ErrorKind::Transient => "transient",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// What a tool is allowed to touch.  The interceptor derives its
/// classification from these flags plus the concrete arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub reads_fs: bool,
    pub mutates_fs: bool,
    pub runs_shell: bool,
    pub network: bool,
    pub spawns_agents: bool,
}

impl Capabilities {
    pub const fn read_only() -> Self {
        Self {
            reads_fs: true,
            mutates_fs: false,
            runs_shell: false,
            network: false,
            spawns_agents: false,
        }
    }

    pub const fn fs_write() -> Self {
        Self {
            reads_fs: true,
            mutates_fs: true,
            runs_shell: false,
            network: false,
            spawns_agents: false,
        }
    }

    pub const fn shell() -> Self {
        Self {
            reads_fs: true,
            mutates_fs: true,
            runs_shell: true,
            network: false,
            spawns_agents: false,
        }
    }

    pub const fn spawn() -> Self {
        Self {
            reads_fs: false,
            mutates_fs: false,
            runs_shell: false,
            network: false,
            spawns_agents: true,
        }
    }

    /// A call with none of the mutating flags may be served from cache.
    pub fn is_read_only(&self) -> bool {
        !self.mutates_fs && !self.runs_shell && !self.spawns_agents
    }
}

/// Static description of a registered tool, advertised to the model and
/// used by the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub capabilities: Capabilities,
}

/// The envelope returned for every dispatched call, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    /// Bounded, redacted text handed back to the model.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub duration: Duration,
    pub served_from_cache: bool,
    pub redacted: bool,
    /// True when dry-run mode simulated the call instead of executing it.
    pub dry_run: bool,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output: output.into(),
            error_kind: None,
            duration: Duration::ZERO,
            served_from_cache: false,
            redacted: false,
            dry_run: false,
        }
    }

    pub fn err(call_id: impl Into<String>, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: msg.into(),
            error_kind: Some(kind),
            duration: Duration::ZERO,
            served_from_cache: false,
            redacted: false,
            dry_run: false,
        }
    }
}

/// Receives prior file contents before a mutating tool touches them, so the
/// revision journal can offer rollback.
pub trait RevisionRecorder: Send + Sync {
    /// `prior` is `None` when the file did not exist.
    fn record(&self, path: &Path, prior: Option<&str>);
}

/// Per-run execution context shared by all tools.
#[derive(Clone)]
pub struct ExecContext {
    pub workspace_root: PathBuf,
    pub tools: Arc<ledit_config::ToolsConfig>,
    pub cancel: CancellationToken,
    pub revisions: Option<Arc<dyn RevisionRecorder>>,
}

impl ExecContext {
    pub fn new(workspace_root: impl Into<PathBuf>, tools: Arc<ledit_config::ToolsConfig>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            tools,
            cancel: CancellationToken::new(),
            revisions: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_revisions(mut self, recorder: Arc<dyn RevisionRecorder>) -> Self {
        self.revisions = Some(recorder);
        self
    }

    /// Resolve a (possibly relative) argument path against the workspace.
    pub fn resolve(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace_root.join(p)
        }
    }

    /// Record a file's current content into the revision journal.
    pub fn snapshot_for_revision(&self, path: &Path) {
        if let Some(rec) = &self.revisions {
            let prior = std::fs::read_to_string(path).ok();
            rec.record(path, prior.as_deref());
        }
    }
}

/// Trait that every built-in and user-registered tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    fn capabilities(&self) -> Capabilities;
    /// Execute the tool.  Failures are expressed through
    /// [`ToolResult::err`]; `Err` is reserved for panics caught upstream.
    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult;
}

pub fn spec_of(tool: &dyn Tool) -> ToolSpec {
    ToolSpec {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
        capabilities: tool.capabilities(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_capability_is_cacheable() {
        assert!(Capabilities::read_only().is_read_only());
        assert!(!Capabilities::fs_write().is_read_only());
        assert!(!Capabilities::shell().is_read_only());
        assert!(!Capabilities::spawn().is_read_only());
    }

    #[test]
    fn error_kind_display_matches_wire_form() {
        assert_eq!(ErrorKind::InvalidArgs.to_string(), "invalid_args");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
        let json = serde_json::to_string(&ErrorKind::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
    }

    #[test]
    fn ok_result_has_no_error_kind() {
        let r = ToolResult::ok("c1", "fine");
        assert!(r.success);
        assert!(r.error_kind.is_none());
        assert!(!r.served_from_cache);
    }

    #[test]
    fn err_result_carries_exactly_one_kind() {
        let r = ToolResult::err("c1", ErrorKind::Permission, "no");
        assert!(!r.success);
        assert_eq!(r.error_kind, Some(ErrorKind::Permission));
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let ctx = ExecContext::new("/w", Arc::new(ledit_config::ToolsConfig::default()));
        assert_eq!(ctx.resolve("/etc/hosts"), PathBuf::from("/etc/hosts"));
        assert_eq!(ctx.resolve("src/x.rs"), PathBuf::from("/w/src/x.rs"));
    }
}
