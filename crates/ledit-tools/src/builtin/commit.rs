// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builtin::shell::RunShellTool;
use crate::tool::{Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolResult};

/// Built-in tool that commits staged (or all) changes with a given message.
/// Message generation lives in the `commit` CLI command; this tool only
/// performs the git operation.
pub struct CommitTool;

#[async_trait]
impl Tool for CommitTool {
    fn name(&self) -> &str {
        "commit"
    }

    fn description(&self) -> &str {
        "Create a git commit with the given message. Set 'stage_all' to \
         stage every tracked change first; otherwise only what is already \
         staged is committed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Commit message"
                },
                "stage_all": {
                    "type": "boolean",
                    "description": "Run 'git add -A' before committing (default false)"
                }
            },
            "required": ["message"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::shell()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let message = match call.args.get("message").and_then(Value::as_str) {
            Some(m) if !m.trim().is_empty() => m,
            _ => return ToolResult::err(&call.id, ErrorKind::InvalidArgs, "missing 'message'"),
        };
        let stage_all = call
            .args
            .get("stage_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // Single-quote the message for the shell; embedded quotes are the
        // only thing that needs escaping.
        let quoted = format!("'{}'", message.replace('\'', r"'\''"));
        let command = if stage_all {
            format!("git add -A && git commit -m {quoted}")
        } else {
            format!("git commit -m {quoted}")
        };

        let shell_call = ToolCall {
            id: call.id.clone(),
            name: "run_shell".into(),
            args: json!({ "command": command }),
        };
        RunShellTool.execute(&shell_call, ctx).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn ctx(root: &std::path::Path) -> ExecContext {
        ExecContext::new(root, Arc::new(ledit_config::ToolsConfig::default()))
    }

    async fn git(root: &std::path::Path, args: &str) {
        let call = ToolCall {
            id: "g".into(),
            name: "run_shell".into(),
            args: json!({ "command": format!("git {args}") }),
        };
        let r = RunShellTool.execute(&call, &ctx(root)).await;
        assert!(r.success, "git {args}: {}", r.output);
    }

    #[tokio::test]
    async fn commits_staged_changes() {
        let tmp = tempfile::tempdir().unwrap();
        git(tmp.path(), "init -q").await;
        git(tmp.path(), "config user.email t@t && git config user.name t").await;
        std::fs::write(tmp.path().join("f.txt"), "hi").unwrap();

        let call = ToolCall {
            id: "1".into(),
            name: "commit".into(),
            args: json!({"message": "it's a test", "stage_all": true}),
        };
        let r = CommitTool.execute(&call, &ctx(tmp.path())).await;
        assert!(r.success, "{}", r.output);

        let log = ToolCall {
            id: "2".into(),
            name: "run_shell".into(),
            args: json!({"command": "git log --oneline"}),
        };
        let out = RunShellTool.execute(&log, &ctx(tmp.path())).await;
        assert!(out.output.contains("it's a test"));
    }

    #[tokio::test]
    async fn empty_message_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let call = ToolCall {
            id: "1".into(),
            name: "commit".into(),
            args: json!({"message": "  "}),
        };
        let r = CommitTool.execute(&call, &ctx(tmp.path())).await;
        assert_eq!(r.error_kind, Some(ErrorKind::InvalidArgs));
    }
}
