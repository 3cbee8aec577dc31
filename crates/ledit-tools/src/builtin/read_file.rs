// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolResult};

/// Built-in tool that returns a file's content, optionally a line window.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace and return its content. \
         Use 'offset' (1-based line) and 'limit' to read a window of a large file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace root"
                },
                "offset": {
                    "type": "integer",
                    "description": "First line to return, 1-based (optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (optional)"
                }
            },
            "required": ["path"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let raw = match call.args.get("path").and_then(Value::as_str) {
            Some(p) => p,
            None => return ToolResult::err(&call.id, ErrorKind::InvalidArgs, "missing 'path'"),
        };
        let path = ctx.resolve(raw);

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolResult::err(
                    &call.id,
                    ErrorKind::NotFound,
                    format!("file not found: {raw}"),
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return ToolResult::err(&call.id, ErrorKind::Permission, format!("{raw}: {e}"));
            }
            Err(e) => {
                return ToolResult::err(&call.id, ErrorKind::Internal, format!("{raw}: {e}"));
            }
        };

        let offset = call.args.get("offset").and_then(Value::as_u64);
        let limit = call.args.get("limit").and_then(Value::as_u64);
        let out = match (offset, limit) {
            (None, None) => content,
            (offset, limit) => {
                let skip = offset.unwrap_or(1).saturating_sub(1) as usize;
                let take = limit.unwrap_or(u64::MAX) as usize;
                content
                    .lines()
                    .skip(skip)
                    .take(take)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        ToolResult::ok(&call.id, out)
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

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "read_file".into(),
            args,
        }
    }

    #[tokio::test]
    async fn reads_whole_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "line1\nline2\n").unwrap();
        let r = ReadFileTool
            .execute(&call(json!({"path": "a.txt"})), &ctx(tmp.path()))
            .await;
        assert!(r.success);
        assert_eq!(r.output, "line1\nline2\n");
    }

    #[tokio::test]
    async fn offset_and_limit_window() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "1\n2\n3\n4\n5\n").unwrap();
        let r = ReadFileTool
            .execute(
                &call(json!({"path": "a.txt", "offset": 2, "limit": 2})),
                &ctx(tmp.path()),
            )
            .await;
        assert_eq!(r.output, "2\n3");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let r = ReadFileTool
            .execute(&call(json!({"path": "no.txt"})), &ctx(tmp.path()))
            .await;
        assert_eq!(r.error_kind, Some(ErrorKind::NotFound));
    }
}
