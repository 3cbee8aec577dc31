// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolResult};

/// Built-in tool that writes a complete file, creating parents as needed.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file with the given content. \
         Prefer edit_file_section or micro_edit for changes to existing files - \
         full rewrites lose unrelated local changes and bloat diffs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Complete new file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::fs_write()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let raw = match call.args.get("path").and_then(Value::as_str) {
            Some(p) => p,
            None => return ToolResult::err(&call.id, ErrorKind::InvalidArgs, "missing 'path'"),
        };
        let content = match call.args.get("content").and_then(Value::as_str) {
            Some(c) => c,
            None => return ToolResult::err(&call.id, ErrorKind::InvalidArgs, "missing 'content'"),
        };
        let path = ctx.resolve(raw);

        ctx.snapshot_for_revision(&path);

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return ToolResult::err(&call.id, ErrorKind::Internal, format!("{raw}: {e}"));
            }
        }
        match std::fs::write(&path, content) {
            Ok(()) => ToolResult::ok(&call.id, format!("wrote {} bytes to {raw}", content.len())),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ToolResult::err(&call.id, ErrorKind::Permission, format!("{raw}: {e}"))
            }
            Err(e) => ToolResult::err(&call.id, ErrorKind::Internal, format!("{raw}: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
