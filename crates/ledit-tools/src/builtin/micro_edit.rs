// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builtin::edit_section::{apply_eol, detect_eol, diff_stats};
use crate::tool::{Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolResult};

/// Built-in tool for minimal-span line edits: insert a line (or block)
/// before/after a location, or replace a single line, without rewriting the
/// rest of the file.
pub struct MicroEditTool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    InsertBefore,
    InsertAfter,
    ReplaceLine,
}

impl Mode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "insert_before" => Some(Self::InsertBefore),
            "insert_after" => Some(Self::InsertAfter),
            "replace_line" => Some(Self::ReplaceLine),
            _ => None,
        }
    }
}

#[async_trait]
impl Tool for MicroEditTool {
    fn name(&self) -> &str {
        "micro_edit"
    }

    fn description(&self) -> &str {
        "Apply a minimal line-level edit: insert 'text' before/after a \
         location, or replace one line. The location is either 'line' \
         (1-based) or 'anchor' (first line containing that text). \
         Preserves the file's end-of-line style."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace root"
                },
                "mode": {
                    "type": "string",
                    "enum": ["insert_before", "insert_after", "replace_line"],
                    "description": "What to do at the located line"
                },
                "line": {
                    "type": "integer",
                    "description": "Target line, 1-based (alternative to 'anchor')"
                },
                "anchor": {
                    "type": "string",
                    "description": "Locate the first line containing this text"
                },
                "text": {
                    "type": "string",
                    "description": "Line or block to insert / replacement line"
                }
            },
            "required": ["path", "mode", "text"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::fs_write()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let (raw, mode_str, text) = match (
            call.args.get("path").and_then(Value::as_str),
            call.args.get("mode").and_then(Value::as_str),
            call.args.get("text").and_then(Value::as_str),
        ) {
            (Some(p), Some(m), Some(t)) => (p, m, t),
            _ => {
                return ToolResult::err(
                    &call.id,
                    ErrorKind::InvalidArgs,
                    "requires 'path', 'mode' and 'text'",
                )
            }
        };
        let Some(mode) = Mode::parse(mode_str) else {
            return ToolResult::err(
                &call.id,
                ErrorKind::InvalidArgs,
                format!("unknown mode '{mode_str}'; use insert_before, insert_after or replace_line"),
            );
        };

        let path = ctx.resolve(raw);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolResult::err(
                    &call.id,
                    ErrorKind::NotFound,
                    format!("file not found: {raw}"),
                )
            }
            Err(e) => return ToolResult::err(&call.id, ErrorKind::Internal, format!("{raw}: {e}")),
        };

        let eol = detect_eol(&content);
        let had_trailing_eol = content.ends_with('\n') || content.is_empty();
        let mut lines: Vec<String> = content.lines().map(String::from).collect();

        // Locate the target line.  An explicit line number wins; otherwise
        // the anchor text picks the first containing line.
        let idx = if let Some(n) = call.args.get("line").and_then(Value::as_u64) {
            if n == 0 || (n as usize) > lines.len().max(1) {
                return ToolResult::err(
                    &call.id,
                    ErrorKind::InvalidArgs,
                    format!("line {n} out of range (file has {} lines)", lines.len()),
                );
            }
            (n as usize) - 1
        } else if let Some(anchor) = call.args.get("anchor").and_then(Value::as_str) {
            match lines.iter().position(|l| l.contains(anchor)) {
                Some(i) => i,
                None => {
                    return ToolResult::err(
                        &call.id,
                        ErrorKind::NotFound,
                        format!("anchor text not found in {raw}: {anchor}"),
                    )
                }
            }
        } else {
            return ToolResult::err(
                &call.id,
                ErrorKind::InvalidArgs,
                "provide either 'line' or 'anchor'",
            );
        };

        let new_lines: Vec<String> = text.replace("\r\n", "\n").split('\n').map(String::from).collect();
        match mode {
            Mode::InsertBefore => {
                let at = idx.min(lines.len());
                for (k, l) in new_lines.into_iter().enumerate() {
                    lines.insert(at + k, l);
                }
            }
            Mode::InsertAfter => {
                // An empty file has no line to come after; append instead.
                let at = (idx + 1).min(lines.len());
                for (k, l) in new_lines.into_iter().enumerate() {
                    lines.insert(at + k, l);
                }
            }
            Mode::ReplaceLine => {
                if idx >= lines.len() {
                    return ToolResult::err(
                        &call.id,
                        ErrorKind::InvalidArgs,
                        "cannot replace a line in an empty file",
                    );
                }
                lines.splice(idx..idx + 1, new_lines);
            }
        }

        let mut updated = lines.join("\n");
        if had_trailing_eol && !updated.is_empty() {
            updated.push('\n');
        }
        let updated = apply_eol(&updated, eol);

        ctx.snapshot_for_revision(&path);
        if let Err(e) = std::fs::write(&path, &updated) {
            return ToolResult::err(&call.id, ErrorKind::Internal, format!("{raw}: {e}"));
        }

        let (added, removed) = diff_stats(&content, &updated);
        ToolResult::ok(
            &call.id,
            format!("micro-edited {raw} at line {}: +{added} -{removed} lines", idx + 1),
        )
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
            name: "micro_edit".into(),
            args,
        }
    }

    #[tokio::test]
    async fn inserts_before_first_line() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("main.go"), "package main\n").unwrap();
        let r = MicroEditTool
            .execute(
                &call(json!({
                    "path": "main.go",
                    "mode": "insert_before",
                    "line": 1,
                    "text": "// agent: generated"
                })),
                &ctx(tmp.path()),
            )
            .await;
        assert!(r.success, "{}", r.output);
        let content = std::fs::read_to_string(tmp.path().join("main.go")).unwrap();
        assert_eq!(content, "// agent: generated\npackage main\n");
    }

    #[tokio::test]
    async fn inserts_after_anchor() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "a\nb\nc\n").unwrap();
        let r = MicroEditTool
            .execute(
                &call(json!({
                    "path": "f.txt",
                    "mode": "insert_after",
                    "anchor": "b",
                    "text": "b2"
                })),
                &ctx(tmp.path()),
            )
            .await;
        assert!(r.success);
        let content = std::fs::read_to_string(tmp.path().join("f.txt")).unwrap();
        assert_eq!(content, "a\nb\nb2\nc\n");
    }

    #[tokio::test]
    async fn replaces_single_line() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "a\nb\nc\n").unwrap();
        let r = MicroEditTool
            .execute(
                &call(json!({
                    "path": "f.txt",
                    "mode": "replace_line",
                    "line": 2,
                    "text": "B"
                })),
                &ctx(tmp.path()),
            )
            .await;
        assert!(r.success);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("f.txt")).unwrap(),
            "a\nB\nc\n"
        );
    }

    #[tokio::test]
    async fn out_of_range_line_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "a\n").unwrap();
        let r = MicroEditTool
            .execute(
                &call(json!({"path": "f.txt", "mode": "replace_line", "line": 9, "text": "x"})),
                &ctx(tmp.path()),
            )
            .await;
        assert_eq!(r.error_kind, Some(ErrorKind::InvalidArgs));
    }

    #[tokio::test]
    async fn missing_anchor_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "a\n").unwrap();
        let r = MicroEditTool
            .execute(
                &call(json!({"path": "f.txt", "mode": "insert_after", "anchor": "zz", "text": "x"})),
                &ctx(tmp.path()),
            )
            .await;
        assert_eq!(r.error_kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn crlf_file_keeps_crlf() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("w.txt"), "one\r\ntwo\r\n").unwrap();
        let r = MicroEditTool
            .execute(
                &call(json!({"path": "w.txt", "mode": "insert_after", "line": 1, "text": "mid"})),
                &ctx(tmp.path()),
            )
            .await;
        assert!(r.success);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("w.txt")).unwrap(),
            "one\r\nmid\r\ntwo\r\n"
        );
    }
}
