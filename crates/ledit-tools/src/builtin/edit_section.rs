// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;

use crate::tool::{Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolResult};

/// The file's dominant end-of-line style.  Edits re-apply it to replacement
/// text so a single edit never flips a CRLF file to LF or vice versa.
pub(crate) fn detect_eol(content: &str) -> &'static str {
    if content.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Normalize `text` to the given EOL style.
pub(crate) fn apply_eol(text: &str, eol: &str) -> String {
    let unix = text.replace("\r\n", "\n");
    if eol == "\n" {
        unix
    } else {
        unix.replace('\n', eol)
    }
}

/// One-line summary of how small the change actually was.
pub(crate) fn diff_stats(before: &str, after: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(before, after);
    let mut added = 0;
    let mut removed = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Insert => added += 1,
            similar::ChangeTag::Delete => removed += 1,
            similar::ChangeTag::Equal => {}
        }
    }
    (added, removed)
}

/// Built-in tool that replaces one exact section of a file.
pub struct EditSectionTool;

#[async_trait]
impl Tool for EditSectionTool {
    fn name(&self) -> &str {
        "edit_file_section"
    }

    fn description(&self) -> &str {
        "Replace one exact occurrence of 'old_text' in a file with 'new_text'. \
         'old_text' must match exactly once; include surrounding lines to \
         disambiguate. Produces the smallest sufficient change and preserves \
         the file's end-of-line style."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace root"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to replace (must occur exactly once)"
                },
                "new_text": {
                    "type": "string",
                    "description": "Replacement text"
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::fs_write()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let (raw, old_text, new_text) = match (
            call.args.get("path").and_then(Value::as_str),
            call.args.get("old_text").and_then(Value::as_str),
            call.args.get("new_text").and_then(Value::as_str),
        ) {
            (Some(p), Some(o), Some(n)) => (p, o, n),
            _ => {
                return ToolResult::err(
                    &call.id,
                    ErrorKind::InvalidArgs,
                    "requires 'path', 'old_text' and 'new_text'",
                )
            }
        };
        if old_text.is_empty() {
            return ToolResult::err(&call.id, ErrorKind::InvalidArgs, "'old_text' is empty");
        }
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
        let needle = apply_eol(old_text, eol);
        let matches = content.matches(&needle).count();
        if matches == 0 {
            return ToolResult::err(
                &call.id,
                ErrorKind::NotFound,
                format!("'old_text' not found in {raw}; re-read the file and retry with exact text"),
            );
        }
        if matches > 1 {
            return ToolResult::err(
                &call.id,
                ErrorKind::InvalidArgs,
                format!(
                    "'old_text' occurs {matches} times in {raw}; include more surrounding \
                     context so the match is unique"
                ),
            );
        }

        let replacement = apply_eol(new_text, eol);
        let updated = content.replacen(&needle, &replacement, 1);

        ctx.snapshot_for_revision(&path);
        if let Err(e) = std::fs::write(&path, &updated) {
            return ToolResult::err(&call.id, ErrorKind::Internal, format!("{raw}: {e}"));
        }

        let (added, removed) = diff_stats(&content, &updated);
        ToolResult::ok(&call.id, format!("edited {raw}: +{added} -{removed} lines"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
