// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolResult};

const MAX_HITS: usize = 25;

/// Query interface to the workspace index maintained by the embedding
/// subsystem in `.ledit/workspace.json`.
///
/// The index itself is an external collaborator; this tool only reads it.
/// Expected shape: `{"files": {"<path>": {"summary": "...", "exports": [...]}}}`.
pub struct WorkspaceContextTool;

#[async_trait]
impl Tool for WorkspaceContextTool {
    fn name(&self) -> &str {
        "workspace_context"
    }

    fn description(&self) -> &str {
        "Query the workspace index for files relevant to a topic. Returns \
         file paths with their indexed summaries. Expensive context - use \
         at most once or twice per task, then switch to read_file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for, e.g. 'http retry logic'"
                }
            },
            "required": ["query"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let query = match call.args.get("query").and_then(Value::as_str) {
            Some(q) => q,
            None => return ToolResult::err(&call.id, ErrorKind::InvalidArgs, "missing 'query'"),
        };
        let index_path = ctx.workspace_root.join(".ledit").join("workspace.json");
        let text = match std::fs::read_to_string(&index_path) {
            Ok(t) => t,
            Err(_) => {
                return ToolResult::ok(
                    &call.id,
                    "workspace index not built yet; fall back to search_files",
                );
            }
        };
        let index: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                return ToolResult::err(
                    &call.id,
                    ErrorKind::Internal,
                    format!("workspace index is corrupt: {e}"),
                )
            }
        };

        // Normalized term match over path + summary text.  The embedding
        // side ranks semantically; this reader only needs containment.
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(String::from)
            .collect();

        let mut hits: Vec<(usize, String)> = Vec::new();
        if let Some(files) = index.get("files").and_then(Value::as_object) {
            for (path, meta) in files {
                let summary = meta.get("summary").and_then(Value::as_str).unwrap_or("");
                let haystack = format!("{} {}", path, summary).to_lowercase();
                let score = terms.iter().filter(|t| haystack.contains(*t)).count();
                if score > 0 {
                    hits.push((score, format!("{path} - {summary}")));
                }
            }
        }
        hits.sort_by(|a, b| b.0.cmp(&a.0));
        hits.truncate(MAX_HITS);

        if hits.is_empty() {
            ToolResult::ok(&call.id, format!("no indexed files match '{query}'"))
        } else {
            let lines: Vec<String> = hits.into_iter().map(|(_, l)| l).collect();
            ToolResult::ok(&call.id, lines.join("\n"))
        }
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

    fn call(query: &str) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "workspace_context".into(),
            args: json!({"query": query}),
        }
    }

    fn write_index(root: &std::path::Path, body: &str) {
        let dir = root.join(".ledit");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("workspace.json"), body).unwrap();
    }

    #[tokio::test]
    async fn missing_index_degrades_gracefully() {
        let tmp = tempfile::tempdir().unwrap();
        let r = WorkspaceContextTool
            .execute(&call("retry"), &ctx(tmp.path()))
            .await;
        assert!(r.success);
        assert!(r.output.contains("not built"));
    }

    #[tokio::test]
    async fn matching_entries_are_ranked_first() {
        let tmp = tempfile::tempdir().unwrap();
        write_index(
            tmp.path(),
            r#"{"files": {
                "src/retry.rs": {"summary": "http retry with backoff"},
                "src/main.rs": {"summary": "entry point"},
                "src/http.rs": {"summary": "http client"}
            }}"#,
        );
        let r = WorkspaceContextTool
            .execute(&call("http retry"), &ctx(tmp.path()))
            .await;
        assert!(r.success);
        let first = r.output.lines().next().unwrap();
        assert!(first.contains("retry.rs"), "{}", r.output);
        assert!(!r.output.contains("main.rs"));
    }

    #[tokio::test]
    async fn corrupt_index_is_internal_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_index(tmp.path(), "{broken");
        let r = WorkspaceContextTool
            .execute(&call("x"), &ctx(tmp.path()))
            .await;
        assert_eq!(r.error_kind, Some(ErrorKind::Internal));
    }
}
