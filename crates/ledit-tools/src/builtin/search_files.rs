// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::{Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolResult};

/// Directories never worth searching: VCS metadata, build output, and the
/// agent's own control directory.
const SKIP_DIRS: &[&str] = &[".git", ".ledit", "target", "node_modules", ".venv"];

const MAX_MATCHES: usize = 200;

/// Built-in content search over the workspace tree.
pub struct SearchFilesTool;

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search workspace files for a regex pattern and return matches as \
         'path:line: text'. Optional 'directory' narrows the search root; \
         optional 'glob' (e.g. '*.rs') filters file names."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "directory": {
                    "type": "string",
                    "description": "Directory to search under (optional)"
                },
                "glob": {
                    "type": "string",
                    "description": "File-name glob filter, e.g. '*.rs' (optional)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Cap on returned matches (optional)"
                }
            },
            "required": ["pattern"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let pattern = match call.args.get("pattern").and_then(Value::as_str) {
            Some(p) => p,
            None => return ToolResult::err(&call.id, ErrorKind::InvalidArgs, "missing 'pattern'"),
        };
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                return ToolResult::err(
                    &call.id,
                    ErrorKind::InvalidArgs,
                    format!("invalid regex: {e}"),
                )
            }
        };
        let root = call
            .args
            .get("directory")
            .and_then(Value::as_str)
            .map(|d| ctx.resolve(d))
            .unwrap_or_else(|| ctx.workspace_root.clone());
        if !root.is_dir() {
            return ToolResult::err(
                &call.id,
                ErrorKind::NotFound,
                format!("directory not found: {}", root.display()),
            );
        }
        let name_filter = call
            .args
            .get("glob")
            .and_then(Value::as_str)
            .map(glob_to_suffix_check);
        let cap = call
            .args
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(MAX_MATCHES);

        let mut out = Vec::new();
        'walk: for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| !is_skipped(e))
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(check) = &name_filter {
                let name = entry.file_name().to_string_lossy();
                if !check(&name) {
                    continue;
                }
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                // Binary or unreadable - skip quietly.
                continue;
            };
            let rel = entry
                .path()
                .strip_prefix(&ctx.workspace_root)
                .unwrap_or(entry.path());
            for (i, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    out.push(format!("{}:{}: {}", rel.display(), i + 1, line.trim_end()));
                    if out.len() >= cap {
                        out.push(format!("...[more matches omitted beyond {cap}]"));
                        break 'walk;
                    }
                }
            }
        }

        if out.is_empty() {
            ToolResult::ok(&call.id, format!("no matches for /{pattern}/"))
        } else {
            ToolResult::ok(&call.id, out.join("\n"))
        }
    }
}

fn is_skipped(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|n| SKIP_DIRS.contains(&n))
            .unwrap_or(false)
}

/// Compile a `*.rs`-style glob into a simple name check.  Only leading-`*`
/// suffix patterns and exact names are needed here.
fn glob_to_suffix_check(glob: &str) -> Box<dyn Fn(&str) -> bool + Send + Sync> {
    if let Some(suffix) = glob.strip_prefix('*') {
        let suffix = suffix.to_string();
        Box::new(move |name| name.ends_with(&suffix))
    } else {
        let exact = glob.to_string();
        Box::new(move |name| name == exact)
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
            name: "search_files".into(),
            args,
        }
    }

    #[tokio::test]
    async fn finds_matches_with_line_numbers() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "fn foo() {}\nfn bar() {}\n").unwrap();
        let r = SearchFilesTool
            .execute(&call(json!({"pattern": "fn bar"})), &ctx(tmp.path()))
            .await;
        assert!(r.success);
        assert!(r.output.contains("a.rs:2:"));
    }

    #[tokio::test]
    async fn glob_filters_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rs"), "needle\n").unwrap();
        std::fs::write(tmp.path().join("a.txt"), "needle\n").unwrap();
        let r = SearchFilesTool
            .execute(
                &call(json!({"pattern": "needle", "glob": "*.rs"})),
                &ctx(tmp.path()),
            )
            .await;
        assert!(r.output.contains("a.rs"));
        assert!(!r.output.contains("a.txt"));
    }

    #[tokio::test]
    async fn skips_git_and_target_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/config"), "needle\n").unwrap();
        let r = SearchFilesTool
            .execute(&call(json!({"pattern": "needle"})), &ctx(tmp.path()))
            .await;
        assert!(r.output.contains("no matches"));
    }

    #[tokio::test]
    async fn invalid_regex_is_invalid_args() {
        let tmp = tempfile::tempdir().unwrap();
        let r = SearchFilesTool
            .execute(&call(json!({"pattern": "("})), &ctx(tmp.path()))
            .await;
        assert_eq!(r.error_kind, Some(ErrorKind::InvalidArgs));
    }

    #[tokio::test]
    async fn result_cap_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let body: String = (0..50).map(|i| format!("hit {i}\n")).collect();
        std::fs::write(tmp.path().join("big.txt"), body).unwrap();
        let r = SearchFilesTool
            .execute(
                &call(json!({"pattern": "hit", "max_results": 10})),
                &ctx(tmp.path()),
            )
            .await;
        assert!(r.output.contains("omitted"));
        assert_eq!(r.output.lines().count(), 11);
    }
}
