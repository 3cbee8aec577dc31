// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;

use crate::builtin::shell::RunShellTool;
use crate::tool::{Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolResult};

/// Built-in tool that runs the project's validation command (build/tests)
/// and reports the outcome.
///
/// Without an explicit command, the project type is detected from marker
/// files at the workspace root.
pub struct ValidateTool;

/// Pick the validation command for the workspace.  Detection order matters:
/// a repo with both a Makefile and Cargo.toml almost always wants the
/// language-native check.
pub fn detect_validation_command(root: &Path) -> Option<&'static str> {
    if root.join("Cargo.toml").is_file() {
        Some("cargo check --quiet 2>&1")
    } else if root.join("go.mod").is_file() {
        Some("go build ./... 2>&1")
    } else if root.join("package.json").is_file() {
        Some("npm run --silent build 2>&1")
    } else if root.join("Makefile").is_file() {
        Some("make -n check >/dev/null 2>&1 && make check 2>&1")
    } else {
        None
    }
}

#[async_trait]
impl Tool for ValidateTool {
    fn name(&self) -> &str {
        "validate"
    }

    fn description(&self) -> &str {
        "Run the project's validation command (build or tests) and return \
         its output. With no 'command', the project type is auto-detected \
         (Cargo.toml, go.mod, package.json, Makefile)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Validation command to run (optional; auto-detected)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            }
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::shell()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let command = match call.args.get("command").and_then(Value::as_str) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => match detect_validation_command(&ctx.workspace_root) {
                Some(c) => c.to_string(),
                None => {
                    return ToolResult::err(
                        &call.id,
                        ErrorKind::InvalidArgs,
                        "no validation command given and none could be detected; \
                         pass 'command' explicitly",
                    )
                }
            },
        };

        // Delegate the actual execution to the shell jail; validation gets a
        // longer default deadline because builds are slow.
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(ctx.tools.timeout_secs.max(120));
        let shell_call = ToolCall {
            id: call.id.clone(),
            name: "run_shell".into(),
            args: json!({ "command": command, "timeout_secs": timeout }),
        };
        let result = RunShellTool.execute(&shell_call, ctx).await;

        if result.success {
            let mut r = ToolResult::ok(&call.id, format!("validation passed\n{}", result.output));
            r.duration = result.duration;
            r
        } else {
            // Keep the shell's classification (timeout vs exit code) but
            // frame the output for the evaluator.
            let mut r = ToolResult::err(
                &call.id,
                result.error_kind.unwrap_or(ErrorKind::Internal),
                format!("validation failed\n{}", result.output),
            );
            r.duration = result.duration;
            r
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

    #[tokio::test]
    async fn explicit_passing_command_reports_success() {
        let tmp = tempfile::tempdir().unwrap();
        let call = ToolCall {
            id: "1".into(),
            name: "validate".into(),
            args: json!({"command": "true"}),
        };
        let r = ValidateTool.execute(&call, &ctx(tmp.path())).await;
        assert!(r.success);
        assert!(r.output.contains("validation passed"));
    }

    #[tokio::test]
    async fn explicit_failing_command_reports_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let call = ToolCall {
            id: "1".into(),
            name: "validate".into(),
            args: json!({"command": "echo broken && exit 2"}),
        };
        let r = ValidateTool.execute(&call, &ctx(tmp.path())).await;
        assert!(!r.success);
        assert!(r.output.contains("validation failed"));
        assert!(r.output.contains("broken"));
    }

    #[tokio::test]
    async fn no_command_and_no_markers_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let call = ToolCall {
            id: "1".into(),
            name: "validate".into(),
            args: json!({}),
        };
        let r = ValidateTool.execute(&call, &ctx(tmp.path())).await;
        assert_eq!(r.error_kind, Some(ErrorKind::InvalidArgs));
    }

    #[test]
    fn detection_prefers_cargo() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Cargo.toml"), "[package]").unwrap();
        std::fs::write(tmp.path().join("Makefile"), "check:").unwrap();
        let cmd = detect_validation_command(tmp.path()).unwrap();
        assert!(cmd.contains("cargo"));
    }

    #[test]
    fn detection_handles_go_projects() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("go.mod"), "module x").unwrap();
        let cmd = detect_validation_command(tmp.path()).unwrap();
        assert!(cmd.contains("go build"));
    }

    #[test]
    fn detection_none_for_unknown_projects() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(detect_validation_command(tmp.path()).is_none());
    }
}
