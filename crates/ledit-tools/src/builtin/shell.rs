// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::tool::{Capabilities, ErrorKind, ExecContext, Tool, ToolCall, ToolResult};

/// Built-in tool that runs a shell command inside the workspace jail.
///
/// The child runs in its own session (so the whole process group can be
/// killed on timeout or cancel), with CPU, address-space, and file-size
/// rlimits applied, stdin detached, and its working directory pinned to the
/// workspace unless an explicit `workdir` is given.
pub struct RunShellTool;

#[async_trait]
impl Tool for RunShellTool {
    fn name(&self) -> &str {
        "run_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr. \
         'command' is any one-liner; prefer non-interactive commands. \
         Do NOT use the shell for file operations: \
         read files with read_file, search with search_files, \
         edit with edit_file_section or micro_edit. \
         For large outputs (builds, test runs), pipe through `tail -200` to \
         keep only what matters."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The complete shell one-liner to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to the workspace root)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"]
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::shell()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolResult {
        let command = match call.args.get("command").and_then(Value::as_str) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => {
                return ToolResult::err(
                    &call.id,
                    ErrorKind::InvalidArgs,
                    "provide the shell command to execute as 'command'",
                )
            }
        };
        let workdir = call
            .args
            .get("workdir")
            .and_then(Value::as_str)
            .map(|w| ctx.resolve(w))
            .unwrap_or_else(|| ctx.workspace_root.clone());
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(ctx.tools.timeout_secs);

        debug!(cmd = %command, "executing shell tool");

        let mut cmd = Command::new(&ctx.tools.shell);
        cmd.arg("-c").arg(&command);
        cmd.current_dir(&workdir);
        // Detach from the terminal: no inherited stdin, and SIGKILL on drop
        // so a timed-out future cannot leave the direct child running.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // setsid() gives the child its own session and process group, which
        // makes `kill(-pid)` reach every descendant - a `cargo test` that
        // spawned its own children dies with it.  The rlimits bound runaway
        // CPU loops, memory balloons, and disk-filling writes.
        #[cfg(unix)]
        {
            let cpu = ctx.tools.cpu_limit_secs;
            let mem = ctx.tools.mem_limit_bytes;
            let fsize = ctx.tools.file_size_limit_bytes;
            unsafe {
                cmd.pre_exec(move || {
                    libc::setsid();
                    set_rlimit(libc::RLIMIT_CPU, cpu);
                    set_rlimit(libc::RLIMIT_AS, mem);
                    set_rlimit(libc::RLIMIT_FSIZE, fsize);
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::err(&call.id, ErrorKind::Internal, format!("spawn error: {e}"))
            }
        };
        let pid = child.id();

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                kill_process_group(pid);
                return ToolResult::err(&call.id, ErrorKind::Internal, "execution cancelled");
            }
            res = tokio::time::timeout(std::time::Duration::from_secs(timeout), &mut wait) => res,
        };

        match outcome {
            Err(_) => {
                kill_process_group(pid);
                ToolResult::err(
                    &call.id,
                    ErrorKind::Timeout,
                    format!("timeout after {timeout}s: {command}"),
                )
            }
            Ok(Err(e)) => ToolResult::err(&call.id, ErrorKind::Internal, format!("wait error: {e}")),
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                if !stdout.is_empty() {
                    content.push_str(&stdout);
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&stderr);
                }

                let code = output.status.code().unwrap_or(-1);
                if code == 0 {
                    if content.is_empty() {
                        content = "[exit 0]".into();
                    }
                    ToolResult::ok(&call.id, content)
                } else if code == 1 {
                    // Exit code 1 is the Unix convention for "no matches"
                    // (grep/rg) and "condition false" (test).  Treating it as
                    // an error would tell the model the command itself broke.
                    let out = if content.is_empty() {
                        "[exit 1]".to_string()
                    } else {
                        format!("[exit 1]\n{content}")
                    };
                    ToolResult::ok(&call.id, out)
                } else {
                    ToolResult::err(
                        &call.id,
                        ErrorKind::Internal,
                        format!("[exit {code}]\n{content}"),
                    )
                }
            }
        }
    }
}

#[cfg(unix)]
fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    unsafe {
        libc::setrlimit(resource, &limit);
    }
}

/// SIGKILL the child's whole process group.  After `setsid()` the child's
/// pid equals its pgid, so `kill(-pid)` reaches every descendant.
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
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
            name: "run_shell".into(),
            args,
        }
    }

    #[tokio::test]
    async fn executes_echo_and_returns_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let r = RunShellTool
            .execute(&call(json!({"command": "echo hello"})), &ctx(tmp.path()))
            .await;
        assert!(r.success, "{}", r.output);
        assert!(r.output.contains("hello"));
    }

    #[tokio::test]
    async fn stdout_and_stderr_both_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let r = RunShellTool
            .execute(
                &call(json!({"command": "echo out && echo err >&2"})),
                &ctx(tmp.path()),
            )
            .await;
        assert!(r.output.contains("out"));
        assert!(r.output.contains("err"));
        assert!(r.output.contains("[stderr]"));
    }

    #[tokio::test]
    async fn runs_in_workspace_root_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let r = RunShellTool
            .execute(&call(json!({"command": "pwd"})), &ctx(tmp.path()))
            .await;
        assert!(r.success);
        // canonicalize: macOS tempdirs live under /private
        let pwd = std::path::PathBuf::from(r.output.trim());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            tmp.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn exit_1_is_not_error_but_includes_code() {
        let tmp = tempfile::tempdir().unwrap();
        let r = RunShellTool
            .execute(&call(json!({"command": "exit 1"})), &ctx(tmp.path()))
            .await;
        assert!(r.success, "exit 1 should not be an error");
        assert!(r.output.contains("[exit 1]"));
    }

    #[tokio::test]
    async fn exit_2_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let r = RunShellTool
            .execute(&call(json!({"command": "exit 2"})), &ctx(tmp.path()))
            .await;
        assert!(!r.success);
        assert!(r.output.contains("[exit 2]"));
    }

    #[tokio::test]
    async fn missing_command_argument_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let r = RunShellTool.execute(&call(json!({})), &ctx(tmp.path())).await;
        assert_eq!(r.error_kind, Some(ErrorKind::InvalidArgs));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let r = RunShellTool
            .execute(
                &call(json!({"command": "sleep 60", "timeout_secs": 1})),
                &ctx(tmp.path()),
            )
            .await;
        assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
        assert!(r.output.contains("timeout"));
    }

    #[tokio::test]
    async fn cancel_kills_running_command() {
        let tmp = tempfile::tempdir().unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let c = ctx(tmp.path()).with_cancel(cancel.clone());
        let task = tokio::spawn(async move {
            RunShellTool
                .execute(&call(json!({"command": "sleep 60"})), &c)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        cancel.cancel();
        let r = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("cancel must resolve quickly")
            .unwrap();
        assert!(!r.success);
        assert!(r.output.contains("cancelled"));
    }
}
