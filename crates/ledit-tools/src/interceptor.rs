// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Safety interceptor: classifies calls, normalizes sloppy arguments, and
//! rejects dangerous ones before anything executes.

use std::path::{Component, Path};

use regex::Regex;
use serde_json::Value;

use crate::tool::{Capabilities, ErrorKind, ToolCall};

/// Interceptor classification for one concrete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    ReadOnly,
    MutatesFs,
    /// Shell execution; `read_only` marks commands that only observe state
    /// and are therefore eligible for evidence caching.
    Shell { read_only: bool },
    Network,
}

impl CallClass {
    pub fn cacheable(&self) -> bool {
        matches!(self, CallClass::ReadOnly | CallClass::Shell { read_only: true })
    }

    pub fn mutating(&self) -> bool {
        matches!(self, CallClass::MutatesFs | CallClass::Shell { read_only: false })
    }
}

/// Command prefixes that only observe state.  A shell call matching one of
/// these (and containing no output redirection) is classified read-only.
const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "pwd", "echo", "which", "file", "stat", "du", "df",
    "grep", "rg", "find", "env", "git status", "git log", "git diff", "git show", "git branch",
];

/// Argument keys treated as filesystem paths during normalization.
const PATH_KEYS: &[&str] = &["path", "file", "target", "workdir", "directory"];

/// Filename fragments whose reads are refused outright: these hold
/// credentials, and no coding task needs them.
const CREDENTIAL_FRAGMENTS: &[&str] = &[
    ".ssh/", ".aws/credentials", ".netrc", "id_rsa", "id_ed25519", ".gnupg/",
];

pub struct Interceptor {
    deny: Vec<Regex>,
    allow_outside_writes: bool,
}

impl Interceptor {
    pub fn from_config(cfg: &ledit_config::ToolsConfig) -> Self {
        Self {
            deny: cfg.denylist.iter().filter_map(|p| glob_to_regex(p)).collect(),
            allow_outside_writes: cfg.allow_outside_writes,
        }
    }

    /// Classify the call from its tool capabilities and concrete arguments.
    pub fn classify(&self, caps: Capabilities, call: &ToolCall) -> CallClass {
        if caps.runs_shell {
            let cmd = call
                .args
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return CallClass::Shell {
                read_only: is_read_only_command(cmd),
            };
        }
        if caps.network {
            return CallClass::Network;
        }
        if caps.mutates_fs || caps.spawns_agents {
            return CallClass::MutatesFs;
        }
        CallClass::ReadOnly
    }

    /// Normalize common argument mistakes in place: surrounding whitespace
    /// on commands, redundant `./` and non-canonical separators on paths.
    pub fn normalize(&self, call: &mut ToolCall, workspace_root: &Path) {
        if let Some(obj) = call.args.as_object_mut() {
            for (key, value) in obj.iter_mut() {
                let Some(s) = value.as_str() else { continue };
                if key == "command" {
                    *value = Value::String(s.trim().to_string());
                } else if PATH_KEYS.contains(&key.as_str()) {
                    *value = Value::String(ledit_cache::clean_path(s, workspace_root));
                }
            }
        }
    }

    /// Reject dangerous calls.  Returns the refusal message; the registry
    /// wraps it with [`ErrorKind::Permission`].
    pub fn check(
        &self,
        class: CallClass,
        call: &ToolCall,
        workspace_root: &Path,
    ) -> Result<(), (ErrorKind, String)> {
        match class {
            CallClass::Shell { .. } => {
                let cmd = call
                    .args
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.check_shell(cmd)
            }
            CallClass::MutatesFs => self.check_write_target(call, workspace_root),
            CallClass::ReadOnly => self.check_read_target(call),
            CallClass::Network => Ok(()),
        }
    }

    fn check_shell(&self, cmd: &str) -> Result<(), (ErrorKind, String)> {
        for re in &self.deny {
            if re.is_match(cmd) {
                return Err((
                    ErrorKind::Permission,
                    format!("command matches denylist and was not executed: {cmd}"),
                ));
            }
        }
        if is_destructive_rm(cmd) {
            return Err((
                ErrorKind::Permission,
                "refusing recursive delete of a parent, root, or home directory".into(),
            ));
        }
        if CREDENTIAL_FRAGMENTS.iter().any(|f| cmd.contains(f)) {
            return Err((
                ErrorKind::Permission,
                "refusing to touch credential files".into(),
            ));
        }
        Ok(())
    }

    fn check_write_target(
        &self,
        call: &ToolCall,
        workspace_root: &Path,
    ) -> Result<(), (ErrorKind, String)> {
        if self.allow_outside_writes {
            return Ok(());
        }
        for key in PATH_KEYS {
            let Some(raw) = call.args.get(*key).and_then(Value::as_str) else {
                continue;
            };
            if escapes_workspace(raw, workspace_root) {
                return Err((
                    ErrorKind::Permission,
                    format!(
                        "write target {raw} is outside the workspace \
                         (set tools.allow_outside_writes to permit this)"
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_read_target(&self, call: &ToolCall) -> Result<(), (ErrorKind, String)> {
        for key in PATH_KEYS {
            let Some(raw) = call.args.get(*key).and_then(Value::as_str) else {
                continue;
            };
            if CREDENTIAL_FRAGMENTS.iter().any(|f| raw.contains(f)) {
                return Err((
                    ErrorKind::Permission,
                    format!("refusing to read credential file: {raw}"),
                ));
            }
        }
        Ok(())
    }
}

/// True when the command's first (pipeline-free) word sequence matches a
/// read-only prefix and nothing in the line writes.
fn is_read_only_command(cmd: &str) -> bool {
    let cmd = cmd.trim();
    if cmd.is_empty() || cmd.contains('>') || cmd.contains("&&") || cmd.contains(';') {
        return false;
    }
    // Pipelines are read-only iff every stage is.
    cmd.split('|')
        .all(|stage| {
            let stage = stage.trim();
            READ_ONLY_COMMANDS
                .iter()
                .any(|p| stage == *p || stage.starts_with(&format!("{p} ")))
        })
}

/// Detect `rm -r`-style invocations aimed at a parent, root, or home.
fn is_destructive_rm(cmd: &str) -> bool {
    let trimmed = cmd.trim_start();
    if !trimmed.starts_with("rm ") {
        return false;
    }
    let has_recursive = trimmed
        .split_whitespace()
        .any(|w| w.starts_with('-') && (w.contains('r') || w.contains('R')));
    if !has_recursive {
        return false;
    }
    trimmed.split_whitespace().skip(1).any(|w| {
        w == "/" || w == "/*" || w == "~" || w == "~/" || w == ".." || w.starts_with("../")
    })
}

/// A path escapes when, after lexical cleaning, it still begins with `..`
/// or is an absolute path outside the workspace root.
fn escapes_workspace(raw: &str, workspace_root: &Path) -> bool {
    let p = Path::new(raw);
    if p.is_absolute() {
        return !p.starts_with(workspace_root);
    }
    let mut depth: i64 = 0;
    for comp in p.components() {
        match comp {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    false
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn interceptor() -> Interceptor {
        Interceptor::from_config(&ledit_config::ToolsConfig::default())
    }

    fn shell_call(cmd: &str) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "run_shell".into(),
            args: json!({ "command": cmd }),
        }
    }

    // ── Classification ────────────────────────────────────────────────────────

    #[test]
    fn read_only_tool_classifies_read_only() {
        let call = ToolCall { id: "1".into(), name: "read_file".into(), args: json!({"path": "a"}) };
        let class = interceptor().classify(Capabilities::read_only(), &call);
        assert_eq!(class, CallClass::ReadOnly);
        assert!(class.cacheable());
    }

    #[test]
    fn observing_shell_command_is_read_only() {
        let class = interceptor().classify(Capabilities::shell(), &shell_call("git status"));
        assert_eq!(class, CallClass::Shell { read_only: true });
        assert!(class.cacheable());
    }

    #[test]
    fn mutating_shell_command_is_not_read_only() {
        let class = interceptor().classify(Capabilities::shell(), &shell_call("cargo build"));
        assert_eq!(class, CallClass::Shell { read_only: false });
        assert!(class.mutating());
    }

    #[test]
    fn redirection_defeats_read_only_classification() {
        let class = interceptor().classify(Capabilities::shell(), &shell_call("ls > out.txt"));
        assert_eq!(class, CallClass::Shell { read_only: false });
    }

    #[test]
    fn read_only_pipeline_stays_read_only() {
        let class = interceptor().classify(Capabilities::shell(), &shell_call("cat x | grep y"));
        assert_eq!(class, CallClass::Shell { read_only: true });
    }

    // ── Normalization ─────────────────────────────────────────────────────────

    #[test]
    fn normalize_strips_redundant_dot_segments() {
        let mut call = ToolCall {
            id: "1".into(),
            name: "read_file".into(),
            args: json!({"path": "./src/./main.rs"}),
        };
        interceptor().normalize(&mut call, Path::new("/w"));
        assert_eq!(call.args["path"], "src/main.rs");
    }

    #[test]
    fn normalize_trims_command_whitespace() {
        let mut call = shell_call("  ls -la  ");
        interceptor().normalize(&mut call, Path::new("/w"));
        assert_eq!(call.args["command"], "ls -la");
    }

    // ── Dangerous patterns ────────────────────────────────────────────────────

    #[test]
    fn rm_rf_root_is_rejected() {
        let err = interceptor()
            .check(
                CallClass::Shell { read_only: false },
                &shell_call("rm -rf /"),
                Path::new("/w"),
            )
            .unwrap_err();
        assert_eq!(err.0, ErrorKind::Permission);
    }

    #[test]
    fn rm_rf_parent_is_rejected() {
        let res = interceptor().check(
            CallClass::Shell { read_only: false },
            &shell_call("rm -rf ../other"),
            Path::new("/w"),
        );
        assert!(res.is_err());
    }

    #[test]
    fn rm_rf_inside_workspace_is_allowed() {
        let res = interceptor().check(
            CallClass::Shell { read_only: false },
            &shell_call("rm -rf target/debug"),
            Path::new("/w"),
        );
        assert!(res.is_ok());
    }

    #[test]
    fn denylist_rejects_sudo() {
        let res = interceptor().check(
            CallClass::Shell { read_only: false },
            &shell_call("sudo apt install x"),
            Path::new("/w"),
        );
        assert!(res.is_err());
    }

    #[test]
    fn credential_read_is_rejected() {
        let call = ToolCall {
            id: "1".into(),
            name: "read_file".into(),
            args: json!({"path": "/home/u/.ssh/id_rsa"}),
        };
        let res = interceptor().check(CallClass::ReadOnly, &call, Path::new("/w"));
        assert!(res.is_err());
    }

    #[test]
    fn write_outside_workspace_is_rejected() {
        let call = ToolCall {
            id: "1".into(),
            name: "write_file".into(),
            args: json!({"path": "../../etc/passwd", "content": "x"}),
        };
        let err = interceptor()
            .check(CallClass::MutatesFs, &call, Path::new("/w"))
            .unwrap_err();
        assert_eq!(err.0, ErrorKind::Permission);
    }

    #[test]
    fn write_inside_workspace_is_allowed() {
        let call = ToolCall {
            id: "1".into(),
            name: "write_file".into(),
            args: json!({"path": "src/new.rs", "content": "x"}),
        };
        assert!(interceptor()
            .check(CallClass::MutatesFs, &call, Path::new("/w"))
            .is_ok());
    }

    #[test]
    fn capability_flag_permits_outside_writes() {
        let mut cfg = ledit_config::ToolsConfig::default();
        cfg.allow_outside_writes = true;
        let icp = Interceptor::from_config(&cfg);
        let call = ToolCall {
            id: "1".into(),
            name: "write_file".into(),
            args: json!({"path": "/tmp/elsewhere.txt", "content": "x"}),
        };
        assert!(icp.check(CallClass::MutatesFs, &call, Path::new("/w")).is_ok());
    }

    #[test]
    fn escape_detection_handles_mid_path_parents() {
        assert!(escapes_workspace("a/../../b", Path::new("/w")));
        assert!(!escapes_workspace("a/../b", Path::new("/w")));
        assert!(escapes_workspace("/etc/passwd", Path::new("/w")));
        assert!(!escapes_workspace("/w/sub/file", Path::new("/w")));
    }
}
