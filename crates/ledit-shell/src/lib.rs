// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Interactive session shell: a line reader with history and file-name
//! completion, plus the submission pipeline (forced shell, fast-path
//! classification, slash commands, agent queries).

mod commands;
mod fastpath;

pub use commands::{dispatch, SlashAction};
pub use fastpath::{binary_on_path, classify, Submission};

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use rustyline::completion::FilenameCompleter;
use rustyline::error::ReadlineError;
use rustyline::hint::HistoryHinter;
use rustyline::history::DefaultHistory;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Highlighter, Hinter, Validator};

#[derive(Helper, Completer, Hinter, Highlighter, Validator)]
struct ShellHelper {
    #[rustyline(Completer)]
    completer: FilenameCompleter,
    #[rustyline(Hinter)]
    hinter: HistoryHinter,
}

/// One line read from the prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    /// ctrl-c at an idle prompt.
    Interrupted,
    /// ctrl-d / end of input.
    Eof,
}

/// The interactive line reader.  Pure input concern: classification and
/// execution are driven by the session that owns the agent loop.
pub struct Shell {
    editor: Editor<ShellHelper, DefaultHistory>,
    history_path: PathBuf,
}

impl Shell {
    pub fn new(control: &ledit_config::ControlDir) -> anyhow::Result<Self> {
        let mut editor = Editor::new().context("initializing line editor")?;
        editor.set_helper(Some(ShellHelper {
            completer: FilenameCompleter::new(),
            hinter: HistoryHinter::new(),
        }));
        let history_path = control.root().join("history");
        let _ = editor.load_history(&history_path);
        Ok(Self {
            editor,
            history_path,
        })
    }

    pub fn read(&mut self, prompt: &str) -> ReadOutcome {
        match self.editor.readline(prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = self.editor.add_history_entry(line.as_str());
                }
                ReadOutcome::Line(line)
            }
            Err(ReadlineError::Interrupted) => ReadOutcome::Interrupted,
            Err(ReadlineError::Eof) => ReadOutcome::Eof,
            Err(e) => {
                tracing::warn!("readline error: {e}");
                ReadOutcome::Eof
            }
        }
    }

    /// y/N confirmation at the prompt.
    pub fn confirm(&mut self, question: &str) -> bool {
        match self.editor.readline(&format!("{question} [y/N] ")) {
            Ok(answer) => matches!(answer.trim(), "y" | "Y" | "yes"),
            Err(_) => false,
        }
    }

    pub fn save_history(&mut self) {
        let _ = self.editor.save_history(&self.history_path);
    }
}

/// Run a command directly with live output (the fast path and `!` prefix).
/// Returns the exit code.
pub async fn run_direct(command: &str, shell: &str, workdir: &std::path::Path) -> i32 {
    let status = tokio::process::Command::new(shell)
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) => s.code().unwrap_or(-1),
        Err(e) => {
            eprintln!("failed to run command: {e}");
            -1
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_direct_reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(run_direct("exit 0", "sh", tmp.path()).await, 0);
        assert_eq!(run_direct("exit 3", "sh", tmp.path()).await, 3);
    }

    #[tokio::test]
    async fn run_direct_uses_workdir() {
        let tmp = tempfile::tempdir().unwrap();
        let code = run_direct("test -d .", "sh", tmp.path()).await;
        assert_eq!(code, 0);
    }
}
