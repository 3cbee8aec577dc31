// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fast-path detection: queries that are really shell commands skip the
//! agent loop entirely.

use std::path::Path;

/// What a submitted line turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Empty,
    /// `!`-prefixed: execute without confirmation.
    ForcedShell(String),
    /// High-confidence local command; confirm before executing unless
    /// prompts are suppressed.
    ShellCommand(String),
    /// `/name args`.
    Slash { name: String, args: String },
    /// Everything else goes to the agent loop.
    Agent(String),
}

/// Words that make a line read as natural language rather than a command.
const SENTENCE_MARKERS: &[&str] = &[
    " the ", " a ", " an ", " my ", " please", " should ", " could ", " would ",
];

/// Classify one submitted line.
pub fn classify(input: &str) -> Submission {
    let line = input.trim();
    if line.is_empty() {
        return Submission::Empty;
    }
    if let Some(rest) = line.strip_prefix('!') {
        return Submission::ForcedShell(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix('/') {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().to_string();
        let args = parts.next().unwrap_or_default().trim().to_string();
        return Submission::Slash { name, args };
    }
    if looks_like_shell(line) {
        return Submission::ShellCommand(line.to_string());
    }
    Submission::Agent(line.to_string())
}

/// Local classifier: the first word must resolve on PATH, and the rest of
/// the line must not read like prose.
fn looks_like_shell(line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return false;
    };
    if !binary_on_path(first) {
        return false;
    }
    if line.ends_with('?') {
        return false;
    }
    let padded = format!(" {} ", line.to_lowercase());
    if SENTENCE_MARKERS.iter().any(|m| padded.contains(m)) {
        return false;
    }
    // Long word sequences without shell metacharacters read as prose even
    // when the first token happens to be a binary name.
    let word_count = line.split_whitespace().count();
    let has_meta = line.contains(['|', '>', '<', '&', ';', '-', '.', '/']);
    word_count <= 8 || has_meta
}

/// Existence check over PATH, the cheap half of alias detection.
pub fn binary_on_path(name: &str) -> bool {
    if name.contains('/') {
        return is_executable(Path::new(name));
    }
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    path.split(':')
        .any(|dir| is_executable(&Path::new(dir).join(name)))
}

#[cfg(unix)]
fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    p.is_file()
        && p.metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(p: &Path) -> bool {
    p.is_file()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_is_empty() {
        assert_eq!(classify("   "), Submission::Empty);
    }

    #[test]
    fn bang_prefix_forces_shell() {
        assert_eq!(
            classify("!rm -rf target"),
            Submission::ForcedShell("rm -rf target".into())
        );
    }

    #[test]
    fn slash_routes_to_command_registry() {
        assert_eq!(
            classify("/help budgets"),
            Submission::Slash {
                name: "help".into(),
                args: "budgets".into()
            }
        );
    }

    #[test]
    fn plain_command_is_detected() {
        // `ls` exists on any unix PATH this test runs on.
        assert_eq!(classify("ls -la"), Submission::ShellCommand("ls -la".into()));
    }

    #[test]
    fn git_subcommand_is_detected() {
        assert_eq!(
            classify("git status"),
            Submission::ShellCommand("git status".into())
        );
    }

    #[test]
    fn prose_goes_to_the_agent() {
        assert_eq!(
            classify("rename the function foo to bar everywhere"),
            Submission::Agent("rename the function foo to bar everywhere".into())
        );
    }

    #[test]
    fn question_goes_to_the_agent() {
        assert_eq!(
            classify("ls good or bad?"),
            Submission::Agent("ls good or bad?".into())
        );
    }

    #[test]
    fn unknown_binary_goes_to_the_agent() {
        assert_eq!(
            classify("definitelynotacommand --flag"),
            Submission::Agent("definitelynotacommand --flag".into())
        );
    }

    #[test]
    fn binary_on_path_finds_sh() {
        assert!(binary_on_path("sh"));
        assert!(!binary_on_path("no_such_binary_zzz"));
    }
}
