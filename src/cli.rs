// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ledit",
    about = "An autonomous, tool-using AI coding agent for the terminal",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Developer intent; omit to enter interactive mode
    #[arg(value_name = "INTENT")]
    pub intent: Option<String>,

    /// Model override, e.g. "gpt-4o" or "deepseek/deepseek-chat"
    #[arg(long, short = 'M', env = "LEDIT_MODEL", global = true)]
    pub model: Option<String>,

    /// Simulate mutating tools; leave the working tree untouched
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Skip interactive confirmations (implied by CI=1)
    #[arg(long, global = true)]
    pub skip_prompt: bool,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Iteration cap for the agent loop
    #[arg(long, global = true)]
    pub max_iterations: Option<u32>,

    /// Token budget for the run
    #[arg(long, global = true)]
    pub token_cap: Option<u64>,

    /// Dollar budget for the run
    #[arg(long, global = true)]
    pub cost_cap: Option<f64>,

    /// Wall-clock budget in seconds
    #[arg(long, global = true)]
    pub time_cap: Option<u64>,

    /// Disable the embedded web UI
    #[arg(long, global = true)]
    pub no_web: bool,

    /// Log to stderr as well as .ledit/workspace.log
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent loop on an intent (the default command)
    Agent {
        /// Developer intent; omit to enter interactive mode
        intent: Option<String>,
    },

    /// Collaborative planning: outline the steps first, execute on approval
    Plan {
        /// The idea to plan for
        idea: String,
    },

    /// Single-shot code generation with optional file targeting
    Code {
        /// Edit instructions
        instructions: String,
        /// Target file for the change
        #[arg(long, short = 'f')]
        file: Option<String>,
    },

    /// Generate a commit message from staged changes and commit
    Commit,

    /// AI review of the staged diff
    Review,

    /// Run a command; on failure feed its output to the agent loop
    Fix {
        /// The command and its arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Multi-agent orchestration from a plan file
    Process {
        /// Path to the JSON plan file
        file: PathBuf,
    },

    /// Revert a prior edit by recorded revision id
    Rollback {
        /// Revision id (see .ledit/revisions/)
        revision: String,
    },

    /// Tail the workspace log
    Log {
        /// Number of trailing lines to print
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },

    /// Aggregate usage statistics from recorded runs
    Insights,

    /// List running ledit processes
    Instances {
        /// Print the model provider table instead
        #[arg(long)]
        providers: bool,
    },

    /// Run the project's validation command
    Validate {
        /// Explicit validation command (auto-detected when omitted)
        #[arg(long)]
        command: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

/// Fold CLI flags into the loaded configuration.  Flags win over files and
/// environment overrides.
pub fn apply_cli_overrides(config: &mut ledit_config::Config, cli: &Cli) {
    if let Some(model) = &cli.model {
        // "provider/model" selects both; a bare name keeps the provider.
        match model.split_once('/') {
            Some((provider, name)) => {
                config.model.provider = provider.to_string();
                config.model.name = name.to_string();
            }
            None => config.model.name = model.clone(),
        }
    }
    if cli.dry_run {
        config.agent.dry_run = true;
    }
    if cli.skip_prompt {
        config.agent.skip_prompt = true;
    }
    if let Some(n) = cli.max_iterations {
        config.agent.max_iterations = n;
    }
    if let Some(n) = cli.token_cap {
        config.budgets.token_cap = n;
    }
    if let Some(n) = cli.cost_cap {
        config.budgets.cost_cap_usd = n;
    }
    if let Some(n) = cli.time_cap {
        config.budgets.time_cap_secs = n;
    }
    if cli.no_web {
        config.web.enabled = false;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_intent_parses_without_subcommand() {
        let cli = Cli::parse_from(["ledit", "fix the tests"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.intent.as_deref(), Some("fix the tests"));
    }

    #[test]
    fn model_override_with_provider() {
        let cli = Cli::parse_from(["ledit", "-M", "deepseek/deepseek-chat", "x"]);
        let mut config = ledit_config::Config::default();
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.model.provider, "deepseek");
        assert_eq!(config.model.name, "deepseek-chat");
    }

    #[test]
    fn bare_model_override_keeps_provider() {
        let cli = Cli::parse_from(["ledit", "-M", "gpt-4o-mini", "x"]);
        let mut config = ledit_config::Config::default();
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.model.name, "gpt-4o-mini");
    }

    #[test]
    fn budget_flags_override_config() {
        let cli = Cli::parse_from(["ledit", "--token-cap", "123", "--max-iterations", "7", "x"]);
        let mut config = ledit_config::Config::default();
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.budgets.token_cap, 123);
        assert_eq!(config.agent.max_iterations, 7);
    }

    #[test]
    fn fix_collects_trailing_command() {
        let cli = Cli::parse_from(["ledit", "fix", "cargo", "test", "--workspace"]);
        match cli.command {
            Some(Commands::Fix { command }) => {
                assert_eq!(command, vec!["cargo", "test", "--workspace"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn free_first_word_is_an_intent_not_an_error() {
        let cli = Cli::parse_from(["ledit", "refactor the parser"]);
        assert_eq!(cli.intent.as_deref(), Some("refactor the parser"));
    }
}
