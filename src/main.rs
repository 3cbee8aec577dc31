// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod app;
mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use app::App;
use cli::{Cli, Commands};
use ledit_config::{Config, ControlDir};
use ledit_core::{RevisionLog, ShutdownWatchdog, TerminationReason};
use ledit_events::EventKind;
use ledit_model::{CompletionRequest, Message, TurnKind};
use ledit_shell::{ReadOutcome, Shell, SlashAction, Submission};
use ledit_web::ControlCommand;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let workspace_root = std::env::current_dir().context("resolving working directory")?;

    // Completions need no config, no logging, no control dir.
    if let Some(Commands::Completions { shell }) = &cli.command {
        cli::print_completions(*shell);
        return Ok(());
    }

    let control = ControlDir::new(&workspace_root);
    control.ensure().context("creating .ledit control directory")?;
    init_logging(&control, cli.verbose);

    let mut config = ledit_config::load(&workspace_root, cli.config.as_deref())?;
    cli::apply_cli_overrides(&mut config, &cli);
    let config = Arc::new(config);

    let code = dispatch(cli, config, workspace_root).await?;
    std::process::exit(code);
}

/// Route the parsed command.  Returns the process exit code.
async fn dispatch(cli: Cli, config: Arc<Config>, root: PathBuf) -> anyhow::Result<i32> {
    match cli.command {
        None => match cli.intent {
            Some(intent) => run_direct(config, root, &intent).await,
            None => run_interactive(config, root).await,
        },
        Some(Commands::Agent { intent }) => match intent {
            Some(intent) => run_direct(config, root, &intent).await,
            None => run_interactive(config, root).await,
        },
        Some(Commands::Plan { idea }) => run_plan(config, root, &idea).await,
        Some(Commands::Code { instructions, file }) => {
            let intent = match file {
                Some(f) => format!("{instructions} (target file: {f})"),
                None => instructions,
            };
            run_direct(config, root, &intent).await
        }
        Some(Commands::Commit) => run_commit(config, root).await,
        Some(Commands::Review) => run_review(config, root).await,
        Some(Commands::Fix { command }) => run_fix(config, root, &command.join(" ")).await,
        Some(Commands::Process { file }) => run_process(config, root, &file).await,
        Some(Commands::Rollback { revision }) => run_rollback(&root, &revision),
        Some(Commands::Log { lines }) => run_log(&root, lines),
        Some(Commands::Insights) => run_insights(&root),
        Some(Commands::Instances { providers }) => run_instances(&root, providers),
        Some(Commands::Validate { command }) => run_validate(config, root, command).await,
        Some(Commands::Completions { .. }) => unreachable!("handled before config load"),
    }
}

fn init_logging(control: &ControlDir, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(control.log_file());

    let file_layer = file.ok().map(|f| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(f))
    });
    let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

/// Console fan-out: stream chunks and tool lifecycle lines.
fn spawn_console_printer(app: &App) -> tokio::task::JoinHandle<()> {
    use std::io::Write;
    app.bus.subscribe_with(
        &[
            EventKind::StreamChunk,
            EventKind::ToolCalled,
            EventKind::ToolCompleted,
            EventKind::Error,
        ],
        |ev| match ev.kind {
            EventKind::StreamChunk => {
                if let Some(text) = ev.payload["text"].as_str() {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
            }
            EventKind::ToolCalled => {
                println!(
                    "→ {} {}",
                    ev.payload["name"].as_str().unwrap_or("?"),
                    ev.payload["args"]
                );
            }
            EventKind::ToolCompleted => {
                let cached = if ev.payload["served_from_cache"] == true {
                    " (cached)"
                } else {
                    ""
                };
                let status = if ev.payload["success"] == true {
                    "ok"
                } else {
                    "failed"
                };
                println!(
                    "← {} {status}{cached} [{}ms]",
                    ev.payload["name"].as_str().unwrap_or("?"),
                    ev.payload["duration_ms"]
                );
            }
            EventKind::Error => eprintln!("error: {}", ev.payload["message"]),
            _ => {}
        },
    )
}

// ── agent / code ─────────────────────────────────────────────────────────────

async fn run_direct(config: Arc<Config>, root: PathBuf, intent: &str) -> anyhow::Result<i32> {
    let app = App::assemble(config, root, true).await?;
    let printer = spawn_console_printer(&app);

    let summary = app.run_intent(intent).await;
    println!("\n{}", summary.render());
    let code = summary.reason.exit_code();

    app.shutdown().await;
    printer.abort();
    Ok(code)
}

// ── plan ─────────────────────────────────────────────────────────────────────

async fn run_plan(config: Arc<Config>, root: PathBuf, idea: &str) -> anyhow::Result<i32> {
    let app = App::assemble(Arc::clone(&config), root, true).await?;

    // Outline first: one control-plane turn, no tools.
    let req = CompletionRequest {
        messages: vec![
            Message::system(
                "You are a software planning assistant. Produce a short, \
                 numbered implementation plan. No code, no tool calls.",
            ),
            Message::user(idea),
        ],
        tools: vec![],
        stream: false,
        annotation: TurnKind::Control,
    };
    let outline = match app.client.complete(req, None, &app.cancel).await {
        Ok(c) => c.text,
        Err(e) => {
            eprintln!("planning failed: {e}");
            app.shutdown().await;
            return Ok(1);
        }
    };
    println!("{outline}\n");

    if !config.agent.skip_prompt {
        let mut shell = Shell::new(&app.control)?;
        if !shell.confirm("execute this plan?") {
            println!("aborted");
            app.shutdown().await;
            return Ok(3);
        }
    }

    let printer = spawn_console_printer(&app);
    let intent = format!("{idea}\n\nAgreed plan:\n{outline}");
    let summary = app.run_intent(&intent).await;
    println!("\n{}", summary.render());
    let code = summary.reason.exit_code();
    app.shutdown().await;
    printer.abort();
    Ok(code)
}

// ── commit / review ──────────────────────────────────────────────────────────

async fn staged_diff(root: &Path) -> anyhow::Result<String> {
    let out = tokio::process::Command::new("git")
        .args(["diff", "--cached"])
        .current_dir(root)
        .output()
        .await
        .context("running git diff --cached")?;
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

async fn run_commit(config: Arc<Config>, root: PathBuf) -> anyhow::Result<i32> {
    let diff = staged_diff(&root).await?;
    if diff.trim().is_empty() {
        eprintln!("nothing staged; run `git add` first");
        return Ok(1);
    }
    let app = App::assemble(config, root.clone(), false).await?;
    let req = CompletionRequest {
        messages: vec![
            Message::system(
                "Write a conventional commit message for the staged diff: a \
                 concise imperative subject line under 72 characters, then an \
                 optional body. Output the message only.",
            ),
            Message::user(diff),
        ],
        tools: vec![],
        stream: false,
        annotation: TurnKind::Control,
    };
    let message = match app.client.complete(req, None, &app.cancel).await {
        Ok(c) => c.text.trim().to_string(),
        Err(e) => {
            eprintln!("commit message generation failed: {e}");
            app.shutdown().await;
            return Ok(1);
        }
    };
    println!("{message}\n");

    let status = tokio::process::Command::new("git")
        .args(["commit", "-m", &message])
        .current_dir(&root)
        .status()
        .await
        .context("running git commit")?;
    app.shutdown().await;
    Ok(if status.success() { 0 } else { 1 })
}

async fn run_review(config: Arc<Config>, root: PathBuf) -> anyhow::Result<i32> {
    let diff = staged_diff(&root).await?;
    if diff.trim().is_empty() {
        eprintln!("nothing staged to review");
        return Ok(1);
    }
    let app = App::assemble(config, root, false).await?;
    let req = CompletionRequest {
        messages: vec![
            Message::system(
                "Review the staged diff. Report concrete defects and risks, \
                 most severe first, each with file and line. Be brief.",
            ),
            Message::user(diff),
        ],
        tools: vec![],
        stream: false,
        annotation: TurnKind::Control,
    };
    let code = match app.client.complete(req, None, &app.cancel).await {
        Ok(c) => {
            println!("{}", c.text);
            0
        }
        Err(e) => {
            eprintln!("review failed: {e}");
            1
        }
    };
    app.shutdown().await;
    Ok(code)
}

// ── fix ──────────────────────────────────────────────────────────────────────

async fn run_fix(config: Arc<Config>, root: PathBuf, command: &str) -> anyhow::Result<i32> {
    let shell_bin = config.tools.shell.clone();
    println!("$ {command}");
    let out = tokio::process::Command::new(&shell_bin)
        .arg("-c")
        .arg(command)
        .current_dir(&root)
        .output()
        .await
        .with_context(|| format!("running {command}"))?;
    if out.status.success() {
        println!("command succeeded; nothing to fix");
        return Ok(0);
    }
    let captured = format!(
        "{}\n{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    let intent = format!(
        "The command `{command}` fails with exit code {}. Fix the cause. \
         Command output:\n{}",
        out.status.code().unwrap_or(-1),
        captured.trim()
    );
    run_direct(config, root, &intent).await
}

// ── process (plan files) ─────────────────────────────────────────────────────

async fn run_process(config: Arc<Config>, root: PathBuf, file: &Path) -> anyhow::Result<i32> {
    let plan = ledit_core::PlanFile::load(file)?;
    println!("goal: {}", plan.goal);

    let app = App::assemble(config, root.clone(), true).await?;
    let printer = spawn_console_printer(&app);

    let mut failed = false;
    let order: Vec<(String, String, String)> = plan
        .execution_order()?
        .into_iter()
        .map(|step| {
            let role = plan
                .agents
                .iter()
                .find(|a| a.id == step.agent)
                .map(|a| a.role.clone())
                .unwrap_or_else(|| "coder".into());
            (step.id.clone(), role, step.task.clone())
        })
        .collect();
    for (id, role, task) in order {
        println!("\n== step {id} ({role}) ==");
        match app
            .dispatcher
            .spawn(&role, &task, plan.settings.max_iterations_per_step)
            .await
        {
            Ok(report) => println!("{report}"),
            Err((kind, msg)) => {
                eprintln!("step {id} failed ({kind}): {msg}");
                failed = true;
                break;
            }
        }
    }

    if !failed {
        if let Some(validation) = &plan.validation {
            println!("\n== validation ==");
            let code = ledit_shell::run_direct(validation, &app.config.tools.shell, &root).await;
            failed = code != 0;
        }
    }

    app.shutdown().await;
    printer.abort();
    Ok(if failed { 1 } else { 0 })
}

// ── operational utilities ────────────────────────────────────────────────────

fn run_rollback(root: &Path, revision: &str) -> anyhow::Result<i32> {
    let control = ControlDir::new(root);
    RevisionLog::rollback(&control.revisions_dir(), root, revision)?;
    println!("rolled back {revision}");
    Ok(0)
}

fn run_log(root: &Path, lines: usize) -> anyhow::Result<i32> {
    let control = ControlDir::new(root);
    let text = std::fs::read_to_string(control.log_file()).unwrap_or_default();
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{line}");
    }
    Ok(0)
}

fn run_insights(root: &Path) -> anyhow::Result<i32> {
    let control = ControlDir::new(root);
    let text = std::fs::read_to_string(control.root().join("insights.jsonl")).unwrap_or_default();
    let mut runs = 0u64;
    let mut completed = 0u64;
    let mut tokens = 0u64;
    let mut cost = 0.0f64;
    for line in text.lines() {
        let Ok(summary) = serde_json::from_str::<ledit_core::RunSummary>(line) else {
            continue;
        };
        runs += 1;
        if matches!(summary.reason, TerminationReason::Completed) {
            completed += 1;
        }
        tokens += summary.budgets.tokens_used;
        cost += summary.budgets.cost_used;
    }
    if runs == 0 {
        println!("no recorded runs yet");
    } else {
        println!("runs: {runs}   completed: {completed}");
        println!("total tokens: {tokens}   total cost: ${cost:.4}");
    }
    Ok(0)
}

fn run_instances(root: &Path, providers: bool) -> anyhow::Result<i32> {
    if providers {
        for d in ledit_model::list_drivers() {
            let key = d.default_api_key_env.unwrap_or("-");
            println!("{:<12} {:<18} {}  [{key}]", d.id, d.name, d.description);
        }
        return Ok(0);
    }
    let control = ControlDir::new(root);
    let registry = ledit_core::InstanceRegistry::new(&control);
    let list = registry.list();
    if list.is_empty() {
        println!("no running instances");
    } else {
        for i in list {
            let port = i
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "pid {:<8} port {:<6} up {}s",
                i.pid,
                port,
                i.uptime().num_seconds()
            );
        }
    }
    Ok(0)
}

async fn run_validate(
    config: Arc<Config>,
    root: PathBuf,
    command: Option<String>,
) -> anyhow::Result<i32> {
    use ledit_tools::{Tool, ToolCall};
    let ctx = ledit_tools::ExecContext::new(&root, Arc::new(config.tools.clone()));
    let mut args = serde_json::json!({});
    if let Some(cmd) = command {
        args = serde_json::json!({ "command": cmd });
    }
    let call = ToolCall {
        id: "cli-validate".into(),
        name: "validate".into(),
        args,
    };
    let result = ledit_tools::builtin::ValidateTool.execute(&call, &ctx).await;
    println!("{}", result.output);
    Ok(if result.success { 0 } else { 1 })
}

// ── interactive session ──────────────────────────────────────────────────────

/// What the reader thread is currently asking the user.
enum PromptState {
    /// Normal prompt: classify the next submission.
    Query,
    /// Awaiting y/N for a detected shell command.
    ConfirmShell(String),
}

async fn run_interactive(config: Arc<Config>, root: PathBuf) -> anyhow::Result<i32> {
    let mut app = App::assemble(Arc::clone(&config), root.clone(), true).await?;
    let mut web_rx = app.web_commands.take();
    let app = Arc::new(app);
    let printer = spawn_console_printer(&app);

    println!("ledit interactive - /help for commands, ctrl-d to exit");
    if let Some(port) = app.web_port {
        println!("web UI: http://127.0.0.1:{port}");
    }

    // rustyline blocks, so it lives on its own thread; submissions flow in
    // through a channel and the next prompt is requested through another.
    let mut shell = Shell::new(&app.control)?;
    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<ReadOutcome>(1);
    let (prompt_tx, prompt_rx) = std::sync::mpsc::channel::<String>();
    std::thread::spawn(move || {
        while let Ok(prompt) = prompt_rx.recv() {
            let outcome = shell.read(&prompt);
            let eof = matches!(outcome, ReadOutcome::Eof);
            if line_tx.blocking_send(outcome).is_err() || eof {
                break;
            }
        }
        shell.save_history();
    });

    let mut state = PromptState::Query;
    let mut interrupted_once = false;
    let mut session_tokens: u64 = 0;
    let mut session_cost: f64 = 0.0;
    // At most one agent run in flight; the bool marks a console-initiated
    // run whose completion should re-issue the prompt.
    let mut running: Option<(tokio::task::JoinHandle<ledit_core::RunSummary>, bool)> = None;
    let _ = prompt_tx.send("ledit> ".into());

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(outcome) = line else { break };
                match outcome {
                    ReadOutcome::Eof => break,
                    ReadOutcome::Interrupted => {
                        if running.is_some() {
                            // Interrupt the run, not the session.
                            app.cancel_current_run();
                            let _ = prompt_tx.send("ledit> ".into());
                        } else if interrupted_once {
                            // Graceful shutdown with a force-exit watchdog.
                            let _watchdog = ShutdownWatchdog::arm(std::time::Duration::from_secs(5));
                            break;
                        } else {
                            interrupted_once = true;
                            println!("(ctrl-c again to exit)");
                            let _ = prompt_tx.send("ledit> ".into());
                        }
                    }
                    ReadOutcome::Line(line) => {
                        interrupted_once = false;
                        let action = match std::mem::replace(&mut state, PromptState::Query) {
                            PromptState::ConfirmShell(command) => {
                                if matches!(line.trim(), "y" | "Y" | "yes") {
                                    let code = ledit_shell::run_direct(
                                        &command, &config.tools.shell, &root,
                                    ).await;
                                    println!("[exit {code}]");
                                    Some("ledit> ".to_string())
                                } else {
                                    println!("skipped; sending to the agent instead");
                                    running = Some((spawn_run(&app, command), true));
                                    None
                                }
                            }
                            PromptState::Query => match ledit_shell::classify(&line) {
                                Submission::Empty => Some("ledit> ".to_string()),
                                Submission::ForcedShell(command) => {
                                    let code = ledit_shell::run_direct(
                                        &command, &config.tools.shell, &root,
                                    ).await;
                                    println!("[exit {code}]");
                                    Some("ledit> ".to_string())
                                }
                                Submission::ShellCommand(command) => {
                                    if config.agent.skip_prompt {
                                        let code = ledit_shell::run_direct(
                                            &command, &config.tools.shell, &root,
                                        ).await;
                                        println!("[exit {code}]");
                                        Some("ledit> ".to_string())
                                    } else {
                                        state = PromptState::ConfirmShell(command.clone());
                                        Some(format!("run `{command}` directly? [y/N] "))
                                    }
                                }
                                Submission::Slash { name, args } => {
                                    match ledit_shell::dispatch(&name, &args) {
                                        SlashAction::Output(text) => print!("{text}"),
                                        SlashAction::ShowStats => println!(
                                            "session tokens: {session_tokens}   cost: ${session_cost:.4}"
                                        ),
                                        SlashAction::Exit => break,
                                        SlashAction::Unknown(name) => {
                                            println!("unknown command /{name}; try /help")
                                        }
                                    }
                                    Some("ledit> ".to_string())
                                }
                                Submission::Agent(intent) => {
                                    if running.is_some() {
                                        println!("a run is already in progress");
                                        Some("ledit> ".to_string())
                                    } else {
                                        running = Some((spawn_run(&app, intent), true));
                                        None
                                    }
                                }
                            },
                        };
                        if let Some(prompt) = action {
                            let _ = prompt_tx.send(prompt);
                        }
                    }
                }
            }
            summary = await_running(&mut running) => {
                let (summary, from_console) = summary;
                session_tokens += summary.budgets.tokens_used;
                session_cost += summary.budgets.cost_used;
                println!("\n{}", summary.render());
                // A process-level interrupt ends the session at this
                // iteration boundary.
                if app.cancel.is_cancelled() {
                    break;
                }
                if from_console {
                    let _ = prompt_tx.send("ledit> ".into());
                }
            }
            Some(cmd) = conditional_recv(&mut web_rx) => {
                match cmd {
                    ControlCommand::SubmitQuery { intent } => {
                        if running.is_some() {
                            println!("\n[web] rejected '{intent}': a run is in progress");
                        } else {
                            println!("\n[web] {intent}");
                            running = Some((spawn_run(&app, intent), false));
                        }
                    }
                    ControlCommand::CancelQuery => app.cancel_current_run(),
                }
            }
        }
    }

    app.shutdown().await;
    printer.abort();
    Ok(0)
}

fn spawn_run(app: &Arc<App>, intent: String) -> tokio::task::JoinHandle<ledit_core::RunSummary> {
    let app = Arc::clone(app);
    tokio::spawn(async move { app.run_intent(&intent).await })
}

/// Resolve when the in-flight run finishes; pending forever when idle.
/// The handle stays in `running` until completion so that losing the race
/// in a `select!` never orphans the run.
async fn await_running(
    running: &mut Option<(tokio::task::JoinHandle<ledit_core::RunSummary>, bool)>,
) -> (ledit_core::RunSummary, bool) {
    let result = match running.as_mut() {
        Some((handle, _)) => handle.await,
        None => return std::future::pending().await,
    };
    let (_, from_console) = running.take().expect("run handle present");
    match result {
        Ok(summary) => (summary, from_console),
        Err(e) => {
            // A panicked run must not kill the session.
            tracing::error!("agent run panicked: {e}");
            let summary = ledit_core::RunSummary {
                run_id: "panicked".into(),
                reason: TerminationReason::FatalError(e.to_string()),
                iterations: 0,
                budgets: Default::default(),
                wall_time_secs: 0,
                active_provider: None,
            };
            (summary, from_console)
        }
    }
}

/// `recv` that stays pending forever when there is no channel, so the
/// select arm simply never fires.
async fn conditional_recv(
    rx: &mut Option<tokio::sync::mpsc::Receiver<ControlCommand>>,
) -> Option<ControlCommand> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
