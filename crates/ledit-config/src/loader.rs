// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, warn};

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths(workspace_root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/ledit/config.json"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/ledit/config.json"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("ledit/config.json"));
    }

    // 3. Workspace-local
    paths.push(crate::ControlDir::new(workspace_root).config_file());

    paths
}

/// Load configuration for `workspace_root` by merging all discovered JSON
/// files, then an explicit file (`--config` flag or `LEDIT_CONFIG`), then
/// environment overrides.
pub fn load(workspace_root: &Path, explicit: Option<&Path>) -> anyhow::Result<Config> {
    let env_path = std::env::var("LEDIT_CONFIG").ok().map(PathBuf::from);
    let explicit = explicit.map(Path::to_path_buf).or(env_path);
    let mut cfg = load_from(
        &config_search_paths(workspace_root),
        explicit.as_deref(),
    )?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Merge the given layer files (missing ones are skipped) plus an optional
/// explicit file (which must exist) into a [`Config`].
pub fn load_from(layers: &[PathBuf], explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = Value::Object(serde_json::Map::new());

    for path in layers {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_json(&mut merged, read_layer(path)?);
        }
    }

    if let Some(p) = explicit {
        debug!(path = %p.display(), "loading explicit config");
        merge_json(&mut merged, read_layer(p)?);
    }

    let config: Config = if matches!(merged, Value::Object(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_json::from_value(merged).unwrap_or_else(|e| {
            warn!("config did not deserialize cleanly, using defaults: {e}");
            Config::default()
        })
    };
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_json(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(Value::Object(serde_json::Map::new()));
                merge_json(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Environment variables override file-level settings so that CI pipelines
/// and one-off invocations can flip behaviour without editing config.
fn apply_env_overrides(cfg: &mut Config) {
    if env_flag("LEDIT_DRY_RUN") {
        cfg.agent.dry_run = true;
    }
    if env_flag("LEDIT_NO_STREAM") {
        cfg.agent.stream = false;
    }
    if env_flag("LEDIT_NO_SUBAGENTS") {
        cfg.agent.subagents_enabled = false;
    }
    if env_flag("CI") {
        cfg.agent.skip_prompt = true;
        cfg.web.enabled = false;
    }
    if let Ok(shell) = std::env::var("LEDIT_SHELL") {
        if !shell.is_empty() {
            cfg.tools.shell = shell;
        }
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(v.as_str(), "" | "0" | "false" | "no"),
        Err(_) => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
